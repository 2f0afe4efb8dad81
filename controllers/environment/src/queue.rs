//! Work queue of environment keys
//!
//! Coalescing: a key is queued at most once. A key that is enqueued while a
//! worker holds it is marked dirty and re-queued when the worker calls
//! `done`, so at most one reconcile per key is ever in flight.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<String>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    dirty: HashSet<String>,
    /// Pending delayed enqueue per key; only the latest timer counts
    delayed: HashMap<String, Instant>,
    shutdown: bool,
}

/// De-duplicating work queue shared by watchers, the sweeper and workers
#[derive(Debug, Clone, Default)]
pub struct WorkQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue `key` for reconciliation
    pub fn enqueue(&self, key: &str) {
        let mut state = self.lock();
        if state.shutdown {
            return;
        }
        state.delayed.remove(key);
        if state.in_flight.contains(key) {
            state.dirty.insert(key.to_string());
            return;
        }
        if state.queued.insert(key.to_string()) {
            state.ready.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Queue `key` after `delay`. A later call for the same key replaces the
    /// pending timer; an immediate `enqueue` cancels it.
    pub fn enqueue_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(key);
            return;
        }
        let deadline = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutdown {
                return;
            }
            state.delayed.insert(key.to_string(), deadline);
        }

        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let current = {
                let mut state = queue.lock();
                if state.delayed.get(&key) == Some(&deadline) {
                    state.delayed.remove(&key);
                    true
                } else {
                    false
                }
            };
            if current {
                queue.enqueue(&key);
            }
        });
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The caller owns the key until it calls `done`.
    pub async fn next(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.in_flight.insert(key.clone());
                    let more = !state.ready.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release `key`; re-queues it if it was enqueued while in flight
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.in_flight.remove(key);
        if state.dirty.remove(key) && !state.shutdown && state.queued.insert(key.to_string()) {
            state.ready.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    /// Keys waiting to be processed (not counting in-flight or delayed keys)
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.lock().in_flight.contains(key)
    }
}
