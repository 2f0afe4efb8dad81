//! Resource watchers.
//!
//! Turns watch events into queue keys. Environment events only enqueue when
//! something the reconciler acts on changed (generation, deletion, delete
//! annotation), so status writes do not feed back into the queue. Derived
//! object events are mapped back to their environment through the
//! environment-id label.

use std::collections::HashMap;
use std::sync::Arc;

use crds::{DevelopmentEnvironment, EnvironmentState, labels};
use futures::StreamExt;
use kube::ResourceExt;
use resource_store::{NativeObject, ObjectKind, WatchEvent};
use tracing::{debug, info, warn};

use crate::error::ControllerError;
use crate::queue::WorkQueue;
use crate::reconciler::{DeleteReason, Reconciler, tombstone_key};

/// The parts of an environment whose change warrants a reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
struct Observed {
    generation: Option<i64>,
    being_deleted: bool,
    delete_requested: bool,
}

impl Observed {
    fn of(env: &DevelopmentEnvironment) -> Self {
        Self {
            generation: env.metadata.generation,
            being_deleted: env.is_being_deleted(),
            delete_requested: env.delete_requested(),
        }
    }
}

/// Watches environments and derived objects, feeding the work queue.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    queue: WorkQueue,
    observed: HashMap<String, Observed>,
}

impl Watcher {
    pub fn new(reconciler: Arc<Reconciler>, queue: WorkQueue) -> Self {
        Self {
            reconciler,
            queue,
            observed: HashMap::new(),
        }
    }

    /// Watch DevelopmentEnvironment resources until the stream ends
    pub async fn watch_environments(mut self) -> Result<(), ControllerError> {
        info!("Starting DevelopmentEnvironment watcher");
        let mut events = self.reconciler.store().watch_environments();
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    self.handle_environment_event(event);
                }
                Err(e) => warn!("DevelopmentEnvironment watch error: {}", e),
            }
        }
        Err(ControllerError::Watch("DevelopmentEnvironment watch ended".to_string()))
    }

    /// Watch derived objects of `kind` until the stream ends
    pub async fn watch_objects(self, kind: ObjectKind) -> Result<(), ControllerError> {
        info!("Starting {} watcher", kind);
        let mut events = self.reconciler.store().watch(kind, &labels::managed_selector());
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    self.handle_object_event(&event);
                }
                Err(e) => warn!("{} watch error: {}", kind, e),
            }
        }
        Err(ControllerError::Watch(format!("{} watch ended", kind)))
    }

    /// Returns the queue key enqueued for `event`, if any
    fn handle_environment_event(&mut self, event: WatchEvent<DevelopmentEnvironment>) -> Option<String> {
        let deleted = event.is_deleted();
        let env = event.into_object();
        let name = env.name_any();
        let id = env.environment_id().map(str::to_string);
        if let Some(id) = &id {
            self.reconciler.remember_name(id, &name);
        }

        if deleted {
            self.observed.remove(&name);
            // Removed without going through teardown; clean up by id
            if env.state() != EnvironmentState::Deleted
                && let Some(id) = id
            {
                info!("Environment {} was removed before teardown, cleaning up by id", name);
                self.reconciler.add_tombstone(&id);
                self.reconciler.request_deletion(&id, DeleteReason::Explicit);
                let key = tombstone_key(&id);
                self.queue.enqueue(&key);
                return Some(key);
            }
            return None;
        }

        let observed = Observed::of(&env);
        if self.observed.get(&name) == Some(&observed) {
            debug!("Ignoring status-only update of {}", name);
            return None;
        }
        self.observed.insert(name.clone(), observed);
        self.queue.enqueue(&name);
        Some(name)
    }

    /// Returns the environment name enqueued for `event`, if any
    fn handle_object_event(&self, event: &WatchEvent<NativeObject>) -> Option<String> {
        let object = event.object();
        let id = object.labels()?.get(labels::ENVIRONMENT_ID_LABEL)?;
        if self.reconciler.has_tombstone(id) {
            return None;
        }
        let name = self.reconciler.name_for(id)?;
        debug!("{} changed, reconciling {}", object.key(), name);
        self.queue.enqueue(&name);
        Some(name)
    }
}
