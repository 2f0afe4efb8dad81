//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the resource
//! store, work queue, worker pool, watchers, sweeper and probe server
//! together.

use std::sync::Arc;

use kube::{Client, ResourceExt};
use resource_store::{KubeResourceStore, ObjectKind, ResourceStore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::queue::WorkQueue;
use crate::reconciler::{Reconciler, Requeue, bounded};
use crate::server::{self, ServerState};
use crate::sweeper::Sweeper;
use crate::watcher::Watcher;

/// Take keys off the queue and reconcile them until the queue shuts down
pub(crate) async fn run_worker(queue: WorkQueue, reconciler: Arc<Reconciler>) {
    while let Some(key) = queue.next().await {
        let requeue = reconciler.reconcile(&key).await;
        queue.done(&key);
        match requeue {
            Requeue::Never => {}
            Requeue::Now => queue.enqueue(&key),
            Requeue::After(delay) => queue.enqueue_after(&key, delay),
        }
    }
}

/// Main controller for development environments.
pub struct Controller {
    queue: WorkQueue,
    workers: Vec<JoinHandle<()>>,
    environment_watcher: JoinHandle<Result<(), ControllerError>>,
    deployment_watcher: JoinHandle<Result<(), ControllerError>>,
    endpoints_watcher: JoinHandle<Result<(), ControllerError>>,
    sweeper: JoinHandle<Result<(), ControllerError>>,
    server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller against the cluster from the default kubeconfig.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing environment controller");

        let client = Client::try_default().await?;
        let store: Arc<dyn ResourceStore> = Arc::new(KubeResourceStore::new(client));
        Self::with_store(store, config).await
    }

    /// Creates a controller over any resource store
    pub async fn with_store(store: Arc<dyn ResourceStore>, config: ControllerConfig) -> Result<Self, ControllerError> {
        let metrics = Arc::new(Metrics::new()?);
        let server_state = ServerState::new(metrics.clone());
        let metrics_addr = config.metrics_addr.clone();
        let server = {
            let state = server_state.clone();
            tokio::spawn(async move { server::serve(&metrics_addr, state).await })
        };

        let reconciler = Arc::new(Reconciler::new(store.clone(), config.clone(), metrics));
        let queue = WorkQueue::new();

        // Startup resync: every environment is reconciled once, and one sweep
        // picks up namespaces whose environment disappeared while we were down
        let environments = bounded(config.store_timeout(), store.list_environments()).await?;
        info!("Resyncing {} environments", environments.len());
        for env in &environments {
            if let Some(id) = env.environment_id() {
                reconciler.remember_name(id, &env.name_any());
            }
            queue.enqueue(&env.name_any());
        }
        let sweeper_instance = Sweeper::new(reconciler.clone(), queue.clone());
        let report = sweeper_instance.sweep_once(chrono::Utc::now()).await?;
        debug!("Startup sweep: {:?}", report);

        let workers = (0..config.workers)
            .map(|_| tokio::spawn(run_worker(queue.clone(), reconciler.clone())))
            .collect();
        info!("Started {} workers", config.workers);

        let environment_watcher = {
            let watcher = Watcher::new(reconciler.clone(), queue.clone());
            tokio::spawn(async move { watcher.watch_environments().await })
        };
        let deployment_watcher = {
            let watcher = Watcher::new(reconciler.clone(), queue.clone());
            tokio::spawn(async move { watcher.watch_objects(ObjectKind::Deployment).await })
        };
        let endpoints_watcher = {
            let watcher = Watcher::new(reconciler.clone(), queue.clone());
            tokio::spawn(async move { watcher.watch_objects(ObjectKind::Endpoints).await })
        };
        let sweep_interval = config.sweep_interval();
        let sweeper = tokio::spawn(async move { sweeper_instance.run(sweep_interval).await });

        server_state.set_ready(true);

        Ok(Self {
            queue,
            workers,
            environment_watcher,
            deployment_watcher,
            endpoints_watcher,
            sweeper,
            server,
        })
    }

    /// Runs the controller until a background task exits.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Environment controller running");

        // Watchers, sweeper and server run forever; any exit is fatal
        let result = tokio::select! {
            result = &mut self.environment_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("DevelopmentEnvironment watcher panicked: {}", e)))
            }
            result = &mut self.deployment_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Deployment watcher panicked: {}", e)))
            }
            result = &mut self.endpoints_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Endpoints watcher panicked: {}", e)))
            }
            result = &mut self.sweeper => {
                result.map_err(|e| ControllerError::Watch(format!("Sweeper panicked: {}", e)))
            }
            result = &mut self.server => {
                result.map_err(|e| ControllerError::Watch(format!("Probe server panicked: {}", e)))
            }
        };

        self.queue.shutdown();
        for worker in self.workers {
            if let Err(e) = worker.await {
                info!("Worker exited abnormally: {}", e);
            }
        }
        result?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use crds::EnvironmentState;
    use resource_store::MockResourceStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_workers_drive_queue_to_running() {
        let store = MockResourceStore::with_auto_ready();
        store.add_environment(create_test_environment("scratch", create_test_spec()));
        let reconciler = create_test_reconciler(&store, create_test_config());
        let queue = WorkQueue::new();
        let worker = tokio::spawn(run_worker(queue.clone(), reconciler));

        queue.enqueue("scratch");
        for _ in 0..100 {
            if store.environment_state("scratch") == Some(EnvironmentState::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        queue.shutdown();
        worker.await.unwrap();

        assert_eq!(store.environment_state("scratch"), Some(EnvironmentState::Running));
    }

    #[tokio::test]
    async fn test_conflict_is_requeued_by_worker() {
        let store = MockResourceStore::with_auto_ready();
        store.add_environment(create_test_environment("scratch", create_test_spec()));
        store.fail_next(
            resource_store::StoreOp::Apply,
            Some(ObjectKind::Deployment),
            resource_store::FailureKind::Conflict,
            2,
        );
        let reconciler = create_test_reconciler(&store, create_test_config());
        let queue = WorkQueue::new();
        let worker = tokio::spawn(run_worker(queue.clone(), reconciler));

        queue.enqueue("scratch");
        for _ in 0..100 {
            if store.environment_state("scratch") == Some(EnvironmentState::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        queue.shutdown();
        worker.await.unwrap();

        assert_eq!(store.environment_state("scratch"), Some(EnvironmentState::Running));
    }
}
