//! Periodic sweep over all environments
//!
//! Requests teardown for environments past their TTL or idle timeout, keeps
//! the per-state gauge in line with the store, and finds managed namespaces
//! whose environment no longer exists.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crds::{DevelopmentEnvironment, EnvironmentState, labels};
use kube::ResourceExt;
use resource_store::ObjectKind;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::ControllerError;
use crate::queue::WorkQueue;
use crate::reconciler::{DeleteReason, Reconciler, bounded, tombstone_key};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepReason {
    Expired,
    Idle,
}

impl From<SweepReason> for DeleteReason {
    fn from(reason: SweepReason) -> Self {
        match reason {
            SweepReason::Expired => DeleteReason::Expired,
            SweepReason::Idle => DeleteReason::Idle,
        }
    }
}

/// Whether `env` is due for teardown at `now`
///
/// Expiry is inclusive: an environment whose `expiresAt` equals `now` is
/// expired. Idle detection only applies to environments that are up.
pub fn evaluate(
    env: &DevelopmentEnvironment,
    now: DateTime<Utc>,
    idle_timeout: Option<chrono::Duration>,
) -> Option<SweepReason> {
    let status = env.status.as_ref()?;
    if status.state.is_tearing_down() {
        return None;
    }
    if let Some(expires_at) = status.expires_at
        && now >= expires_at
    {
        return Some(SweepReason::Expired);
    }
    if let Some(timeout) = idle_timeout
        && matches!(status.state, EnvironmentState::Running | EnvironmentState::Degraded)
    {
        let last_seen = env.last_activity().or(status.created_at)?;
        if now - last_seen >= timeout {
            return Some(SweepReason::Idle);
        }
    }
    None
}

/// What one sweep found
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub environments: usize,
    pub expired: usize,
    pub idle: usize,
    pub orphans: usize,
}

pub struct Sweeper {
    reconciler: Arc<Reconciler>,
    queue: WorkQueue,
}

impl Sweeper {
    pub fn new(reconciler: Arc<Reconciler>, queue: WorkQueue) -> Self {
        Self { reconciler, queue }
    }

    /// One pass over the store
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, ControllerError> {
        let store = self.reconciler.store();
        let timeout = self.reconciler.config().store_timeout();

        // Namespaces are listed first, so a namespace created after the
        // environment listing always has its environment in that listing
        let namespaces = bounded(timeout, store.list(ObjectKind::Namespace, &labels::managed_selector())).await?;
        let environments = bounded(timeout, store.list_environments()).await?;

        let mut report = SweepReport {
            environments: environments.len(),
            ..Default::default()
        };
        let idle_timeout = self.reconciler.config().idle_timeout();
        let mut known = HashSet::new();
        let mut counts: HashMap<EnvironmentState, i64> = HashMap::new();

        for env in &environments {
            let name = env.name_any();
            *counts.entry(env.state()).or_default() += 1;
            let Some(id) = env.environment_id() else {
                continue;
            };
            known.insert(id.to_string());
            self.reconciler.remember_name(id, &name);

            let Some(reason) = evaluate(env, now, idle_timeout) else {
                continue;
            };
            if self.reconciler.request_deletion(id, reason.into()) {
                match reason {
                    SweepReason::Expired => report.expired += 1,
                    SweepReason::Idle => report.idle += 1,
                }
            }
            self.queue.enqueue(&name);
        }

        for namespace in &namespaces {
            let Some(id) = namespace.labels().and_then(|l| l.get(labels::ENVIRONMENT_ID_LABEL)) else {
                continue;
            };
            if known.contains(id) {
                continue;
            }
            if self.reconciler.add_tombstone(id) {
                warn!("Namespace {} belongs to no environment, tearing it down", namespace.name());
            }
            self.queue.enqueue(&tombstone_key(id));
            report.orphans += 1;
        }

        let counts: Vec<_> = counts.into_iter().collect();
        self.reconciler.metrics().set_state_counts(&counts);
        Ok(report)
    }

    /// Sweep every `interval` until the task is dropped
    pub async fn run(self, interval: Duration) -> Result<(), ControllerError> {
        info!("Starting sweeper (every {:?})", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.sweep_once(Utc::now()).await {
                Ok(report) => debug!("Sweep finished: {:?}", report),
                Err(e) => warn!("Sweep failed, retrying next interval: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::reconciler::Requeue;
    use crate::test_utils::*;
    use crds::DevelopmentEnvironmentStatus;
    use k8s_openapi::api::core::v1::Namespace;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use resource_store::{MockResourceStore, NativeObject};

    fn with_status(state: EnvironmentState, created_at: DateTime<Utc>, ttl_hours: i64) -> DevelopmentEnvironment {
        let mut env = create_test_environment("scratch", create_test_spec());
        env.status = Some(DevelopmentEnvironmentStatus {
            state,
            created_at: Some(created_at),
            expires_at: Some(created_at + chrono::Duration::hours(ttl_hours)),
            ..Default::default()
        });
        env
    }

    #[test]
    fn test_expiry_boundary() {
        let created = Utc::now();
        let env = with_status(EnvironmentState::Running, created, 1);
        let expires = created + chrono::Duration::hours(1);

        assert_eq!(evaluate(&env, expires - chrono::Duration::seconds(1), None), None);
        assert_eq!(evaluate(&env, expires, None), Some(SweepReason::Expired));
        assert_eq!(
            evaluate(&env, expires + chrono::Duration::seconds(1), None),
            Some(SweepReason::Expired)
        );
    }

    #[test]
    fn test_error_environments_expire_too() {
        let created = Utc::now() - chrono::Duration::hours(2);
        let env = with_status(EnvironmentState::Error, created, 1);
        assert_eq!(evaluate(&env, Utc::now(), None), Some(SweepReason::Expired));
    }

    #[test]
    fn test_tearing_down_is_skipped() {
        let created = Utc::now() - chrono::Duration::hours(2);
        for state in [EnvironmentState::Deleting, EnvironmentState::Deleted] {
            let env = with_status(state, created, 1);
            assert_eq!(evaluate(&env, Utc::now(), None), None);
        }
    }

    #[test]
    fn test_pending_without_status_is_skipped() {
        let env = create_test_environment("scratch", create_test_spec());
        assert_eq!(evaluate(&env, Utc::now(), Some(chrono::Duration::minutes(1))), None);
    }

    #[test]
    fn test_idle_uses_last_activity() {
        let now = Utc::now();
        let mut env = with_status(EnvironmentState::Running, now - chrono::Duration::hours(10), 24);
        let idle = Some(chrono::Duration::hours(4));

        // No activity reported, so creation time counts
        assert_eq!(evaluate(&env, now, idle), Some(SweepReason::Idle));

        env.annotations_mut().insert(
            labels::LAST_ACTIVITY_ANNOTATION.to_string(),
            (now - chrono::Duration::hours(1)).to_rfc3339(),
        );
        assert_eq!(evaluate(&env, now, idle), None);
        assert_eq!(evaluate(&env, now, None), None);
    }

    #[test]
    fn test_idle_ignores_environments_still_creating() {
        let now = Utc::now();
        let env = with_status(EnvironmentState::Creating, now - chrono::Duration::hours(10), 24);
        assert_eq!(evaluate(&env, now, Some(chrono::Duration::hours(1))), None);
    }

    #[tokio::test]
    async fn test_sweep_requests_deletion_once() {
        let store = MockResourceStore::with_auto_ready();
        store.add_environment(create_test_environment("scratch", create_test_spec()));
        let reconciler = create_test_reconciler(&store, create_test_config());
        reconciler.reconcile("scratch").await;
        let queue = WorkQueue::new();
        let sweeper = Sweeper::new(reconciler.clone(), queue.clone());

        let expires_at = store.environment("scratch").unwrap().status.unwrap().expires_at.unwrap();

        let report = sweeper.sweep_once(expires_at - chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(report.expired, 0);
        assert!(queue.is_empty());

        let report = sweeper.sweep_once(expires_at + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(queue.len(), 1);

        // The reconciler noticing expiry as well does not add a second request
        let report = sweeper.sweep_once(expires_at + chrono::Duration::seconds(2)).await.unwrap();
        assert_eq!(report.expired, 0);
        assert_eq!(reconciler.deletion_requested(TEST_UID), Some(DeleteReason::Expired));

        let key = queue.next().await.unwrap();
        assert_eq!(reconciler.reconcile(&key).await, Requeue::Never);
        assert_eq!(store.environment_state("scratch"), Some(EnvironmentState::Deleted));
        assert_eq!(
            store
                .status_writes("scratch")
                .iter()
                .filter(|s| **s == EnvironmentState::Deleting)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_rejected_environment_expires() {
        let store = MockResourceStore::with_auto_ready();
        let mut spec = create_test_spec();
        spec.base_image = "custom".to_string();
        store.add_environment(create_test_environment("scratch", spec));
        let reconciler = create_test_reconciler(&store, create_test_config());
        reconciler.reconcile("scratch").await;

        let status = store.environment("scratch").unwrap().status.unwrap();
        assert_eq!(status.state, EnvironmentState::Error);
        let created_at = status.created_at.unwrap();
        assert_eq!(status.expires_at, Some(created_at + chrono::Duration::hours(24)));

        let queue = WorkQueue::new();
        let sweeper = Sweeper::new(reconciler.clone(), queue.clone());
        let report = sweeper
            .sweep_once(created_at + chrono::Duration::hours(25))
            .await
            .unwrap();
        assert_eq!(report.expired, 1);

        let key = queue.next().await.unwrap();
        reconciler.reconcile(&key).await;
        assert_eq!(store.environment_state("scratch"), Some(EnvironmentState::Deleted));
    }

    #[tokio::test]
    async fn test_sweep_updates_state_gauge() {
        let store = MockResourceStore::with_auto_ready();
        store.add_environment(create_test_environment("scratch", create_test_spec()));
        store.add_environment(create_test_environment_with_uid(
            "other",
            "7c1d2e3f-0000-4000-8000-000000000001",
            create_test_spec(),
        ));
        let reconciler = create_test_reconciler(&store, create_test_config());
        reconciler.reconcile("scratch").await;
        let sweeper = Sweeper::new(reconciler.clone(), WorkQueue::new());

        let report = sweeper.sweep_once(Utc::now()).await.unwrap();

        assert_eq!(report.environments, 2);
        assert_eq!(reconciler.metrics().state_count(EnvironmentState::Running), 1);
        assert_eq!(reconciler.metrics().state_count(EnvironmentState::Pending), 1);
    }

    #[tokio::test]
    async fn test_orphaned_namespace_is_torn_down() {
        let store = MockResourceStore::new();
        let orphan_id = "0badc0de-1111-4222-8333-444455556666";
        let labels = BTreeMap::from([
            (labels::MANAGED_BY_LABEL.to_string(), labels::MANAGED_BY_VALUE.to_string()),
            (labels::ENVIRONMENT_ID_LABEL.to_string(), orphan_id.to_string()),
        ]);
        store.insert_object(NativeObject::Namespace(Namespace {
            metadata: ObjectMeta {
                name: Some("dev-env-0badc0de".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }));
        let reconciler = create_test_reconciler(&store, create_test_config());
        let queue = WorkQueue::new();
        let sweeper = Sweeper::new(reconciler.clone(), queue.clone());

        let report = sweeper.sweep_once(Utc::now()).await.unwrap();

        assert_eq!(report.orphans, 1);
        assert!(reconciler.has_tombstone(orphan_id));
        let key = queue.next().await.unwrap();
        assert_eq!(key, tombstone_key(orphan_id));
        assert_eq!(reconciler.reconcile(&key).await, Requeue::Never);
        assert!(store.objects().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_surfaces_list_failures() {
        let store = MockResourceStore::new();
        store.fail_next(
            resource_store::StoreOp::ListEnvironments,
            None,
            resource_store::FailureKind::Transient,
            1,
        );
        let reconciler = create_test_reconciler(&store, create_test_config());
        let sweeper = Sweeper::new(reconciler, WorkQueue::new());

        assert!(sweeper.sweep_once(Utc::now()).await.is_err());
    }
}
