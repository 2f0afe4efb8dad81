//! Reconciliation logic for DevelopmentEnvironment resources.
//!
//! One call to `reconcile` is one attempt for one queue key. Keys are
//! environment names, or `tombstone/<id>` for environments that vanished
//! before their objects were torn down. The work queue guarantees that a key
//! is never reconciled twice at the same time.

pub mod lifecycle;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crds::{
    DevelopmentEnvironment, DevelopmentEnvironmentStatus, EnvironmentState, ErrorClass, LastError, labels,
};
use kube::ResourceExt;
use resource_store::{NativeObject, ResourceStore, StoreError};
use tracing::{debug, error, info, warn};

use crate::backoff::{RetryDecision, RetryPolicy};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::metrics::{Metrics, RESULT_ERROR, RESULT_SUCCESS};
use crate::status::{ReportOutcome, StatusReporter};
use crate::translator::{DesiredObjectSet, ObjectNames, translate};
use lifecycle::{Trigger, next_state};

/// Queue key prefix for teardown by environment id
pub const TOMBSTONE_PREFIX: &str = "tombstone/";

pub fn tombstone_key(environment_id: &str) -> String {
    format!("{}{}", TOMBSTONE_PREFIX, environment_id)
}

/// Why an environment is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    /// Resource deletion or the delete-requested annotation
    Explicit,
    Expired,
    Idle,
}

impl DeleteReason {
    fn message(self) -> &'static str {
        match self {
            DeleteReason::Explicit => "deletion requested",
            DeleteReason::Expired => "TTL expired",
            DeleteReason::Idle => "idle timeout exceeded",
        }
    }
}

/// When the key should be reconciled again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    Never,
    Now,
    After(Duration),
}

/// Retry bookkeeping for one environment; rebuilt from scratch on restart
#[derive(Debug, Clone, Default)]
struct ReconcileRecord {
    environment_id: String,
    attempt_count: u32,
    last_attempt_at: Option<DateTime<Utc>>,
    backoff_until: Option<DateTime<Utc>>,
    /// Start of the current run of quota rejections
    quota_since: Option<DateTime<Utc>>,
}

enum ApplyOutcome {
    Applied,
    /// A delete request arrived while applying
    Superseded,
}

/// Run a store call with the configured timeout
pub(crate) async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, ControllerError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(ControllerError::from),
        Err(_) => Err(ControllerError::Timeout(timeout)),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Reconciles DevelopmentEnvironment resources.
pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    config: ControllerConfig,
    policy: RetryPolicy,
    reporter: StatusReporter,
    metrics: Arc<Metrics>,
    /// Retry bookkeeping (environment id -> record)
    records: Arc<Mutex<HashMap<String, ReconcileRecord>>>,
    /// Pending delete requests (environment id -> reason). Keyed by id so a
    /// recreated environment under the same name starts clean.
    deletion_requests: Arc<Mutex<HashMap<String, DeleteReason>>>,
    /// Environment ids awaiting teardown without a resource
    tombstones: Arc<Mutex<HashSet<String>>>,
    /// Environment id -> name, for events that only carry the id label
    names: Arc<Mutex<HashMap<String, String>>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ResourceStore>, config: ControllerConfig, metrics: Arc<Metrics>) -> Self {
        let reporter = StatusReporter::new(store.clone(), metrics.clone(), config.store_timeout());
        Self {
            policy: RetryPolicy::from_config(&config.retry),
            store,
            config,
            reporter,
            metrics,
            records: Arc::new(Mutex::new(HashMap::new())),
            deletion_requests: Arc::new(Mutex::new(HashMap::new())),
            tombstones: Arc::new(Mutex::new(HashSet::new())),
            names: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Record a delete request for an environment id. Returns false when one
    /// was already pending.
    pub fn request_deletion(&self, environment_id: &str, reason: DeleteReason) -> bool {
        let mut requests = lock(&self.deletion_requests);
        if requests.contains_key(environment_id) {
            return false;
        }
        info!("Delete requested for environment {} ({})", environment_id, reason.message());
        requests.insert(environment_id.to_string(), reason);
        true
    }

    pub fn deletion_requested(&self, environment_id: &str) -> Option<DeleteReason> {
        lock(&self.deletion_requests).get(environment_id).copied()
    }

    /// Mark an environment id for teardown without its resource. Returns
    /// false when already marked.
    pub fn add_tombstone(&self, environment_id: &str) -> bool {
        lock(&self.tombstones).insert(environment_id.to_string())
    }

    pub fn has_tombstone(&self, environment_id: &str) -> bool {
        lock(&self.tombstones).contains(environment_id)
    }

    /// Name of the environment with id `environment_id`, if seen before
    pub fn name_for(&self, environment_id: &str) -> Option<String> {
        lock(&self.names).get(environment_id).cloned()
    }

    pub fn remember_name(&self, environment_id: &str, name: &str) {
        lock(&self.names).insert(environment_id.to_string(), name.to_string());
    }

    async fn call<T, F>(&self, call: F) -> Result<T, ControllerError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        bounded(self.config.store_timeout(), call).await
    }

    /// One reconcile attempt for `key`
    pub async fn reconcile(&self, key: &str) -> Requeue {
        if let Some(environment_id) = key.strip_prefix(TOMBSTONE_PREFIX) {
            return self.reconcile_tombstone(environment_id).await;
        }

        let env = match self.call(self.store.get_environment(key)).await {
            Ok(Some(env)) => env,
            Ok(None) => {
                debug!("Environment {} no longer exists", key);
                self.forget_name(key);
                return Requeue::Never;
            }
            Err(e) => {
                warn!("Failed to read environment {}: {}", key, e);
                self.metrics.record_error(e.class());
                self.metrics.record_reconcile(RESULT_ERROR);
                return Requeue::After(self.config.health_poll_interval());
            }
        };

        let Some(environment_id) = env.environment_id().map(str::to_string) else {
            warn!("Environment {} has no uid, skipping", key);
            return Requeue::Never;
        };
        self.remember_name(&environment_id, key);

        let state = env.state();
        if state == EnvironmentState::Deleted {
            return Requeue::Never;
        }
        if let Some(reason) = self.delete_reason(&env, Utc::now()) {
            return self.reconcile_deletion(env, reason).await;
        }
        if state == EnvironmentState::Deleting {
            return self.reconcile_deletion(env, DeleteReason::Explicit).await;
        }
        if state == EnvironmentState::Error {
            debug!("Environment {} is in Error, waiting for deletion", key);
            return Requeue::Never;
        }
        self.reconcile_active(env, environment_id).await
    }

    /// Delete request from any source, recording it in the registry
    fn delete_reason(&self, env: &DevelopmentEnvironment, now: DateTime<Utc>) -> Option<DeleteReason> {
        let environment_id = env.environment_id()?;
        if env.is_being_deleted() || env.delete_requested() {
            self.request_deletion(environment_id, DeleteReason::Explicit);
            return Some(DeleteReason::Explicit);
        }
        if let Some(reason) = self.deletion_requested(environment_id) {
            return Some(reason);
        }
        let expired = env
            .status
            .as_ref()
            .and_then(|s| s.expires_at)
            .is_some_and(|expires_at| now >= expires_at);
        if expired {
            self.request_deletion(environment_id, DeleteReason::Expired);
            return Some(DeleteReason::Expired);
        }
        None
    }

    /// Whether an in-flight pass should stop creating and tear down instead
    fn superseded(&self, environment_id: &str) -> bool {
        self.deletion_requested(environment_id).is_some() || self.has_tombstone(environment_id)
    }

    async fn reconcile_active(&self, env: DevelopmentEnvironment, environment_id: String) -> Requeue {
        let name = env.name_any();
        let current = env.state();

        if let Some(wait) = self.backoff_remaining(&environment_id, Utc::now()) {
            debug!("Environment {} is backing off for {:?}", name, wait);
            return Requeue::After(wait);
        }

        let desired = match translate(&env, &self.config) {
            Ok(desired) => desired,
            Err(e) => {
                warn!("Environment {} has an invalid spec: {}", name, e);
                return self.handle_failure(&env, current, e.into()).await;
            }
        };

        let stored_fingerprint = env.status.as_ref().and_then(|s| s.spec_fingerprint.as_deref());
        if let Some(stored) = stored_fingerprint
            && stored != desired.fingerprint
        {
            let err = ControllerError::SpecInvalid(
                "immutable spec fields changed after creation; delete and recreate the environment".to_string(),
            );
            return self.handle_failure(&env, current, err).await;
        }

        // The finalizer goes on before anything exists that would need cleanup
        let mut env = if env.has_cleanup_finalizer() {
            env
        } else {
            match self.call(self.store.set_cleanup_finalizer(&env, true)).await {
                Ok(updated) => {
                    debug!("Added cleanup finalizer to {}", name);
                    updated
                }
                Err(e) => return self.handle_failure(&env, current, e).await,
            }
        };

        let created_at = env
            .status
            .as_ref()
            .and_then(|s| s.created_at)
            .or_else(|| creation_time(&env))
            .unwrap_or_else(Utc::now);

        let state = next_state(current, Trigger::Observed);
        if state != current {
            let status = self.desired_status(&env, &desired, state, created_at);
            match self.reporter.report(&name, status).await {
                Ok(ReportOutcome::Gone) => return Requeue::Never,
                Ok(ReportOutcome::Written(updated)) => env = *updated,
                Ok(_) => {}
                Err(e) => return self.handle_failure(&env, current, e).await,
            }
        }

        match self.apply_all(&name, &environment_id, &desired).await {
            Ok(ApplyOutcome::Applied) => {}
            Ok(ApplyOutcome::Superseded) => {
                info!("Delete requested for {} while applying, switching to teardown", name);
                return Requeue::Now;
            }
            Err(e) => return self.handle_failure(&env, state, e).await,
        }

        let healthy = match self.check_health(&desired.names).await {
            Ok(healthy) => healthy,
            Err(e) => return self.handle_failure(&env, state, e).await,
        };

        let next = next_state(state, Trigger::Applied { healthy });
        if next == EnvironmentState::Degraded && state == EnvironmentState::Running {
            warn!("Environment {} lost workload or service health", name);
        }
        self.reset_record(&environment_id);

        let mut status = self.desired_status(&env, &desired, next, created_at);
        status.endpoints = Some(desired.endpoints.clone());
        match self.reporter.report(&name, status.clone()).await {
            Ok(ReportOutcome::Gone) => return Requeue::Never,
            Ok(_) => {}
            Err(e) => return self.handle_failure(&env, next, e).await,
        }
        self.metrics.record_reconcile(RESULT_SUCCESS);
        debug!("Reconciled environment {} ({})", name, next);

        let interval = match next {
            EnvironmentState::Running => self.config.resync_interval(),
            _ => self.config.health_poll_interval(),
        };
        Requeue::After(until_expiry(status.expires_at, Utc::now()).map_or(interval, |left| interval.min(left)))
    }

    fn desired_status(
        &self,
        env: &DevelopmentEnvironment,
        desired: &DesiredObjectSet,
        state: EnvironmentState,
        created_at: DateTime<Utc>,
    ) -> DevelopmentEnvironmentStatus {
        DevelopmentEnvironmentStatus {
            state,
            created_at: Some(created_at),
            expires_at: Some(created_at + chrono::Duration::hours(desired.ttl_hours)),
            last_reconciled_at: Some(Utc::now()),
            last_error: None,
            endpoints: env.status.as_ref().and_then(|s| s.endpoints.clone()),
            namespace: Some(desired.names.namespace.clone()),
            spec_fingerprint: Some(desired.fingerprint.clone()),
            observed_generation: env.metadata.generation,
            message: desired.message(),
        }
    }

    /// Apply every desired object in dependency order, skipping objects
    /// whose spec hash already matches
    async fn apply_all(
        &self,
        name: &str,
        environment_id: &str,
        desired: &DesiredObjectSet,
    ) -> Result<ApplyOutcome, ControllerError> {
        for object in desired.creation_order() {
            if self.superseded(environment_id) {
                return Ok(ApplyOutcome::Superseded);
            }

            let key = object.key();
            let observed = self.call(self.store.get(&key)).await?;
            let to_apply = match observed {
                Some(current)
                    if current.annotation(labels::SPEC_HASH_ANNOTATION)
                        == object.annotation(labels::SPEC_HASH_ANNOTATION) =>
                {
                    debug!("{} is up to date", key);
                    continue;
                }
                Some(current) => with_precondition(object, &current),
                None => object,
            };

            self.call(self.store.apply(&to_apply)).await?;
            info!("Applied {} for environment {}", key, name);
        }
        Ok(ApplyOutcome::Applied)
    }

    /// Workload has its replica available and the Service has endpoints
    async fn check_health(&self, names: &ObjectNames) -> Result<bool, ControllerError> {
        let available = match self.call(self.store.get(&names.deployment_key())).await? {
            Some(NativeObject::Deployment(deployment)) => deployment
                .status
                .as_ref()
                .and_then(|s| s.available_replicas)
                .unwrap_or(0),
            _ => 0,
        };
        if available < 1 {
            return Ok(false);
        }

        let ready = match self.call(self.store.get(&names.endpoints_key())).await? {
            Some(NativeObject::Endpoints(endpoints)) => endpoints
                .subsets
                .iter()
                .flatten()
                .any(|subset| subset.addresses.as_ref().is_some_and(|a| !a.is_empty())),
            _ => false,
        };
        Ok(ready)
    }

    /// Record a failed attempt, write it to status and decide the retry
    async fn handle_failure(&self, env: &DevelopmentEnvironment, state: EnvironmentState, err: ControllerError) -> Requeue {
        let name = env.name_any();
        let environment_id = env.environment_id().unwrap_or_default().to_string();
        let class = err.class();
        let now = Utc::now();
        self.metrics.record_error(class);
        self.metrics.record_reconcile(RESULT_ERROR);

        let (attempt, quota_since) = self.record_failure(&environment_id, class, now);
        let decision = self.policy.decide(class, attempt, quota_since, now);

        let (next, requeue) = match decision {
            RetryDecision::RequeueNow => {
                debug!("Conflict while reconciling {}, retrying: {}", name, err);
                (state, Requeue::Now)
            }
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    "Reconcile of {} failed (attempt {}, {}), retrying in {:?}: {}",
                    name, attempt, class, delay, err
                );
                self.set_backoff(&environment_id, now, delay);
                (state, Requeue::After(delay))
            }
            RetryDecision::Exhausted => {
                let trigger = match class {
                    ErrorClass::SpecInvalid => Trigger::SpecRejected,
                    c if c.is_structural() => Trigger::StructuralFailure,
                    _ => Trigger::RetryExhausted,
                };
                let next = next_state(state, trigger);
                if next == EnvironmentState::Error {
                    error!("Environment {} failed permanently ({}): {}", name, class, err);
                    (next, Requeue::Never)
                } else {
                    warn!("Environment {} is {} after repeated failures: {}", name, next, err);
                    self.reset_record(&environment_id);
                    (next, Requeue::After(self.config.health_poll_interval()))
                }
            }
        };

        let mut status = env.status.clone().unwrap_or_default();
        // A spec rejected on first sight still needs an expiry for the sweeper
        let created_at = *status
            .created_at
            .get_or_insert_with(|| creation_time(env).unwrap_or(now));
        if status.expires_at.is_none() {
            let ttl_hours = env.spec.ttl_hours.clamp(self.config.min_ttl_hours, self.config.max_ttl_hours);
            status.expires_at = Some(created_at + chrono::Duration::hours(ttl_hours));
        }
        status.state = next;
        status.last_reconciled_at = Some(now);
        status.observed_generation = env.metadata.generation;
        status.last_error = Some(LastError {
            class,
            message: err.to_string(),
            at: now,
        });
        if let Err(report_err) = self.reporter.report(&name, status).await {
            error!("Failed to record error status for {}: {}", name, report_err);
        }
        requeue
    }

    async fn reconcile_deletion(&self, env: DevelopmentEnvironment, reason: DeleteReason) -> Requeue {
        let name = env.name_any();
        let environment_id = env.environment_id().unwrap_or_default().to_string();
        let current = env.state();

        if current != EnvironmentState::Deleting {
            info!("Tearing down environment {} ({})", name, reason.message());
            let mut status = env.status.clone().unwrap_or_default();
            status.state = next_state(current, Trigger::DeleteRequested);
            status.last_reconciled_at = Some(Utc::now());
            status.message = Some(reason.message().to_string());
            match self.reporter.report(&name, status).await {
                Ok(ReportOutcome::Gone) => return Requeue::Never,
                Ok(_) => {}
                Err(e) => return self.handle_teardown_failure(&env, e).await,
            }
        }

        let names = ObjectNames::for_environment(&environment_id, &self.config.domain_suffix);
        match self.teardown(&names).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Waiting for objects of {} to disappear", name);
                return Requeue::After(self.config.health_poll_interval());
            }
            Err(e) => return self.handle_teardown_failure(&env, e).await,
        }

        let mut status = env.status.clone().unwrap_or_default();
        status.state = EnvironmentState::Deleted;
        status.last_reconciled_at = Some(Utc::now());
        status.last_error = None;
        status.endpoints = None;
        status.message = Some(reason.message().to_string());
        match self.reporter.report(&name, status).await {
            Ok(ReportOutcome::Gone) => {
                self.forget(&environment_id);
                return Requeue::Never;
            }
            Ok(_) => {}
            Err(e) => return self.handle_teardown_failure(&env, e).await,
        }

        // Re-read for a current resourceVersion before dropping the finalizer
        match self.call(self.store.get_environment(&name)).await {
            Ok(Some(fresh)) if fresh.has_cleanup_finalizer() => {
                if let Err(e) = self.call(self.store.set_cleanup_finalizer(&fresh, false)).await {
                    return self.handle_teardown_failure(&fresh, e).await;
                }
                debug!("Removed cleanup finalizer from {}", name);
            }
            Ok(_) => {}
            Err(e) => return self.handle_teardown_failure(&env, e).await,
        }

        info!("Environment {} deleted", name);
        self.forget(&environment_id);
        Requeue::Never
    }

    /// Delete every derived object and confirm they are gone
    async fn teardown(&self, names: &ObjectNames) -> Result<bool, ControllerError> {
        let keys = names.teardown_order();
        for key in &keys {
            self.call(self.store.delete(key)).await?;
            debug!("Deleted {}", key);
        }
        for key in &keys {
            if self.call(self.store.get(key)).await?.is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Teardown failures are retried with capped backoff, never escalated
    async fn handle_teardown_failure(&self, env: &DevelopmentEnvironment, err: ControllerError) -> Requeue {
        let name = env.name_any();
        let environment_id = env.environment_id().unwrap_or_default().to_string();
        let class = err.class();
        let now = Utc::now();
        self.metrics.record_error(class);
        self.metrics.record_reconcile(RESULT_ERROR);

        let requeue = if class == ErrorClass::Conflict {
            debug!("Conflict while tearing down {}, retrying: {}", name, err);
            Requeue::Now
        } else {
            let (attempt, _) = self.record_failure(&environment_id, class, now);
            let delay = self.policy.capped_delay(attempt);
            warn!(
                "Teardown of {} failed (attempt {}, {}), retrying in {:?}: {}",
                name, attempt, class, delay, err
            );
            Requeue::After(delay)
        };

        let mut status = env.status.clone().unwrap_or_default();
        if !status.state.is_tearing_down() {
            status.state = EnvironmentState::Deleting;
        }
        status.last_reconciled_at = Some(now);
        status.last_error = Some(LastError {
            class,
            message: err.to_string(),
            at: now,
        });
        if let Err(report_err) = self.reporter.report(&name, status).await {
            error!("Failed to record teardown error for {}: {}", name, report_err);
        }
        requeue
    }

    async fn reconcile_tombstone(&self, environment_id: &str) -> Requeue {
        let names = ObjectNames::for_environment(environment_id, &self.config.domain_suffix);
        match self.teardown(&names).await {
            Ok(true) => {
                info!("Tore down objects of removed environment {}", environment_id);
                lock(&self.tombstones).remove(environment_id);
                self.forget(environment_id);
                Requeue::Never
            }
            Ok(false) => Requeue::After(self.config.health_poll_interval()),
            Err(e) => {
                let class = e.class();
                self.metrics.record_error(class);
                let (attempt, _) = self.record_failure(environment_id, class, Utc::now());
                let delay = self.policy.capped_delay(attempt);
                warn!(
                    "Teardown of removed environment {} failed, retrying in {:?}: {}",
                    environment_id, delay, e
                );
                Requeue::After(delay)
            }
        }
    }

    fn backoff_remaining(&self, environment_id: &str, now: DateTime<Utc>) -> Option<Duration> {
        let records = lock(&self.records);
        let until = records.get(environment_id)?.backoff_until?;
        (until > now).then(|| (until - now).to_std().unwrap_or_default())
    }

    /// Count a failure; conflicts do not use up the retry budget
    fn record_failure(
        &self,
        environment_id: &str,
        class: ErrorClass,
        now: DateTime<Utc>,
    ) -> (u32, Option<DateTime<Utc>>) {
        let mut records = lock(&self.records);
        let record = records
            .entry(environment_id.to_string())
            .or_insert_with(|| ReconcileRecord {
                environment_id: environment_id.to_string(),
                ..Default::default()
            });
        record.last_attempt_at = Some(now);
        if class != ErrorClass::Conflict {
            record.attempt_count += 1;
        }
        if class == ErrorClass::QuotaExceeded {
            record.quota_since.get_or_insert(now);
        } else {
            record.quota_since = None;
        }
        debug!(
            "Environment {} has {} failed attempts (last at {:?})",
            record.environment_id, record.attempt_count, record.last_attempt_at
        );
        (record.attempt_count.max(1), record.quota_since)
    }

    fn set_backoff(&self, environment_id: &str, now: DateTime<Utc>, delay: Duration) {
        if let Some(record) = lock(&self.records).get_mut(environment_id) {
            record.backoff_until = chrono::Duration::from_std(delay).ok().map(|d| now + d);
        }
    }

    fn reset_record(&self, environment_id: &str) {
        lock(&self.records).remove(environment_id);
    }

    fn forget(&self, environment_id: &str) {
        lock(&self.records).remove(environment_id);
        lock(&self.deletion_requests).remove(environment_id);
        lock(&self.names).remove(environment_id);
    }

    /// Drop state for every id last seen under `name`
    fn forget_name(&self, name: &str) {
        let ids: Vec<String> = lock(&self.names)
            .iter()
            .filter(|(_, known)| known.as_str() == name)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if !self.has_tombstone(&id) {
                self.forget(&id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn attempt_count(&self, environment_id: &str) -> u32 {
        lock(&self.records)
            .get(environment_id)
            .map_or(0, |r| r.attempt_count)
    }
}

/// Desired object carrying the observed resourceVersion as a precondition
fn with_precondition(mut desired: NativeObject, observed: &NativeObject) -> NativeObject {
    desired.metadata_mut().resource_version = observed.resource_version().map(str::to_string);
    desired
}

/// `metadata.creationTimestamp` via its RFC 3339 wire form
fn creation_time(env: &DevelopmentEnvironment) -> Option<DateTime<Utc>> {
    let timestamp = env.metadata.creation_timestamp.as_ref()?;
    let value = serde_json::to_value(timestamp).ok()?;
    DateTime::parse_from_rfc3339(value.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn until_expiry(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Duration> {
    let left = expires_at? - now;
    // One second past expiry, so the next pass sees it expired
    Some(left.to_std().unwrap_or_default() + Duration::from_secs(1))
}
