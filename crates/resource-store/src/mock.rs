//! Mock ResourceStore for unit testing
//!
//! Stores environments and native objects in memory with a monotonically
//! increasing resource version, records every call so tests can assert on
//! ordering, and can be told to fail specific operations.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use crds::{DevelopmentEnvironment, DevelopmentEnvironmentStatus, EnvironmentState, labels};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DeploymentStatus;
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::models::*;
use crate::store_trait::{ResourceStore, WatchStream};

/// Operation kinds that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    List,
    Apply,
    Delete,
    GetEnvironment,
    ListEnvironments,
    PatchStatus,
    SetFinalizer,
}

/// Injected failure flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Conflict,
    Transient,
    QuotaExceeded,
    PermissionDenied,
    Invalid,
}

impl FailureKind {
    fn to_error(self, context: &str) -> StoreError {
        let message = format!("injected failure on {context}");
        match self {
            FailureKind::Conflict => StoreError::Conflict(message),
            FailureKind::Transient => StoreError::Transient(message),
            FailureKind::QuotaExceeded => StoreError::QuotaExceeded(message),
            FailureKind::PermissionDenied => StoreError::PermissionDenied(message),
            FailureKind::Invalid => StoreError::Invalid(message),
        }
    }
}

/// A recorded store call
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Get(ObjectKey),
    List(ObjectKind),
    Apply(ObjectKey),
    Delete(ObjectKey),
    GetEnvironment(String),
    ListEnvironments,
    PatchStatus(String, EnvironmentState),
    SetFinalizer(String, bool),
}

#[derive(Debug)]
struct FailureRule {
    op: StoreOp,
    kind: Option<ObjectKind>,
    failure: FailureKind,
    remaining: usize,
}

#[derive(Debug, Clone)]
enum MockEvent {
    Environment(WatchEvent<DevelopmentEnvironment>),
    Object(WatchEvent<NativeObject>),
}

#[derive(Debug, Default)]
struct MockState {
    environments: BTreeMap<String, DevelopmentEnvironment>,
    objects: BTreeMap<ObjectKey, NativeObject>,
    creations: HashMap<ObjectKey, usize>,
    calls: Vec<StoreCall>,
    failures: Vec<FailureRule>,
    next_version: u64,
    auto_ready: bool,
    apply_latency: Option<Duration>,
    active_applies: usize,
    max_active_applies: usize,
}

impl MockState {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn take_failure(&mut self, op: StoreOp, kind: Option<ObjectKind>, context: &str) -> Result<(), StoreError> {
        let position = self
            .failures
            .iter()
            .position(|rule| rule.op == op && (rule.kind.is_none() || rule.kind == kind));
        if let Some(index) = position {
            let failure = self.failures[index].failure;
            self.failures[index].remaining -= 1;
            if self.failures[index].remaining == 0 {
                self.failures.remove(index);
            }
            return Err(failure.to_error(context));
        }
        Ok(())
    }
}

/// Mock ResourceStore for testing
///
/// Cloning shares the underlying state.
#[derive(Clone)]
pub struct MockResourceStore {
    state: Arc<Mutex<MockState>>,
    events: broadcast::Sender<MockEvent>,
}

impl Default for MockResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockResourceStore {
    /// Create an empty store. Workloads never become ready on their own.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            events,
        }
    }

    /// Create a store where Deployments report available replicas and
    /// Services get ready Endpoints as soon as they are created
    pub fn with_auto_ready() -> Self {
        let store = Self::new();
        store.lock().auto_ready = true;
        store
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: MockEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Delay every apply, so overlapping reconciles would become visible
    pub fn set_apply_latency(&self, latency: Duration) {
        self.lock().apply_latency = Some(latency);
    }

    /// Fail the next `times` calls of `op` (optionally only for `kind`)
    pub fn fail_next(&self, op: StoreOp, kind: Option<ObjectKind>, failure: FailureKind, times: usize) {
        if times == 0 {
            return;
        }
        self.lock().failures.push(FailureRule {
            op,
            kind,
            failure,
            remaining: times,
        });
    }

    /// Fail every call of `op` until `clear_failures`
    pub fn fail_always(&self, op: StoreOp, kind: Option<ObjectKind>, failure: FailureKind) {
        self.fail_next(op, kind, failure, usize::MAX);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    // Environment helpers

    /// Insert a new environment as the API layer would, assigning a uid
    pub fn add_environment(&self, mut env: DevelopmentEnvironment) -> DevelopmentEnvironment {
        let mut state = self.lock();
        if env.metadata.uid.is_none() {
            env.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        env.metadata.resource_version = Some(state.bump_version());
        env.metadata.generation = Some(1);
        env.metadata.creation_timestamp = now_time();
        state.environments.insert(env.name_any(), env.clone());
        drop(state);
        self.emit(MockEvent::Environment(WatchEvent::Added(env.clone())));
        env
    }

    /// Replace an environment's spec and metadata, keeping its status
    pub fn update_environment(&self, mut env: DevelopmentEnvironment) -> Option<DevelopmentEnvironment> {
        let mut state = self.lock();
        let name = env.name_any();
        let stored = state.environments.get(&name)?.clone();
        let spec_changed = stored.spec != env.spec;
        env.status = stored.status.clone();
        env.metadata.uid = stored.metadata.uid.clone();
        env.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        env.metadata.generation = stored.metadata.generation.map(|g| if spec_changed { g + 1 } else { g });
        env.metadata.resource_version = Some(state.bump_version());
        state.environments.insert(name, env.clone());
        drop(state);
        self.emit(MockEvent::Environment(WatchEvent::Modified(env.clone())));
        Some(env)
    }

    /// Set an annotation on an environment
    pub fn annotate_environment(&self, name: &str, key: &str, value: &str) -> Option<DevelopmentEnvironment> {
        let mut env = self.environment(name)?;
        env.annotations_mut().insert(key.to_string(), value.to_string());
        self.update_environment(env)
    }

    /// Delete an environment the way the API server does: mark it when
    /// finalizers are present, remove it otherwise
    pub fn delete_environment(&self, name: &str) {
        let mut state = self.lock();
        let Some(mut env) = state.environments.get(name).cloned() else {
            return;
        };
        if env.finalizers().is_empty() {
            state.environments.remove(name);
            drop(state);
            self.emit(MockEvent::Environment(WatchEvent::Deleted(env)));
        } else {
            env.metadata.deletion_timestamp = now_time();
            env.metadata.resource_version = Some(state.bump_version());
            state.environments.insert(name.to_string(), env.clone());
            drop(state);
            self.emit(MockEvent::Environment(WatchEvent::Modified(env)));
        }
    }

    pub fn environment(&self, name: &str) -> Option<DevelopmentEnvironment> {
        self.lock().environments.get(name).cloned()
    }

    pub fn environment_state(&self, name: &str) -> Option<EnvironmentState> {
        self.environment(name).map(|e| e.state())
    }

    // Object helpers

    pub fn object(&self, key: &ObjectKey) -> Option<NativeObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn objects(&self) -> Vec<NativeObject> {
        self.lock().objects.values().cloned().collect()
    }

    /// Insert an object directly, bypassing the call log
    pub fn insert_object(&self, mut object: NativeObject) -> NativeObject {
        let mut state = self.lock();
        let version = state.bump_version();
        let meta = object.metadata_mut();
        meta.resource_version = Some(version);
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        state.objects.insert(object.key(), object.clone());
        drop(state);
        self.emit(MockEvent::Object(WatchEvent::Added(object.clone())));
        object
    }

    /// Remove an object directly, as if deleted out-of-band
    pub fn remove_object(&self, key: &ObjectKey) -> Option<NativeObject> {
        let removed = self.lock().objects.remove(key);
        if let Some(object) = &removed {
            self.emit(MockEvent::Object(WatchEvent::Deleted(object.clone())));
        }
        removed
    }

    /// Force a Deployment's available replica count
    pub fn set_available_replicas(&self, namespace: &str, name: &str, replicas: i32) {
        let key = ObjectKey::namespaced(ObjectKind::Deployment, namespace, name);
        let mut state = self.lock();
        let version = state.bump_version();
        let Some(NativeObject::Deployment(deployment)) = state.objects.get_mut(&key) else {
            return;
        };
        deployment.status = Some(DeploymentStatus {
            replicas: Some(replicas),
            ready_replicas: Some(replicas),
            available_replicas: Some(replicas),
            ..Default::default()
        });
        deployment.metadata.resource_version = Some(version);
        let object = NativeObject::Deployment(deployment.clone());
        drop(state);
        self.emit(MockEvent::Object(WatchEvent::Modified(object)));
    }

    /// Create ready Endpoints for a Service
    pub fn set_service_ready(&self, namespace: &str, service: &str) {
        let endpoints = ready_endpoints(namespace, service);
        self.insert_object(endpoints);
    }

    /// How many times an object was created (not updated)
    pub fn creation_count(&self, key: &ObjectKey) -> usize {
        self.lock().creations.get(key).copied().unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Keys passed to `apply`, in call order
    pub fn applied_keys(&self) -> Vec<ObjectKey> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                StoreCall::Apply(key) => Some(key),
                _ => None,
            })
            .collect()
    }

    /// Keys passed to `delete`, in call order
    pub fn deleted_keys(&self) -> Vec<ObjectKey> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                StoreCall::Delete(key) => Some(key),
                _ => None,
            })
            .collect()
    }

    /// States written through `patch_environment_status` for `name`, in order
    pub fn status_writes(&self, name: &str) -> Vec<EnvironmentState> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                StoreCall::PatchStatus(n, state) if n == name => Some(state),
                _ => None,
            })
            .collect()
    }

    /// Highest number of `apply` calls that were in progress at once
    pub fn max_concurrent_applies(&self) -> usize {
        self.lock().max_active_applies
    }
}

/// Current time as a metadata timestamp. Goes through the RFC 3339 wire
/// form so it does not depend on the time library behind `Time`.
fn now_time() -> Option<Time> {
    serde_json::from_value(serde_json::Value::String(Utc::now().to_rfc3339())).ok()
}

fn ready_endpoints(namespace: &str, service: &str) -> NativeObject {
    NativeObject::Endpoints(Endpoints {
        metadata: ObjectMeta {
            name: Some(service.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: "10.0.0.10".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    })
}

#[async_trait::async_trait]
impl ResourceStore for MockResourceStore {
    async fn get_environment(&self, name: &str) -> Result<Option<DevelopmentEnvironment>, StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::GetEnvironment(name.to_string()));
        state.take_failure(StoreOp::GetEnvironment, None, name)?;
        Ok(state.environments.get(name).cloned())
    }

    async fn list_environments(&self) -> Result<Vec<DevelopmentEnvironment>, StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::ListEnvironments);
        state.take_failure(StoreOp::ListEnvironments, None, "environments")?;
        Ok(state.environments.values().cloned().collect())
    }

    async fn patch_environment_status(
        &self,
        name: &str,
        status: &DevelopmentEnvironmentStatus,
    ) -> Result<DevelopmentEnvironment, StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::PatchStatus(name.to_string(), status.state));
        state.take_failure(StoreOp::PatchStatus, None, name)?;
        let version = state.bump_version();
        let Some(env) = state.environments.get_mut(name) else {
            return Err(StoreError::NotFound(format!("DevelopmentEnvironment {name}")));
        };
        env.status = Some(status.clone());
        env.metadata.resource_version = Some(version);
        let updated = env.clone();
        drop(state);
        self.emit(MockEvent::Environment(WatchEvent::Modified(updated.clone())));
        Ok(updated)
    }

    async fn set_cleanup_finalizer(
        &self,
        environment: &DevelopmentEnvironment,
        present: bool,
    ) -> Result<DevelopmentEnvironment, StoreError> {
        let name = environment.name_any();
        let mut state = self.lock();
        state.calls.push(StoreCall::SetFinalizer(name.clone(), present));
        state.take_failure(StoreOp::SetFinalizer, None, &name)?;

        let Some(stored) = state.environments.get(&name).cloned() else {
            return Err(StoreError::NotFound(format!("DevelopmentEnvironment {name}")));
        };
        if stored.metadata.resource_version != environment.metadata.resource_version {
            return Err(StoreError::Conflict(format!(
                "DevelopmentEnvironment {name} was modified (have {:?}, stored {:?})",
                environment.metadata.resource_version, stored.metadata.resource_version
            )));
        }

        let mut updated = stored;
        let finalizers = updated.finalizers_mut();
        finalizers.retain(|f| f != labels::CLEANUP_FINALIZER);
        if present {
            finalizers.push(labels::CLEANUP_FINALIZER.to_string());
        }
        updated.metadata.resource_version = Some(state.bump_version());

        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            state.environments.remove(&name);
            drop(state);
            self.emit(MockEvent::Environment(WatchEvent::Deleted(updated.clone())));
        } else {
            state.environments.insert(name, updated.clone());
            drop(state);
            self.emit(MockEvent::Environment(WatchEvent::Modified(updated.clone())));
        }
        Ok(updated)
    }

    fn watch_environments(&self) -> WatchStream<DevelopmentEnvironment> {
        subscribe(&self.events)
            .filter_map(|event| async move {
                match event {
                    MockEvent::Environment(e) => Some(Ok(e)),
                    MockEvent::Object(_) => None,
                }
            })
            .boxed()
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<NativeObject>, StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::Get(key.clone()));
        state.take_failure(StoreOp::Get, Some(key.kind), &key.to_string())?;
        Ok(state.objects.get(key).cloned())
    }

    async fn list(&self, kind: ObjectKind, label_selector: &str) -> Result<Vec<NativeObject>, StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::List(kind));
        state.take_failure(StoreOp::List, Some(kind), kind.as_str())?;
        Ok(state
            .objects
            .values()
            .filter(|o| o.kind() == kind && selector_matches(o.labels(), label_selector))
            .cloned()
            .collect())
    }

    async fn apply(&self, object: &NativeObject) -> Result<NativeObject, StoreError> {
        let key = object.key();
        let latency = {
            let mut state = self.lock();
            state.calls.push(StoreCall::Apply(key.clone()));
            state.take_failure(StoreOp::Apply, Some(key.kind), &key.to_string())?;
            state.active_applies += 1;
            state.max_active_applies = state.max_active_applies.max(state.active_applies);
            state.apply_latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        state.active_applies -= 1;
        if key.kind == ObjectKind::Endpoints {
            return Err(StoreError::Invalid(format!("{key} is read-only")));
        }

        let existing = state.objects.get(&key).cloned();
        let (stored, event) = match existing {
            Some(current) => {
                if let Some(expected) = object.resource_version()
                    && current.resource_version() != Some(expected)
                {
                    return Err(StoreError::Conflict(format!(
                        "{key}: resourceVersion {expected} is stale"
                    )));
                }
                if current.without_server_fields() == object.without_server_fields() {
                    return Ok(current);
                }
                let mut updated = merge_server_fields(object, &current);
                updated.metadata_mut().resource_version = Some(state.bump_version());
                (updated.clone(), WatchEvent::Modified(updated))
            }
            None => {
                if object.resource_version().is_some() {
                    return Err(StoreError::Conflict(format!("{key} no longer exists")));
                }
                let mut created = object.clone();
                let version = state.bump_version();
                {
                    let meta = created.metadata_mut();
                    meta.resource_version = Some(version);
                    meta.uid = Some(uuid::Uuid::new_v4().to_string());
                    meta.creation_timestamp = now_time();
                }
                *state.creations.entry(key.clone()).or_insert(0) += 1;
                (created.clone(), WatchEvent::Added(created))
            }
        };

        let mut extra = None;
        let stored = if state.auto_ready {
            match stored {
                NativeObject::Deployment(mut deployment) => {
                    let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                    deployment.status = Some(DeploymentStatus {
                        replicas: Some(replicas),
                        ready_replicas: Some(replicas),
                        available_replicas: Some(replicas),
                        ..Default::default()
                    });
                    NativeObject::Deployment(deployment)
                }
                NativeObject::Service(service) => {
                    let namespace = service.metadata.namespace.clone().unwrap_or_default();
                    let name = service.metadata.name.clone().unwrap_or_default();
                    let mut endpoints = ready_endpoints(&namespace, &name);
                    endpoints.metadata_mut().resource_version = Some(state.bump_version());
                    state.objects.insert(endpoints.key(), endpoints.clone());
                    extra = Some(endpoints);
                    NativeObject::Service(service)
                }
                other => other,
            }
        } else {
            stored
        };

        state.objects.insert(key, stored.clone());
        drop(state);
        self.emit(MockEvent::Object(event));
        if let Some(endpoints) = extra {
            self.emit(MockEvent::Object(WatchEvent::Added(endpoints)));
        }
        Ok(stored)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::Delete(key.clone()));
        state.take_failure(StoreOp::Delete, Some(key.kind), &key.to_string())?;
        let removed = state.objects.remove(key);

        // Deleting a namespace removes everything inside it
        let mut cascaded = Vec::new();
        if key.kind == ObjectKind::Namespace {
            let inner: Vec<ObjectKey> = state
                .objects
                .keys()
                .filter(|k| k.namespace.as_deref() == Some(key.name.as_str()))
                .cloned()
                .collect();
            for k in inner {
                if let Some(o) = state.objects.remove(&k) {
                    cascaded.push(o);
                }
            }
        }
        // Endpoints go away with their Service
        if key.kind == ObjectKind::Service {
            let endpoints_key = ObjectKey {
                kind: ObjectKind::Endpoints,
                namespace: key.namespace.clone(),
                name: key.name.clone(),
            };
            if let Some(o) = state.objects.remove(&endpoints_key) {
                cascaded.push(o);
            }
        }
        drop(state);

        for object in removed.into_iter().chain(cascaded) {
            self.emit(MockEvent::Object(WatchEvent::Deleted(object)));
        }
        Ok(())
    }

    fn watch(&self, kind: ObjectKind, label_selector: &str) -> WatchStream<NativeObject> {
        let selector = label_selector.to_string();
        subscribe(&self.events)
            .filter_map(move |event| {
                let out = match event {
                    MockEvent::Object(e) if e.object().kind() == kind && selector_matches(e.object().labels(), &selector) => {
                        Some(Ok(e))
                    }
                    _ => None,
                };
                futures::future::ready(out)
            })
            .boxed()
    }
}

/// Carry server-populated fields of `current` over to `desired`
fn merge_server_fields(desired: &NativeObject, current: &NativeObject) -> NativeObject {
    let mut merged = desired.clone();
    {
        let from = current.metadata();
        let meta = merged.metadata_mut();
        meta.uid = from.uid.clone();
        meta.creation_timestamp = from.creation_timestamp.clone();
        meta.resource_version = from.resource_version.clone();
    }
    match (&mut merged, current) {
        (NativeObject::Namespace(m), NativeObject::Namespace(c)) => m.status = c.status.clone(),
        (NativeObject::PersistentVolumeClaim(m), NativeObject::PersistentVolumeClaim(c)) => m.status = c.status.clone(),
        (NativeObject::Deployment(m), NativeObject::Deployment(c)) => m.status = c.status.clone(),
        (NativeObject::Service(m), NativeObject::Service(c)) => m.status = c.status.clone(),
        (NativeObject::Ingress(m), NativeObject::Ingress(c)) => m.status = c.status.clone(),
        _ => {}
    }
    merged
}

fn subscribe(events: &broadcast::Sender<MockEvent>) -> futures::stream::BoxStream<'static, MockEvent> {
    let rx = events.subscribe();
    futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
