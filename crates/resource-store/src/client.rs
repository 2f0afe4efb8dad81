//! Kubernetes-backed resource store

use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;

use crds::{labels, DevelopmentEnvironment, DevelopmentEnvironmentStatus};
use futures::{future, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Endpoints, Namespace, PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use kube_runtime::watcher;
use kube_runtime::WatchStreamExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::StoreError;
use crate::models::*;
use crate::store_trait::{ResourceStore, WatchStream};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "dev-environment-controller";

/// Resource store backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeResourceStore {
    client: Client,
    field_manager: String,
}

impl KubeResourceStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            field_manager: FIELD_MANAGER.to_string(),
        }
    }

    fn environments(&self) -> Api<DevelopmentEnvironment> {
        Api::all(self.client.clone())
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    fn scoped<K>(&self, key: &ObjectKey) -> Result<Api<K>, StoreError>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match key.namespace.as_deref() {
            Some(ns) => Ok(Api::namespaced(self.client.clone(), ns)),
            None => Err(StoreError::Invalid(format!("{key} has no namespace"))),
        }
    }

    fn cluster_wide<K>(&self) -> Api<K>
    where
        K: Resource,
        K::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }
}

#[async_trait::async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get_environment(&self, name: &str) -> Result<Option<DevelopmentEnvironment>, StoreError> {
        Ok(self.environments().get_opt(name).await?)
    }

    async fn list_environments(&self) -> Result<Vec<DevelopmentEnvironment>, StoreError> {
        Ok(self.environments().list(&ListParams::default()).await?.items)
    }

    async fn patch_environment_status(
        &self,
        name: &str,
        status: &DevelopmentEnvironmentStatus,
    ) -> Result<DevelopmentEnvironment, StoreError> {
        let patch = status_merge_patch(status)?;
        debug!("Patching status of DevelopmentEnvironment {} to {}", name, status.state);
        Ok(self
            .environments()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn set_cleanup_finalizer(
        &self,
        environment: &DevelopmentEnvironment,
        present: bool,
    ) -> Result<DevelopmentEnvironment, StoreError> {
        let name = environment.name_any();
        let patch = finalizer_merge_patch(environment, present);
        Ok(self
            .environments()
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    fn watch_environments(&self) -> WatchStream<DevelopmentEnvironment> {
        typed_watch(self.environments(), watcher::Config::default(), |e| e)
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<NativeObject>, StoreError> {
        let name = key.name.as_str();
        let found = match key.kind {
            ObjectKind::Namespace => self.namespaces().get_opt(name).await?.map(NativeObject::from),
            ObjectKind::NetworkPolicy => self
                .scoped::<NetworkPolicy>(key)?
                .get_opt(name)
                .await?
                .map(NativeObject::from),
            ObjectKind::PersistentVolumeClaim => self
                .scoped::<PersistentVolumeClaim>(key)?
                .get_opt(name)
                .await?
                .map(NativeObject::from),
            ObjectKind::Deployment => self
                .scoped::<Deployment>(key)?
                .get_opt(name)
                .await?
                .map(NativeObject::from),
            ObjectKind::Service => self.scoped::<Service>(key)?.get_opt(name).await?.map(NativeObject::from),
            ObjectKind::Ingress => self.scoped::<Ingress>(key)?.get_opt(name).await?.map(NativeObject::from),
            ObjectKind::Endpoints => self
                .scoped::<Endpoints>(key)?
                .get_opt(name)
                .await?
                .map(NativeObject::from),
        };
        Ok(found)
    }

    async fn list(&self, kind: ObjectKind, label_selector: &str) -> Result<Vec<NativeObject>, StoreError> {
        let params = ListParams::default().labels(label_selector);
        let items = match kind {
            ObjectKind::Namespace => wrap_all(self.namespaces().list(&params).await?.items),
            ObjectKind::NetworkPolicy => wrap_all(self.cluster_wide::<NetworkPolicy>().list(&params).await?.items),
            ObjectKind::PersistentVolumeClaim => {
                wrap_all(self.cluster_wide::<PersistentVolumeClaim>().list(&params).await?.items)
            }
            ObjectKind::Deployment => wrap_all(self.cluster_wide::<Deployment>().list(&params).await?.items),
            ObjectKind::Service => wrap_all(self.cluster_wide::<Service>().list(&params).await?.items),
            ObjectKind::Ingress => wrap_all(self.cluster_wide::<Ingress>().list(&params).await?.items),
            ObjectKind::Endpoints => wrap_all(self.cluster_wide::<Endpoints>().list(&params).await?.items),
        };
        Ok(items)
    }

    async fn apply(&self, object: &NativeObject) -> Result<NativeObject, StoreError> {
        let key = object.key();
        let name = key.name.as_str();
        let params = PatchParams::apply(&self.field_manager).force();
        debug!("Applying {}", key);

        let applied: NativeObject = match object {
            NativeObject::Namespace(o) => self.namespaces().patch(name, &params, &Patch::Apply(o)).await?.into(),
            NativeObject::NetworkPolicy(o) => self
                .scoped::<NetworkPolicy>(&key)?
                .patch(name, &params, &Patch::Apply(o))
                .await?
                .into(),
            NativeObject::PersistentVolumeClaim(o) => self
                .scoped::<PersistentVolumeClaim>(&key)?
                .patch(name, &params, &Patch::Apply(o))
                .await?
                .into(),
            NativeObject::Deployment(o) => self
                .scoped::<Deployment>(&key)?
                .patch(name, &params, &Patch::Apply(o))
                .await?
                .into(),
            NativeObject::Service(o) => self
                .scoped::<Service>(&key)?
                .patch(name, &params, &Patch::Apply(o))
                .await?
                .into(),
            NativeObject::Ingress(o) => self
                .scoped::<Ingress>(&key)?
                .patch(name, &params, &Patch::Apply(o))
                .await?
                .into(),
            NativeObject::Endpoints(_) => {
                return Err(StoreError::Invalid(format!("{key} is read-only")));
            }
        };
        Ok(applied)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let name = key.name.as_str();
        let params = DeleteParams::background();
        let result = match key.kind {
            ObjectKind::Namespace => self.namespaces().delete(name, &params).await.map(|_| ()),
            ObjectKind::NetworkPolicy => self.scoped::<NetworkPolicy>(key)?.delete(name, &params).await.map(|_| ()),
            ObjectKind::PersistentVolumeClaim => self
                .scoped::<PersistentVolumeClaim>(key)?
                .delete(name, &params)
                .await
                .map(|_| ()),
            ObjectKind::Deployment => self.scoped::<Deployment>(key)?.delete(name, &params).await.map(|_| ()),
            ObjectKind::Service => self.scoped::<Service>(key)?.delete(name, &params).await.map(|_| ()),
            ObjectKind::Ingress => self.scoped::<Ingress>(key)?.delete(name, &params).await.map(|_| ()),
            ObjectKind::Endpoints => return Err(StoreError::Invalid(format!("{key} is read-only"))),
        };

        match result.map_err(StoreError::from) {
            Err(e) if e.is_not_found() => {
                debug!("{} already absent", key);
                Ok(())
            }
            other => other,
        }
    }

    fn watch(&self, kind: ObjectKind, label_selector: &str) -> WatchStream<NativeObject> {
        let config = watcher::Config::default().labels(label_selector);
        match kind {
            ObjectKind::Namespace => typed_watch(self.namespaces(), config, NativeObject::from),
            ObjectKind::NetworkPolicy => typed_watch(self.cluster_wide::<NetworkPolicy>(), config, NativeObject::from),
            ObjectKind::PersistentVolumeClaim => {
                typed_watch(self.cluster_wide::<PersistentVolumeClaim>(), config, NativeObject::from)
            }
            ObjectKind::Deployment => typed_watch(self.cluster_wide::<Deployment>(), config, NativeObject::from),
            ObjectKind::Service => typed_watch(self.cluster_wide::<Service>(), config, NativeObject::from),
            ObjectKind::Ingress => typed_watch(self.cluster_wide::<Ingress>(), config, NativeObject::from),
            ObjectKind::Endpoints => typed_watch(self.cluster_wide::<Endpoints>(), config, NativeObject::from),
        }
    }
}

fn wrap_all<K: Into<NativeObject>>(items: Vec<K>) -> Vec<NativeObject> {
    items.into_iter().map(Into::into).collect()
}

/// Translate a kube-runtime watcher into add/modify/delete events.
///
/// The watcher re-lists after every disconnect, so objects already seen are
/// reported as `Modified` rather than `Added`.
fn typed_watch<K, T, F>(api: Api<K>, config: watcher::Config, wrap: F) -> WatchStream<T>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
    T: Send + 'static,
    F: Fn(K) -> T + Send + 'static,
{
    let mut seen: HashSet<String> = HashSet::new();
    watcher(api, config)
        .default_backoff()
        .filter_map(move |event| {
            let out = match event {
                Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                    let uid = obj.meta().uid.clone().unwrap_or_else(|| obj.name_any());
                    if seen.insert(uid) {
                        Some(Ok(WatchEvent::Added(wrap(obj))))
                    } else {
                        Some(Ok(WatchEvent::Modified(wrap(obj))))
                    }
                }
                Ok(watcher::Event::Delete(obj)) => {
                    let uid = obj.meta().uid.clone().unwrap_or_else(|| obj.name_any());
                    seen.remove(&uid);
                    Some(Ok(WatchEvent::Deleted(wrap(obj))))
                }
                Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                Err(e) => Some(Err(StoreError::Transient(format!("watch error: {e}")))),
            };
            future::ready(out)
        })
        .boxed()
}

/// Build a JSON merge patch that replaces the whole status.
///
/// Optional fields that are unset are sent as `null` so stale values such as
/// a previous `lastError` are cleared.
pub fn status_merge_patch(status: &DevelopmentEnvironmentStatus) -> Result<Value, StoreError> {
    let mut body = serde_json::to_value(status)?;
    if let Value::Object(map) = &mut body {
        for field in [
            "createdAt",
            "expiresAt",
            "lastReconciledAt",
            "lastError",
            "endpoints",
            "namespace",
            "specFingerprint",
            "observedGeneration",
            "message",
        ] {
            map.entry(field).or_insert(Value::Null);
        }
    }
    Ok(json!({ "status": body }))
}

/// Merge patch that adds or removes the cleanup finalizer, guarded by the
/// environment's current `resourceVersion`
pub fn finalizer_merge_patch(environment: &DevelopmentEnvironment, present: bool) -> Value {
    let mut finalizers: Vec<String> = environment
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != labels::CLEANUP_FINALIZER)
        .cloned()
        .collect();
    if present {
        finalizers.push(labels::CLEANUP_FINALIZER.to_string());
    }
    json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": environment.resource_version(),
        }
    })
}
