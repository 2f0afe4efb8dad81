//! Store data models
//!
//! `NativeObject` wraps the concrete k8s-openapi types the controller manages
//! so the store trait can stay object-safe.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Endpoints, Namespace, PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Kind of native object the store can read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Namespace,
    NetworkPolicy,
    PersistentVolumeClaim,
    Deployment,
    Service,
    Ingress,
    /// Read-only; used for service health
    Endpoints,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Namespace => "Namespace",
            ObjectKind::NetworkPolicy => "NetworkPolicy",
            ObjectKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ObjectKind::Deployment => "Deployment",
            ObjectKind::Service => "Service",
            ObjectKind::Ingress => "Ingress",
            ObjectKind::Endpoints => "Endpoints",
        }
    }

    /// Everything except Namespace lives inside a namespace
    pub fn is_namespaced(self) -> bool {
        self != ObjectKind::Namespace
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a native object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// A native Kubernetes object managed on behalf of an environment
#[derive(Debug, Clone, PartialEq)]
pub enum NativeObject {
    Namespace(Namespace),
    NetworkPolicy(NetworkPolicy),
    PersistentVolumeClaim(PersistentVolumeClaim),
    Deployment(Deployment),
    Service(Service),
    Ingress(Ingress),
    Endpoints(Endpoints),
}

impl NativeObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            NativeObject::Namespace(_) => ObjectKind::Namespace,
            NativeObject::NetworkPolicy(_) => ObjectKind::NetworkPolicy,
            NativeObject::PersistentVolumeClaim(_) => ObjectKind::PersistentVolumeClaim,
            NativeObject::Deployment(_) => ObjectKind::Deployment,
            NativeObject::Service(_) => ObjectKind::Service,
            NativeObject::Ingress(_) => ObjectKind::Ingress,
            NativeObject::Endpoints(_) => ObjectKind::Endpoints,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            NativeObject::Namespace(o) => &o.metadata,
            NativeObject::NetworkPolicy(o) => &o.metadata,
            NativeObject::PersistentVolumeClaim(o) => &o.metadata,
            NativeObject::Deployment(o) => &o.metadata,
            NativeObject::Service(o) => &o.metadata,
            NativeObject::Ingress(o) => &o.metadata,
            NativeObject::Endpoints(o) => &o.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            NativeObject::Namespace(o) => &mut o.metadata,
            NativeObject::NetworkPolicy(o) => &mut o.metadata,
            NativeObject::PersistentVolumeClaim(o) => &mut o.metadata,
            NativeObject::Deployment(o) => &mut o.metadata,
            NativeObject::Service(o) => &mut o.metadata,
            NativeObject::Ingress(o) => &mut o.metadata,
            NativeObject::Endpoints(o) => &mut o.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn key(&self) -> ObjectKey {
        let kind = self.kind();
        let name = self.name().to_string();
        if kind.is_namespaced() {
            ObjectKey {
                kind,
                namespace: self.metadata().namespace.clone(),
                name,
            }
        } else {
            ObjectKey::cluster(kind, name)
        }
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata().resource_version.as_deref()
    }

    pub fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata().labels.as_ref()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata()
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Copy of the object with server-populated fields removed, for content
    /// comparison
    pub fn without_server_fields(&self) -> NativeObject {
        let mut copy = self.clone();
        {
            let meta = copy.metadata_mut();
            meta.resource_version = None;
            meta.uid = None;
            meta.creation_timestamp = None;
            meta.generation = None;
            meta.managed_fields = None;
        }
        match &mut copy {
            NativeObject::Namespace(o) => o.status = None,
            NativeObject::PersistentVolumeClaim(o) => o.status = None,
            NativeObject::Deployment(o) => o.status = None,
            NativeObject::Service(o) => o.status = None,
            NativeObject::Ingress(o) => o.status = None,
            NativeObject::NetworkPolicy(_) | NativeObject::Endpoints(_) => {}
        }
        copy
    }
}

impl From<Namespace> for NativeObject {
    fn from(o: Namespace) -> Self {
        NativeObject::Namespace(o)
    }
}

impl From<NetworkPolicy> for NativeObject {
    fn from(o: NetworkPolicy) -> Self {
        NativeObject::NetworkPolicy(o)
    }
}

impl From<PersistentVolumeClaim> for NativeObject {
    fn from(o: PersistentVolumeClaim) -> Self {
        NativeObject::PersistentVolumeClaim(o)
    }
}

impl From<Deployment> for NativeObject {
    fn from(o: Deployment) -> Self {
        NativeObject::Deployment(o)
    }
}

impl From<Service> for NativeObject {
    fn from(o: Service) -> Self {
        NativeObject::Service(o)
    }
}

impl From<Ingress> for NativeObject {
    fn from(o: Ingress) -> Self {
        NativeObject::Ingress(o)
    }
}

impl From<Endpoints> for NativeObject {
    fn from(o: Endpoints) -> Self {
        NativeObject::Endpoints(o)
    }
}

/// Change notification from a watch
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K> WatchEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
        }
    }

    pub fn into_object(self) -> K {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, WatchEvent::Deleted(_))
    }
}

/// Match labels against a `k=v,k2=v2` (or bare `k`) equality selector
pub fn selector_matches(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k.trim())).is_some_and(|actual| actual == v.trim()),
            None => labels.is_some_and(|l| l.contains_key(term)),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_for_namespaced_object() {
        let svc = Service {
            metadata: ObjectMeta {
                name: Some("dev-env-1a2b3c4d-service".to_string()),
                namespace: Some("dev-env-1a2b3c4d".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let obj = NativeObject::from(svc);
        assert_eq!(
            obj.key(),
            ObjectKey::namespaced(ObjectKind::Service, "dev-env-1a2b3c4d", "dev-env-1a2b3c4d-service")
        );
        assert_eq!(obj.key().to_string(), "Service dev-env-1a2b3c4d/dev-env-1a2b3c4d-service");
    }

    #[test]
    fn test_namespace_key_ignores_namespace_field() {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some("dev-env-1a2b3c4d".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            NativeObject::from(ns).key(),
            ObjectKey::cluster(ObjectKind::Namespace, "dev-env-1a2b3c4d")
        );
    }

    #[test]
    fn test_without_server_fields_ignores_version() {
        let mut a = Namespace::default();
        a.metadata.name = Some("x".to_string());
        let mut b = a.clone();
        b.metadata.resource_version = Some("42".to_string());
        b.metadata.uid = Some("abc".to_string());

        assert_ne!(NativeObject::from(a.clone()), NativeObject::from(b.clone()));
        assert_eq!(
            NativeObject::from(a).without_server_fields(),
            NativeObject::from(b).without_server_fields()
        );
    }

    #[test]
    fn test_selector_matching() {
        let labels = BTreeMap::from([
            ("app.kubernetes.io/managed-by".to_string(), "dev-platform".to_string()),
            ("team".to_string(), "eng".to_string()),
        ]);
        assert!(selector_matches(Some(&labels), "app.kubernetes.io/managed-by=dev-platform"));
        assert!(selector_matches(Some(&labels), "team=eng, app.kubernetes.io/managed-by=dev-platform"));
        assert!(selector_matches(Some(&labels), "team"));
        assert!(!selector_matches(Some(&labels), "team=ops"));
        assert!(!selector_matches(None, "team"));
        assert!(selector_matches(None, ""));
    }
}
