//! ResourceStore trait for mocking
//!
//! This trait abstracts the Kubernetes API so the reconciler can be driven
//! against an in-memory store in unit tests. `KubeResourceStore` implements it
//! against a live cluster.

use crds::{DevelopmentEnvironment, DevelopmentEnvironmentStatus};
use futures::stream::BoxStream;

use crate::error::StoreError;
use crate::models::*;

/// Stream of watch notifications
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, StoreError>>;

/// Trait for resource store operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    // DevelopmentEnvironment operations
    async fn get_environment(&self, name: &str) -> Result<Option<DevelopmentEnvironment>, StoreError>;
    async fn list_environments(&self) -> Result<Vec<DevelopmentEnvironment>, StoreError>;
    async fn patch_environment_status(
        &self,
        name: &str,
        status: &DevelopmentEnvironmentStatus,
    ) -> Result<DevelopmentEnvironment, StoreError>;

    /// Add or remove the cleanup finalizer. The environment's
    /// `resourceVersion` is sent as a precondition.
    async fn set_cleanup_finalizer(
        &self,
        environment: &DevelopmentEnvironment,
        present: bool,
    ) -> Result<DevelopmentEnvironment, StoreError>;

    fn watch_environments(&self) -> WatchStream<DevelopmentEnvironment>;

    // Native object operations
    async fn get(&self, key: &ObjectKey) -> Result<Option<NativeObject>, StoreError>;

    /// List objects of `kind` across all namespaces matching an equality selector
    async fn list(&self, kind: ObjectKind, label_selector: &str) -> Result<Vec<NativeObject>, StoreError>;

    /// Create or update. A `resourceVersion` on `object` is a precondition.
    async fn apply(&self, object: &NativeObject) -> Result<NativeObject, StoreError>;

    /// Delete; absent objects are not an error
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    fn watch(&self, kind: ObjectKind, label_selector: &str) -> WatchStream<NativeObject>;
}
