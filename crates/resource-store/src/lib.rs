//! Resource Store Client
//!
//! Typed read/write/watch access to `DevelopmentEnvironment` resources and to
//! the native Kubernetes objects that realize them (Namespace, NetworkPolicy,
//! PersistentVolumeClaim, Deployment, Service, Ingress, plus read-only
//! Endpoints for health checks).
//!
//! # Example
//!
//! ```no_run
//! use resource_store::{KubeResourceStore, ObjectKey, ObjectKind, ResourceStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let store = KubeResourceStore::new(client);
//!
//! let key = ObjectKey::cluster(ObjectKind::Namespace, "dev-env-1a2b3c4d");
//! if let Some(ns) = store.get(&key).await? {
//!     println!("namespace at version {:?}", ns.resource_version());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Semantics
//!
//! - `apply` is an idempotent create-or-update. When the object carries a
//!   `resourceVersion` it is used as an optimistic-concurrency precondition
//!   and a mismatch surfaces as [`StoreError::Conflict`].
//! - `delete` is idempotent: deleting an absent object succeeds.
//! - `watch` yields added/modified/deleted events and restarts itself with
//!   backoff when the underlying watch drops.

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod store_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::KubeResourceStore;
pub use error::StoreError;
pub use models::*;
pub use store_trait::{ResourceStore, WatchStream};
#[cfg(any(test, feature = "test-util"))]
pub use mock::{FailureKind, MockResourceStore, StoreCall, StoreOp};
