//! Controller-specific error types.
//!
//! Every error maps onto one `ErrorClass`, which is what the retry policy and
//! the status surface work with.

use std::time::Duration;

use crds::ErrorClass;
use kube::Error as KubeError;
use resource_store::StoreError;
use thiserror::Error;

use crate::translator::SpecInvalid;

/// Errors that can occur in the environment controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Resource store error
    #[error("Resource store error: {0}")]
    Store(#[from] StoreError),

    /// The desired spec cannot be realized
    #[error("Invalid spec: {0}")]
    SpecInvalid(String),

    /// A store call exceeded the configured timeout
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O error (probe server, config file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SpecInvalid> for ControllerError {
    fn from(err: SpecInvalid) -> Self {
        ControllerError::SpecInvalid(err.0)
    }
}

impl ControllerError {
    /// Failure class used for retry decisions and `status.lastError`
    pub fn class(&self) -> ErrorClass {
        match self {
            ControllerError::Kube(KubeError::Api(resp)) => {
                store_class(&StoreError::from_status(resp.code, &resp.reason, &resp.message))
            }
            ControllerError::Kube(_) => ErrorClass::Transient,
            ControllerError::Store(e) => store_class(e),
            ControllerError::SpecInvalid(_) | ControllerError::InvalidConfig(_) => ErrorClass::SpecInvalid,
            ControllerError::Timeout(_)
            | ControllerError::Watch(_)
            | ControllerError::Metrics(_)
            | ControllerError::Io(_) => ErrorClass::Transient,
        }
    }
}

fn store_class(err: &StoreError) -> ErrorClass {
    match err {
        StoreError::Conflict(_) => ErrorClass::Conflict,
        StoreError::NotFound(_) => ErrorClass::NotFound,
        StoreError::Transient(_) | StoreError::Serialization(_) => ErrorClass::Transient,
        StoreError::QuotaExceeded(_) => ErrorClass::QuotaExceeded,
        StoreError::PermissionDenied(_) => ErrorClass::PermissionDenied,
        // The API server rejected a manifest derived from the spec
        StoreError::Invalid(_) => ErrorClass::SpecInvalid,
    }
}
