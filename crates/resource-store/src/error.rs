//! Resource store errors

use thiserror::Error;

/// Errors that can occur when talking to the resource store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic-concurrency precondition failed or the object already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network failure, throttling, timeout or a dropped watch
    #[error("Transient error: {0}")]
    Transient(String),

    /// A namespace or cluster quota rejected the request
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Authentication or authorization failed
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The API server rejected the object as malformed
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Classify an API server response by status code
    pub fn from_status(code: u16, reason: &str, message: &str) -> Self {
        let detail = if reason.is_empty() {
            message.to_string()
        } else {
            format!("{reason}: {message}")
        };

        match code {
            409 => StoreError::Conflict(detail),
            404 => StoreError::NotFound(detail),
            403 if is_quota_message(message) => StoreError::QuotaExceeded(detail),
            401 | 403 => StoreError::PermissionDenied(detail),
            400 | 422 => StoreError::Invalid(detail),
            _ => StoreError::Transient(detail),
        }
    }

    /// Whether this error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Whether this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

fn is_quota_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("exceeded quota") || lower.contains("quota exceeded")
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) => StoreError::from_status(resp.code, &resp.reason, &resp.message),
            _ => StoreError::Transient(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(StoreError::from_status(409, "Conflict", "rv mismatch"), StoreError::Conflict(_)));
        assert!(matches!(StoreError::from_status(409, "AlreadyExists", "exists"), StoreError::Conflict(_)));
        assert!(StoreError::from_status(404, "NotFound", "gone").is_not_found());
        assert!(matches!(
            StoreError::from_status(403, "Forbidden", "pods \"x\" is forbidden: exceeded quota: compute, requested: cpu=2"),
            StoreError::QuotaExceeded(_)
        ));
        assert!(matches!(StoreError::from_status(403, "Forbidden", "cannot create"), StoreError::PermissionDenied(_)));
        assert!(matches!(StoreError::from_status(401, "Unauthorized", ""), StoreError::PermissionDenied(_)));
        assert!(matches!(StoreError::from_status(422, "Invalid", "bad port"), StoreError::Invalid(_)));
        assert!(matches!(StoreError::from_status(429, "TooManyRequests", ""), StoreError::Transient(_)));
        assert!(matches!(StoreError::from_status(503, "ServiceUnavailable", ""), StoreError::Transient(_)));
        assert!(matches!(StoreError::from_status(410, "Expired", "too old"), StoreError::Transient(_)));
    }

    #[test]
    fn test_detail_includes_reason() {
        let err = StoreError::from_status(409, "Conflict", "the object has been modified");
        assert_eq!(err.to_string(), "Conflict: Conflict: the object has been modified");
    }
}
