//! Well-known labels, annotations and finalizers
//!
//! Every object derived from a `DevelopmentEnvironment` carries the
//! managed-by and environment-id labels so it can be correlated back to its
//! owner (and swept when the owner is gone).

/// API group of the custom resources
pub const API_GROUP: &str = "dev-platform.company.com";

/// `app.kubernetes.io/managed-by` label key
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label on every derived object
pub const MANAGED_BY_VALUE: &str = "dev-platform";

/// Owning environment id (`metadata.uid` of the environment)
pub const ENVIRONMENT_ID_LABEL: &str = "dev-platform/environment-id";

/// Owning team
pub const TEAM_LABEL: &str = "dev-platform/team";

/// Owning project
pub const PROJECT_LABEL: &str = "dev-platform/project";

/// Pod selector label shared by the workload, service and network policy
pub const APP_LABEL: &str = "app";

/// Digest of the desired manifest an object was last applied from
pub const SPEC_HASH_ANNOTATION: &str = "dev-platform/spec-hash";

/// Set by the API layer to request teardown without deleting the record
pub const DELETE_REQUESTED_ANNOTATION: &str = "dev-platform.company.com/delete-requested";

/// RFC 3339 timestamp of the last observed user activity
pub const LAST_ACTIVITY_ANNOTATION: &str = "dev-platform.company.com/last-activity";

/// Held on the environment until its derived objects are gone
pub const CLEANUP_FINALIZER: &str = "dev-platform.company.com/environment-cleanup";

/// Label selector matching every derived object
pub fn managed_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")
}
