//! DevelopmentEnvironment CRD
//!
//! Declares a per-user development environment. The API layer owns `spec`;
//! the environment controller is the sole writer of `status`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::labels;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "dev-platform.company.com",
    version = "v1",
    kind = "DevelopmentEnvironment",
    plural = "developmentenvironments",
    shortname = "devenv",
    status = "DevelopmentEnvironmentStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Team","type":"string","jsonPath":".spec.team"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Expires","type":"date","jsonPath":".status.expiresAt"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DevelopmentEnvironmentSpec {
    /// Human label, unique within a team/project scope
    pub name: String,

    /// Base image alias (e.g. "ubuntu:22.04") or "custom"
    pub base_image: String,

    /// Image reference used when `baseImage` is "custom"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_image: Option<String>,

    /// Packages installed before the environment starts
    #[serde(default)]
    pub packages: Vec<PackageSpec>,

    /// Resource requests
    #[serde(default)]
    pub resources: ResourceRequests,

    /// Resource limits
    #[serde(default)]
    pub limits: ResourceLimits,

    /// Expose an SSH port
    #[serde(default = "default_true", rename = "enableSSH")]
    pub enable_ssh: bool,

    /// Expose a Jupyter notebook server
    #[serde(default, rename = "enableJupyter")]
    pub enable_jupyter: bool,

    /// Expose a VS Code server
    #[serde(default, rename = "enableVSCode")]
    pub enable_vscode: bool,

    /// Owning team
    pub team: String,

    /// Owning project
    pub project: String,

    /// Time to live in hours, counted from creation
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,

    /// Extra environment variables for the main container
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_ttl_hours() -> i64 {
    24
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackageSpec {
    /// Package manager used to install `packages`
    pub manager: PackageManager,

    /// Package names
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    /// Debian/Ubuntu apt
    Apt,
    /// RHEL/CentOS yum
    Yum,
    /// Conda
    Conda,
    /// Python pip
    Pip,
    /// Node npm
    Npm,
}

impl PackageManager {
    /// Lowercase name, matching the wire format
    pub fn as_str(self) -> &'static str {
        match self {
            PackageManager::Apt => "apt",
            PackageManager::Yum => "yum",
            PackageManager::Conda => "conda",
            PackageManager::Pip => "pip",
            PackageManager::Npm => "npm",
        }
    }

    /// System package managers have to run as root inside the init container
    pub fn needs_root(self) -> bool {
        matches!(self, PackageManager::Apt | PackageManager::Yum)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequests {
    /// CPU request (e.g. "1", "500m")
    #[serde(default = "default_cpu_request")]
    pub cpu: String,

    /// Memory request (e.g. "2Gi", "512Mi")
    #[serde(default = "default_memory_request")]
    pub memory: String,

    /// GPU request (e.g. "1")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,

    /// Persistent workspace size; no PVC is created when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

impl Default for ResourceRequests {
    fn default() -> Self {
        Self {
            cpu: default_cpu_request(),
            memory: default_memory_request(),
            gpu: None,
            storage: None,
        }
    }
}

fn default_cpu_request() -> String {
    "1".to_string()
}

fn default_memory_request() -> String {
    "2Gi".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// CPU limit
    #[serde(default = "default_cpu_limit")]
    pub cpu: String,

    /// Memory limit
    #[serde(default = "default_memory_limit")]
    pub memory: String,

    /// GPU limit (defaults to the GPU request)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu: default_cpu_limit(),
            memory: default_memory_limit(),
            gpu: None,
        }
    }
}

fn default_cpu_limit() -> String {
    "2".to_string()
}

fn default_memory_limit() -> String {
    "4Gi".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DevelopmentEnvironmentStatus {
    /// Lifecycle state
    #[serde(default)]
    pub state: EnvironmentState,

    /// When the environment was first observed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// `createdAt + ttlHours`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Timestamp of the reconcile attempt that produced this status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled_at: Option<DateTime<Utc>>,

    /// Most recent failure, if the last attempt failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,

    /// Access endpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<EnvironmentEndpoints>,

    /// Namespace holding the derived objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Hash of the spec fields that cannot change after creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_fingerprint: Option<String>,

    /// `metadata.generation` the status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Human readable note (e.g. normalizations applied to the spec)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Environment lifecycle state
///
/// Serializes as PascalCase ("Running", "Error", etc.) but also accepts
/// lowercase values written by older API versions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "PascalCase")]
pub enum EnvironmentState {
    /// Declared, not yet picked up
    #[default]
    #[serde(alias = "pending")]
    Pending,

    /// Derived objects are being applied
    #[serde(alias = "creating")]
    Creating,

    /// All derived objects applied and healthy
    #[serde(alias = "running")]
    Running,

    /// Previously running, health has regressed
    #[serde(alias = "degraded")]
    Degraded,

    /// Unrecoverable failure; sticky until deleted
    #[serde(alias = "error")]
    Error,

    /// Derived objects are being torn down
    #[serde(alias = "deleting")]
    Deleting,

    /// Teardown confirmed (terminal)
    #[serde(alias = "deleted")]
    Deleted,
}

impl EnvironmentState {
    /// Every state, in lifecycle order
    pub const ALL: [EnvironmentState; 7] = [
        EnvironmentState::Pending,
        EnvironmentState::Creating,
        EnvironmentState::Running,
        EnvironmentState::Degraded,
        EnvironmentState::Error,
        EnvironmentState::Deleting,
        EnvironmentState::Deleted,
    ];

    /// Wire name of the state
    pub fn as_str(self) -> &'static str {
        match self {
            EnvironmentState::Pending => "Pending",
            EnvironmentState::Creating => "Creating",
            EnvironmentState::Running => "Running",
            EnvironmentState::Degraded => "Degraded",
            EnvironmentState::Error => "Error",
            EnvironmentState::Deleting => "Deleting",
            EnvironmentState::Deleted => "Deleted",
        }
    }

    /// `Deleted` is the only terminal state
    pub fn is_terminal(self) -> bool {
        self == EnvironmentState::Deleted
    }

    /// States in which a delete request is redundant
    pub fn is_tearing_down(self) -> bool {
        matches!(self, EnvironmentState::Deleting | EnvironmentState::Deleted)
    }
}

impl std::fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a reconcile failure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorClass {
    /// Structural problem with the desired spec
    SpecInvalid,
    /// Concurrent modification detected by the store
    Conflict,
    /// Network, throttling or timeout
    Transient,
    /// Platform rejected the request on quota grounds
    QuotaExceeded,
    /// The controller is not allowed to perform the call
    PermissionDenied,
    /// Object missing
    NotFound,
}

impl ErrorClass {
    /// Wire name of the class
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::SpecInvalid => "SpecInvalid",
            ErrorClass::Conflict => "Conflict",
            ErrorClass::Transient => "Transient",
            ErrorClass::QuotaExceeded => "QuotaExceeded",
            ErrorClass::PermissionDenied => "PermissionDenied",
            ErrorClass::NotFound => "NotFound",
        }
    }

    /// Structural failures skip the retry budget and go straight to `Error`
    pub fn is_structural(self) -> bool {
        matches!(self, ErrorClass::SpecInvalid | ErrorClass::PermissionDenied)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    /// Failure class
    pub class: ErrorClass,

    /// Failure message
    pub message: String,

    /// When the failure was recorded
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentEndpoints {
    /// SSH connection string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<String>,

    /// HTTPS URL for Jupyter / VS Code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<String>,
}

impl DevelopmentEnvironment {
    /// Opaque environment id (`metadata.uid`)
    pub fn environment_id(&self) -> Option<&str> {
        self.metadata.uid.as_deref()
    }

    /// Current lifecycle state; `Pending` until the controller writes status
    pub fn state(&self) -> EnvironmentState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Kubernetes deletion is in progress (finalizer still held)
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// The API layer asked for teardown without deleting the record
    pub fn delete_requested(&self) -> bool {
        self.annotations()
            .get(labels::DELETE_REQUESTED_ANNOTATION)
            .is_some_and(|v| v != "false")
    }

    /// Last activity reported by the external idle collector
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.annotations()
            .get(labels::LAST_ACTIVITY_ANNOTATION)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// Whether the cleanup finalizer is present
    pub fn has_cleanup_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == labels::CLEANUP_FINALIZER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults_follow_platform_api() {
        let spec: DevelopmentEnvironmentSpec = serde_json::from_value(serde_json::json!({
            "name": "scratch",
            "baseImage": "ubuntu:22.04",
            "team": "eng",
            "project": "demo"
        }))
        .unwrap();

        assert_eq!(spec.resources.cpu, "1");
        assert_eq!(spec.resources.memory, "2Gi");
        assert_eq!(spec.resources.storage, None);
        assert_eq!(spec.limits.cpu, "2");
        assert_eq!(spec.limits.memory, "4Gi");
        assert!(spec.enable_ssh);
        assert!(!spec.enable_jupyter);
        assert!(!spec.enable_vscode);
        assert_eq!(spec.ttl_hours, 24);
    }

    #[test]
    fn test_feature_flags_use_platform_casing() {
        let spec: DevelopmentEnvironmentSpec = serde_json::from_value(serde_json::json!({
            "name": "nb",
            "baseImage": "jupyter/datascience-notebook",
            "team": "ds",
            "project": "p",
            "enableSSH": false,
            "enableJupyter": true,
            "enableVSCode": true
        }))
        .unwrap();

        assert!(!spec.enable_ssh);
        assert!(spec.enable_jupyter);
        assert!(spec.enable_vscode);

        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["enableJupyter"], true);
        assert_eq!(value["enableVSCode"], true);
    }

    #[test]
    fn test_state_accepts_lowercase() {
        let state: EnvironmentState = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(state, EnvironmentState::Running);
        assert_eq!(serde_json::to_string(&state).unwrap(), "\"Running\"");
    }

    #[test]
    fn test_unknown_package_manager_rejected() {
        let result: Result<PackageSpec, _> = serde_json::from_value(serde_json::json!({
            "manager": "brew",
            "packages": ["jq"]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_delete_requested_annotation() {
        let mut env = DevelopmentEnvironment::new(
            "scratch",
            serde_json::from_value(serde_json::json!({
                "name": "scratch",
                "baseImage": "ubuntu:22.04",
                "team": "eng",
                "project": "demo"
            }))
            .unwrap(),
        );
        assert!(!env.delete_requested());

        env.metadata.annotations = Some(BTreeMap::from([(
            labels::DELETE_REQUESTED_ANNOTATION.to_string(),
            "true".to_string(),
        )]));
        assert!(env.delete_requested());
    }

    #[test]
    fn test_last_activity_parses_rfc3339() {
        let mut env = DevelopmentEnvironment::new(
            "scratch",
            serde_json::from_value(serde_json::json!({
                "name": "scratch",
                "baseImage": "ubuntu:22.04",
                "team": "eng",
                "project": "demo"
            }))
            .unwrap(),
        );
        env.metadata.annotations = Some(BTreeMap::from([(
            labels::LAST_ACTIVITY_ANNOTATION.to_string(),
            "2026-03-01T10:00:00Z".to_string(),
        )]));

        let at = env.last_activity().unwrap();
        assert_eq!(at.to_rfc3339(), "2026-03-01T10:00:00+00:00");
    }
}
