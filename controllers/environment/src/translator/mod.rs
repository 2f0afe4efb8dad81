//! Spec Translator
//!
//! `translate` maps a `DevelopmentEnvironment` onto the native objects that
//! realize it. It is pure: no cluster access, no clock, and the same input
//! always yields the same `DesiredObjectSet`. Any validation failure returns
//! `SpecInvalid` and no objects at all.

pub mod capability;
pub mod manifests;
pub mod placement;
pub mod quantity;

use std::collections::BTreeMap;

use crds::{DevelopmentEnvironment, DevelopmentEnvironmentSpec, EnvironmentEndpoints, PackageSpec};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use resource_store::{NativeObject, ObjectKey, ObjectKind};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::ControllerConfig;
use capability::{Capability, access_slice};
use quantity::{parse_gpu, parse_quantity};

/// The desired spec cannot be realized
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SpecInvalid(pub String);

/// Environment variable names the controller sets itself
pub const RESERVED_ENV_VARS: [&str; 3] = ["ENVIRONMENT_ID", "TEAM", "PROJECT"];

/// Stable names of every derived object, computed from the environment id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectNames {
    pub environment_id: String,
    pub namespace: String,
    pub workload: String,
    pub service: String,
    pub ingress: String,
    pub pvc: String,
    pub network_policy: String,
    pub host: String,
}

impl ObjectNames {
    pub fn for_environment(environment_id: &str, domain_suffix: &str) -> Self {
        let short: String = environment_id
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .take(8)
            .collect::<String>()
            .to_ascii_lowercase();
        let base = format!("dev-env-{}", short);
        Self {
            environment_id: environment_id.to_string(),
            namespace: base.clone(),
            workload: base.clone(),
            service: format!("{}-service", base),
            ingress: format!("{}-ingress", base),
            pvc: "workspace-storage".to_string(),
            network_policy: "dev-env-isolation".to_string(),
            host: format!("{}.{}", base, domain_suffix),
        }
    }

    /// Every derived object, dependents first
    pub fn teardown_order(&self) -> Vec<ObjectKey> {
        let ns = self.namespace.as_str();
        vec![
            ObjectKey::namespaced(ObjectKind::Ingress, ns, &self.ingress),
            ObjectKey::namespaced(ObjectKind::Service, ns, &self.service),
            ObjectKey::namespaced(ObjectKind::Deployment, ns, &self.workload),
            ObjectKey::namespaced(ObjectKind::NetworkPolicy, ns, &self.network_policy),
            ObjectKey::namespaced(ObjectKind::PersistentVolumeClaim, ns, &self.pvc),
            ObjectKey::cluster(ObjectKind::Namespace, ns),
        ]
    }

    pub fn deployment_key(&self) -> ObjectKey {
        ObjectKey::namespaced(ObjectKind::Deployment, &self.namespace, &self.workload)
    }

    /// Endpoints share the Service's name
    pub fn endpoints_key(&self) -> ObjectKey {
        ObjectKey::namespaced(ObjectKind::Endpoints, &self.namespace, &self.service)
    }
}

/// Manifests for one environment plus the values reported in status
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredObjectSet {
    pub names: ObjectNames,
    pub namespace: Namespace,
    pub network_policy: NetworkPolicy,
    pub pvc: Option<PersistentVolumeClaim>,
    pub deployment: Deployment,
    pub service: Service,
    pub ingress: Option<Ingress>,
    pub endpoints: EnvironmentEndpoints,
    /// TTL after clamping
    pub ttl_hours: i64,
    /// Non-fatal normalizations applied to the spec
    pub notes: Vec<String>,
    /// Hash of the fields that cannot change after creation
    pub fingerprint: String,
}

impl DesiredObjectSet {
    /// Manifests in dependency order
    pub fn creation_order(&self) -> Vec<NativeObject> {
        let mut objects = vec![
            NativeObject::from(self.namespace.clone()),
            NativeObject::from(self.network_policy.clone()),
        ];
        if let Some(pvc) = &self.pvc {
            objects.push(pvc.clone().into());
        }
        objects.push(self.deployment.clone().into());
        objects.push(self.service.clone().into());
        if let Some(ingress) = &self.ingress {
            objects.push(ingress.clone().into());
        }
        objects
    }

    pub fn message(&self) -> Option<String> {
        if self.notes.is_empty() {
            None
        } else {
            Some(self.notes.join("; "))
        }
    }
}

/// Validated resource settings handed to the manifest builders
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedResources {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
    pub gpu: Option<u32>,
    pub storage: Option<String>,
}

/// Translate an environment into its desired objects
pub fn translate(env: &DevelopmentEnvironment, config: &ControllerConfig) -> Result<DesiredObjectSet, SpecInvalid> {
    let spec = &env.spec;
    let environment_id = env
        .environment_id()
        .ok_or_else(|| SpecInvalid("environment has no uid yet".to_string()))?;

    validate_label_value("team", &spec.team)?;
    validate_label_value("project", &spec.project)?;
    let image = resolve_image(spec, config)?;

    let capabilities = Capability::enabled(spec);
    if capabilities.is_empty() {
        return Err(SpecInvalid(
            "at least one of enableSSH, enableJupyter or enableVSCode must be set".to_string(),
        ));
    }
    let access = access_slice(&capabilities);

    let resources = resolve_resources(spec)?;
    let memory_limit = parse_quantity(&resources.memory_limit).map_err(SpecInvalid)?;
    let placement = placement::place(&config.placement, resources.gpu.is_some(), memory_limit)?;

    validate_packages(&spec.packages)?;
    validate_environment_variables(&spec.environment_variables)?;

    let mut notes = Vec::new();
    let ttl_hours = spec.ttl_hours.clamp(config.min_ttl_hours, config.max_ttl_hours);
    if ttl_hours != spec.ttl_hours {
        notes.push(format!("ttlHours {} clamped to {}", spec.ttl_hours, ttl_hours));
    }

    let names = ObjectNames::for_environment(environment_id, &config.domain_suffix);
    let ctx = manifests::ManifestContext {
        env,
        config,
        names: &names,
        image,
        resources: &resources,
        access: &access,
        placement: &placement,
    };

    let endpoints = EnvironmentEndpoints {
        ssh: capabilities
            .contains(&Capability::Ssh)
            .then(|| format!("ssh {}", names.host)),
        web: access.has_web().then(|| format!("https://{}", names.host)),
    };

    Ok(DesiredObjectSet {
        namespace: manifests::namespace(&ctx),
        network_policy: manifests::network_policy(&ctx),
        pvc: manifests::persistent_volume_claim(&ctx),
        deployment: manifests::deployment(&ctx),
        service: manifests::service(&ctx),
        ingress: manifests::ingress(&ctx),
        endpoints,
        ttl_hours,
        notes,
        fingerprint: fingerprint(spec),
        names,
    })
}

/// Hash of the spec fields that may not change after creation
pub fn fingerprint(spec: &DevelopmentEnvironmentSpec) -> String {
    let mut hasher = Sha256::new();
    // Length-prefixed so adjacent fields cannot run into each other
    let mut field = |value: &[u8]| {
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    };

    field(spec.name.as_bytes());
    field(spec.base_image.as_bytes());
    field(spec.custom_image.as_deref().unwrap_or_default().as_bytes());
    field(&[u8::from(spec.custom_image.is_some())]);
    for group in &spec.packages {
        field(group.manager.as_str().as_bytes());
        for package in &group.packages {
            field(package.as_bytes());
        }
        field(&[]);
    }
    field(&[
        u8::from(spec.enable_ssh),
        u8::from(spec.enable_jupyter),
        u8::from(spec.enable_vscode),
    ]);
    field(spec.team.as_bytes());
    field(spec.project.as_bytes());
    for (key, value) in &spec.environment_variables {
        field(key.as_bytes());
        field(value.as_bytes());
    }

    format!("{:x}", hasher.finalize())
}

fn resolve_image(spec: &DevelopmentEnvironmentSpec, config: &ControllerConfig) -> Result<String, SpecInvalid> {
    if spec.base_image == "custom" {
        return match spec.custom_image.as_deref().map(str::trim) {
            Some(image) if !image.is_empty() => Ok(image.to_string()),
            _ => Err(SpecInvalid("baseImage \"custom\" requires a non-empty customImage".to_string())),
        };
    }
    config
        .base_images
        .get(&spec.base_image)
        .cloned()
        .ok_or_else(|| SpecInvalid(format!("unknown base image alias {:?}", spec.base_image)))
}

fn resolve_resources(spec: &DevelopmentEnvironmentSpec) -> Result<ResolvedResources, SpecInvalid> {
    let requests = &spec.resources;
    let limits = &spec.limits;

    check_not_above("cpu", &requests.cpu, &limits.cpu)?;
    check_not_above("memory", &requests.memory, &limits.memory)?;

    let gpu_request = requests.gpu.as_deref().map(parse_gpu).transpose().map_err(SpecInvalid)?;
    let gpu_limit = limits.gpu.as_deref().map(parse_gpu).transpose().map_err(SpecInvalid)?;
    let gpu = match (gpu_request, gpu_limit) {
        (Some(request), Some(limit)) if request > limit => {
            return Err(SpecInvalid(format!(
                "resources.gpu {} exceeds limits.gpu {}",
                request, limit
            )));
        }
        (Some(request), Some(limit)) if request < limit => {
            return Err(SpecInvalid(format!(
                "resources.gpu {} must equal limits.gpu {}; GPUs cannot be overcommitted",
                request, limit
            )));
        }
        (Some(count), _) | (None, Some(count)) => Some(count),
        (None, None) => None,
    }
    .filter(|count| *count > 0);

    let storage = match requests.storage.as_deref().map(str::trim) {
        Some(size) if !size.is_empty() => {
            let parsed = parse_quantity(size).map_err(|e| SpecInvalid(format!("resources.storage: {}", e)))?;
            if parsed == 0 {
                return Err(SpecInvalid("resources.storage must be greater than zero".to_string()));
            }
            Some(size.to_string())
        }
        _ => None,
    };

    Ok(ResolvedResources {
        cpu_request: requests.cpu.trim().to_string(),
        cpu_limit: limits.cpu.trim().to_string(),
        memory_request: requests.memory.trim().to_string(),
        memory_limit: limits.memory.trim().to_string(),
        gpu,
        storage,
    })
}

fn check_not_above(resource: &str, request: &str, limit: &str) -> Result<(), SpecInvalid> {
    let parsed_request = parse_quantity(request).map_err(|e| SpecInvalid(format!("resources.{}: {}", resource, e)))?;
    let parsed_limit = parse_quantity(limit).map_err(|e| SpecInvalid(format!("limits.{}: {}", resource, e)))?;
    if parsed_request > parsed_limit {
        return Err(SpecInvalid(format!(
            "resources.{} {} exceeds limits.{} {}",
            resource, request, resource, limit
        )));
    }
    Ok(())
}

/// Kubernetes label value: at most 63 characters, alphanumeric at both ends,
/// `-`, `_` and `.` in between
fn validate_label_value(field: &str, value: &str) -> Result<(), SpecInvalid> {
    let valid = !value.is_empty()
        && value.len() <= 63
        && value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && value.starts_with(|c: char| c.is_ascii_alphanumeric())
        && value.ends_with(|c: char| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(SpecInvalid(format!("{} {:?} is not a valid label value", field, value)))
    }
}

/// Package names end up in an init container's shell command
fn validate_packages(packages: &[PackageSpec]) -> Result<(), SpecInvalid> {
    for entry in packages {
        if entry.packages.is_empty() {
            return Err(SpecInvalid(format!(
                "package list for {} is empty",
                entry.manager.as_str()
            )));
        }
        for name in &entry.packages {
            let safe = name.starts_with(|c: char| c.is_ascii_alphanumeric())
                && name.len() <= 214
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+' | '=' | ':' | '@' | '/'));
            if !safe {
                return Err(SpecInvalid(format!(
                    "{} package name {:?} contains unsupported characters",
                    entry.manager.as_str(),
                    name
                )));
            }
        }
    }
    Ok(())
}

fn validate_environment_variables(vars: &BTreeMap<String, String>) -> Result<(), SpecInvalid> {
    for name in vars.keys() {
        let identifier = name.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !identifier {
            return Err(SpecInvalid(format!("environment variable name {:?} is invalid", name)));
        }
        if RESERVED_ENV_VARS.contains(&name.as_str()) {
            return Err(SpecInvalid(format!("environment variable {} is set by the platform", name)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod translate_test;
