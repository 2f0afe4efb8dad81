//! Manifest builders for the derived objects
//!
//! Every object carries the common labels, a single controller owner
//! reference to the environment and a `dev-platform/spec-hash` annotation
//! over its own content.

use std::collections::BTreeMap;
use std::fmt::Debug;

use crds::{DevelopmentEnvironment, PackageManager, PackageSpec, labels};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, EnvVar, LocalObjectReference, Namespace, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec,
    ResourceRequirements, SeccompProfile, SecurityContext, Service, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule, IngressServiceBackend, IngressSpec,
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort,
    NetworkPolicySpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use super::capability::AccessSlice;
use super::placement::Placement;
use super::{ObjectNames, ResolvedResources};
use crate::config::ControllerConfig;

const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";
const GPU_RESOURCE: &str = "nvidia.com/gpu";
const MAIN_CONTAINER: &str = "dev-environment";
const WORKSPACE_VOLUME: &str = "workspace";
const WORKSPACE_PATH: &str = "/workspace";
const TMP_VOLUME: &str = "tmp";
const NON_ROOT_ID: i64 = 1000;

/// Everything the builders need, validated by `translate`
pub(crate) struct ManifestContext<'a> {
    pub env: &'a DevelopmentEnvironment,
    pub config: &'a ControllerConfig,
    pub names: &'a ObjectNames,
    pub image: String,
    pub resources: &'a ResolvedResources,
    pub access: &'a AccessSlice,
    pub placement: &'a Placement,
}

impl ManifestContext<'_> {
    fn owner_references(&self) -> Option<Vec<OwnerReference>> {
        self.env.controller_owner_ref(&()).map(|owner| vec![owner])
    }

    /// managed-by, environment-id, team and project
    fn common_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (labels::MANAGED_BY_LABEL.to_string(), labels::MANAGED_BY_VALUE.to_string()),
            (labels::ENVIRONMENT_ID_LABEL.to_string(), self.names.environment_id.clone()),
            (labels::TEAM_LABEL.to_string(), self.env.spec.team.clone()),
            (labels::PROJECT_LABEL.to_string(), self.env.spec.project.clone()),
        ])
    }

    fn app_selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(labels::APP_LABEL.to_string(), self.names.workload.clone())])
    }

    fn metadata(&self, name: &str, namespace: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(str::to_string),
            labels: Some(self.common_labels()),
            owner_references: self.owner_references(),
            ..Default::default()
        }
    }

    fn namespaced_metadata(&self, name: &str) -> ObjectMeta {
        self.metadata(name, Some(&self.names.namespace))
    }

    fn needs_root(&self) -> bool {
        self.env.spec.packages.iter().any(|p| p.manager.needs_root())
    }
}

/// Digest of an object's content, ignoring any previous digest
pub fn content_hash<K: Resource + Serialize + Clone + Debug>(object: &K) -> String {
    let mut copy = object.clone();
    if let Some(annotations) = copy.meta_mut().annotations.as_mut() {
        annotations.remove(labels::SPEC_HASH_ANNOTATION);
        if annotations.is_empty() {
            copy.meta_mut().annotations = None;
        }
    }
    let mut hasher = Sha256::new();
    if let Err(e) = serde_json::to_writer(&mut hasher, &copy) {
        warn!("Hashing {} by its debug form: {}", copy.name_any(), e);
        hasher.update(format!("{copy:?}"));
    }
    format!("{:x}", hasher.finalize())
}

fn stamp<K: Resource + Serialize + Clone + Debug>(mut object: K) -> K {
    let digest = content_hash(&object);
    object
        .annotations_mut()
        .insert(labels::SPEC_HASH_ANNOTATION.to_string(), digest);
    object
}

pub(crate) fn namespace(ctx: &ManifestContext<'_>) -> Namespace {
    let level = if ctx.needs_root() { "baseline" } else { "restricted" };
    let mut metadata = ctx.metadata(&ctx.names.namespace, None);
    if let Some(labels) = metadata.labels.as_mut() {
        for mode in ["enforce", "audit", "warn"] {
            labels.insert(format!("pod-security.kubernetes.io/{}", mode), level.to_string());
        }
    }
    stamp(Namespace {
        metadata,
        ..Default::default()
    })
}

pub(crate) fn network_policy(ctx: &ManifestContext<'_>) -> NetworkPolicy {
    let from_namespace = |name: &str| NetworkPolicyPeer {
        namespace_selector: Some(LabelSelector {
            match_labels: Some(BTreeMap::from([(NAMESPACE_NAME_LABEL.to_string(), name.to_string())])),
            ..Default::default()
        }),
        ..Default::default()
    };
    let port = |protocol: &str, number: i32| NetworkPolicyPort {
        protocol: Some(protocol.to_string()),
        port: Some(IntOrString::Int(number)),
        ..Default::default()
    };

    let pod_selector = LabelSelector {
        match_labels: Some(BTreeMap::from([(
            labels::ENVIRONMENT_ID_LABEL.to_string(),
            ctx.names.environment_id.clone(),
        )])),
        ..Default::default()
    };

    stamp(NetworkPolicy {
        metadata: ctx.namespaced_metadata(&ctx.names.network_policy),
        spec: Some(NetworkPolicySpec {
            pod_selector: pod_selector.into(),
            policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
            ingress: Some(vec![
                NetworkPolicyIngressRule {
                    from: Some(vec![from_namespace(&ctx.config.ingress_namespace)]),
                    ..Default::default()
                },
                NetworkPolicyIngressRule {
                    from: Some(vec![from_namespace(&ctx.names.namespace)]),
                    ..Default::default()
                },
            ]),
            egress: Some(vec![
                NetworkPolicyEgressRule {
                    ports: Some(vec![port("UDP", 53), port("TCP", 53)]),
                    ..Default::default()
                },
                NetworkPolicyEgressRule {
                    ports: Some(vec![port("TCP", 443), port("TCP", 80)]),
                    ..Default::default()
                },
                NetworkPolicyEgressRule {
                    to: Some(vec![from_namespace(&ctx.names.namespace)]),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
    })
}

pub(crate) fn persistent_volume_claim(ctx: &ManifestContext<'_>) -> Option<PersistentVolumeClaim> {
    let size = ctx.resources.storage.as_ref()?;
    Some(stamp(PersistentVolumeClaim {
        metadata: ctx.namespaced_metadata(&ctx.names.pvc),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some(ctx.config.storage_class.clone()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size.clone()))])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }))
}

pub(crate) fn deployment(ctx: &ManifestContext<'_>) -> Deployment {
    let mut pod_labels = ctx.common_labels();
    pod_labels.extend(ctx.app_selector());

    let init_containers: Vec<Container> = ctx
        .env
        .spec
        .packages
        .iter()
        .enumerate()
        .map(|(index, packages)| install_container(ctx, index, packages))
        .collect();

    let workspace = if ctx.resources.storage.is_some() {
        Volume {
            name: WORKSPACE_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: ctx.names.pvc.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }
    } else {
        Volume {
            name: WORKSPACE_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }
    };
    let tmp = Volume {
        name: TMP_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource {
            size_limit: Some(Quantity("1Gi".to_string())),
            ..Default::default()
        }),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        init_containers: if init_containers.is_empty() { None } else { Some(init_containers) },
        containers: vec![main_container(ctx)],
        volumes: Some(vec![workspace, tmp]),
        security_context: Some(PodSecurityContext {
            fs_group: Some(NON_ROOT_ID),
            seccomp_profile: Some(SeccompProfile {
                type_: "RuntimeDefault".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        node_selector: Some(ctx.placement.node_selector.clone()),
        tolerations: Some(ctx.placement.tolerations.clone()),
        image_pull_secrets: ctx.config.registry_secret.as_ref().map(|secret| {
            vec![LocalObjectReference {
                name: secret.clone().into(),
            }]
        }),
        termination_grace_period_seconds: Some(30),
        ..Default::default()
    };

    stamp(Deployment {
        metadata: ctx.namespaced_metadata(&ctx.names.workload),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(ctx.app_selector()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(BTreeMap::from([
                        ("prometheus.io/scrape".to_string(), "true".to_string()),
                        ("prometheus.io/port".to_string(), "9090".to_string()),
                        ("prometheus.io/path".to_string(), "/metrics".to_string()),
                    ])),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn main_container(ctx: &ManifestContext<'_>) -> Container {
    let spec = &ctx.env.spec;
    let mut env: Vec<EnvVar> = spec
        .environment_variables
        .iter()
        .map(|(name, value)| env_var(name, value))
        .collect();
    env.push(env_var("ENVIRONMENT_ID", &ctx.names.environment_id));
    env.push(env_var("TEAM", &spec.team));
    env.push(env_var("PROJECT", &spec.project));

    let mut requests = BTreeMap::from([
        ("cpu".to_string(), Quantity(ctx.resources.cpu_request.clone())),
        ("memory".to_string(), Quantity(ctx.resources.memory_request.clone())),
    ]);
    let mut limits = BTreeMap::from([
        ("cpu".to_string(), Quantity(ctx.resources.cpu_limit.clone())),
        ("memory".to_string(), Quantity(ctx.resources.memory_limit.clone())),
    ]);
    if let Some(gpu) = ctx.resources.gpu {
        requests.insert(GPU_RESOURCE.to_string(), Quantity(gpu.to_string()));
        limits.insert(GPU_RESOURCE.to_string(), Quantity(gpu.to_string()));
    }

    Container {
        name: MAIN_CONTAINER.to_string(),
        image: Some(ctx.image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec!["while true; do sleep 30; done".to_string()]),
        env: Some(env),
        ports: Some(ctx.access.container_ports.clone()),
        resources: Some(ResourceRequirements {
            requests: Some(requests),
            limits: Some(limits),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            VolumeMount {
                name: WORKSPACE_VOLUME.to_string(),
                mount_path: WORKSPACE_PATH.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: TMP_VOLUME.to_string(),
                mount_path: "/tmp".to_string(),
                ..Default::default()
            },
        ]),
        security_context: Some(restricted_security_context()),
        ..Default::default()
    }
}

/// One init container per package list
fn install_container(ctx: &ManifestContext<'_>, index: usize, packages: &PackageSpec) -> Container {
    let names = packages.packages.join(" ");
    let script = match packages.manager {
        PackageManager::Apt => format!("apt-get update && apt-get install -y --no-install-recommends {}", names),
        PackageManager::Yum => format!("yum install -y {}", names),
        PackageManager::Conda => format!("conda install -y {}", names),
        PackageManager::Pip => format!("pip install --no-cache-dir {}", names),
        PackageManager::Npm => format!("npm install --prefix {} {}", WORKSPACE_PATH, names),
    };

    let security_context = if packages.manager.needs_root() {
        SecurityContext {
            run_as_user: Some(0),
            run_as_non_root: Some(false),
            ..Default::default()
        }
    } else {
        restricted_security_context()
    };

    Container {
        name: format!("install-{}-packages-{}", packages.manager.as_str(), index),
        image: Some(ctx.image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec![script]),
        volume_mounts: Some(vec![VolumeMount {
            name: WORKSPACE_VOLUME.to_string(),
            mount_path: WORKSPACE_PATH.to_string(),
            ..Default::default()
        }]),
        security_context: Some(security_context),
        ..Default::default()
    }
}

fn restricted_security_context() -> SecurityContext {
    SecurityContext {
        run_as_non_root: Some(true),
        run_as_user: Some(NON_ROOT_ID),
        run_as_group: Some(NON_ROOT_ID),
        allow_privilege_escalation: Some(false),
        read_only_root_filesystem: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

pub(crate) fn service(ctx: &ManifestContext<'_>) -> Service {
    let mut metadata = ctx.namespaced_metadata(&ctx.names.service);
    if ctx.config.service_type == "LoadBalancer" {
        metadata.annotations = Some(BTreeMap::from([
            (
                "service.beta.kubernetes.io/aws-load-balancer-type".to_string(),
                "nlb".to_string(),
            ),
            (
                "service.beta.kubernetes.io/aws-load-balancer-scheme".to_string(),
                "internet-facing".to_string(),
            ),
        ]));
    }

    stamp(Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: Some(ctx.config.service_type.clone()),
            selector: Some(ctx.app_selector()),
            ports: Some(ctx.access.service_ports.clone()),
            session_affinity: Some("ClientIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Only built when an HTTP capability is enabled
pub(crate) fn ingress(ctx: &ManifestContext<'_>) -> Option<Ingress> {
    if !ctx.access.has_web() {
        return None;
    }
    let paths = ctx
        .access
        .routes
        .iter()
        .map(|route| HTTPIngressPath {
            path: Some(route.path.to_string()),
            path_type: "Prefix".to_string(),
            backend: IngressBackend {
                service: Some(IngressServiceBackend {
                    name: ctx.names.service.clone(),
                    port: Some(ServiceBackendPort {
                        number: Some(route.port),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            },
        })
        .collect();

    Some(stamp(Ingress {
        metadata: ctx.namespaced_metadata(&ctx.names.ingress),
        spec: Some(IngressSpec {
            ingress_class_name: Some(ctx.config.ingress_class.clone()),
            rules: Some(vec![IngressRule {
                host: Some(ctx.names.host.clone()),
                http: Some(HTTPIngressRuleValue { paths }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }))
}
