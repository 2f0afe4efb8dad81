//! Unit tests for the spec translator

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::config::ControllerConfig;
    use crate::test_utils::*;
    use crds::{PackageManager, PackageSpec, labels};

    fn translate_spec(spec: DevelopmentEnvironmentSpec) -> Result<DesiredObjectSet, SpecInvalid> {
        translate(&create_test_environment("scratch", spec), &ControllerConfig::default())
    }

    #[test]
    fn test_translation_is_deterministic() {
        let mut spec = create_test_spec();
        spec.enable_jupyter = true;
        spec.resources.storage = Some("20Gi".to_string());
        spec.packages = vec![PackageSpec {
            manager: PackageManager::Pip,
            packages: vec!["numpy".to_string(), "pandas==2.2.0".to_string()],
        }];
        spec.environment_variables.insert("EDITOR".to_string(), "vim".to_string());

        let first = translate_spec(spec.clone()).unwrap();
        let second = translate_spec(spec).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_vec(&first.deployment).unwrap(),
            serde_json::to_vec(&second.deployment).unwrap()
        );
    }

    #[test]
    fn test_ssh_only_scenario() {
        let desired = translate_spec(create_test_spec()).unwrap();

        assert_eq!(desired.names.namespace, "dev-env-3f2a9c1e");
        assert!(desired.ingress.is_none());
        assert!(desired.pvc.is_none());

        let ports = desired.service.spec.as_ref().unwrap().ports.as_ref().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name.as_deref(), Some("ssh"));
        assert_eq!(ports[0].port, 22);

        let kinds: Vec<ObjectKind> = desired.creation_order().iter().map(|o| o.kind()).collect();
        assert_eq!(
            kinds,
            vec![ObjectKind::Namespace, ObjectKind::NetworkPolicy, ObjectKind::Deployment, ObjectKind::Service]
        );

        assert_eq!(desired.endpoints.ssh.as_deref(), Some("ssh dev-env-3f2a9c1e.dev.company.com"));
        assert_eq!(desired.endpoints.web, None);
        assert!(desired.notes.is_empty());
    }

    #[test]
    fn test_web_capabilities_create_ingress() {
        let mut spec = create_test_spec();
        spec.enable_ssh = false;
        spec.enable_jupyter = true;
        spec.enable_vscode = true;
        let desired = translate_spec(spec).unwrap();

        let ingress = desired.ingress.as_ref().unwrap();
        let rule = &ingress.spec.as_ref().unwrap().rules.as_ref().unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("dev-env-3f2a9c1e.dev.company.com"));
        let paths: Vec<_> = rule.http.as_ref().unwrap().paths.iter().map(|p| p.path.clone().unwrap()).collect();
        assert_eq!(paths, vec!["/jupyter".to_string(), "/".to_string()]);

        assert_eq!(desired.endpoints.ssh, None);
        assert_eq!(desired.endpoints.web.as_deref(), Some("https://dev-env-3f2a9c1e.dev.company.com"));
    }

    #[test]
    fn test_every_object_has_one_owner_and_labels() {
        let mut spec = create_test_spec();
        spec.enable_vscode = true;
        spec.resources.storage = Some("10Gi".to_string());
        let desired = translate_spec(spec).unwrap();

        for object in desired.creation_order() {
            let meta = object.metadata();
            let owners = meta.owner_references.as_ref().unwrap();
            assert_eq!(owners.len(), 1, "{} must have one owner", object.key());
            assert_eq!(owners[0].uid, TEST_UID);
            assert_eq!(owners[0].kind, "DevelopmentEnvironment");

            let object_labels = object.labels().unwrap();
            assert_eq!(object_labels[labels::ENVIRONMENT_ID_LABEL], TEST_UID);
            assert_eq!(object_labels[labels::MANAGED_BY_LABEL], labels::MANAGED_BY_VALUE);
            assert!(object.annotation(labels::SPEC_HASH_ANNOTATION).is_some());
        }
    }

    #[test]
    fn test_spec_hash_tracks_content() {
        let base = translate_spec(create_test_spec()).unwrap();
        let mut scaled = create_test_spec();
        scaled.limits.cpu = "4".to_string();
        let scaled = translate_spec(scaled).unwrap();

        let hash = |d: &Deployment| d.metadata.annotations.as_ref().unwrap()[labels::SPEC_HASH_ANNOTATION].clone();
        assert_ne!(hash(&base.deployment), hash(&scaled.deployment));
        assert_eq!(
            base.service.metadata.annotations.as_ref().unwrap()[labels::SPEC_HASH_ANNOTATION],
            scaled.service.metadata.annotations.as_ref().unwrap()[labels::SPEC_HASH_ANNOTATION]
        );
        assert_eq!(manifests::content_hash(&base.deployment), hash(&base.deployment));
    }

    #[test]
    fn test_custom_image_required() {
        let mut spec = create_test_spec();
        spec.base_image = "custom".to_string();
        assert!(translate_spec(spec.clone()).is_err());

        spec.custom_image = Some("  ".to_string());
        assert!(translate_spec(spec.clone()).is_err());

        spec.custom_image = Some("registry.company.com/ml/torch:2.3".to_string());
        let desired = translate_spec(spec).unwrap();
        let pod = desired.deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("registry.company.com/ml/torch:2.3"));
    }

    #[test]
    fn test_unknown_base_image_rejected() {
        let mut spec = create_test_spec();
        spec.base_image = "debian:12".to_string();
        let err = translate_spec(spec).unwrap_err();
        assert!(err.0.contains("debian:12"));
    }

    #[test]
    fn test_no_capability_rejected() {
        let mut spec = create_test_spec();
        spec.enable_ssh = false;
        assert!(translate_spec(spec).is_err());
    }

    #[test]
    fn test_memory_request_above_limit_rejected() {
        let mut spec = create_test_spec();
        spec.resources.memory = "8Gi".to_string();
        spec.limits.memory = "4Gi".to_string();
        let err = translate_spec(spec).unwrap_err();
        assert!(err.0.contains("exceeds"), "{}", err);
    }

    #[test]
    fn test_cpu_request_above_limit_rejected() {
        let mut spec = create_test_spec();
        spec.resources.cpu = "2500m".to_string();
        spec.limits.cpu = "2".to_string();
        assert!(translate_spec(spec).is_err());
    }

    #[test]
    fn test_unparseable_quantity_rejected() {
        let mut spec = create_test_spec();
        spec.resources.memory = "two gigs".to_string();
        assert!(translate_spec(spec).is_err());
    }

    #[test]
    fn test_gpu_limit_defaults_to_request() {
        let mut spec = create_test_spec();
        spec.resources.gpu = Some("1".to_string());
        let desired = translate_spec(spec).unwrap();

        let pod = desired.deployment.spec.unwrap().template.spec.unwrap();
        let resources = pod.containers[0].resources.as_ref().unwrap();
        assert_eq!(resources.limits.as_ref().unwrap()["nvidia.com/gpu"].0, "1");
        assert_eq!(resources.requests.as_ref().unwrap()["nvidia.com/gpu"].0, "1");
        assert_eq!(pod.node_selector.unwrap()["workload-type"], "gpu");
    }

    #[test]
    fn test_gpu_request_above_limit_rejected() {
        let mut spec = create_test_spec();
        spec.resources.gpu = Some("2".to_string());
        spec.limits.gpu = Some("1".to_string());
        assert!(translate_spec(spec).is_err());
    }

    #[test]
    fn test_gpu_without_pool_rejected() {
        let mut config = ControllerConfig::default();
        config.placement.gpu_pool = None;
        let mut spec = create_test_spec();
        spec.resources.gpu = Some("1".to_string());
        assert!(translate(&create_test_environment("scratch", spec), &config).is_err());
    }

    #[test]
    fn test_high_memory_placement() {
        let mut spec = create_test_spec();
        spec.resources.memory = "64Gi".to_string();
        spec.limits.memory = "128Gi".to_string();
        let desired = translate_spec(spec).unwrap();
        let pod = desired.deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.node_selector.unwrap()["workload-type"], "high-memory");
        assert_eq!(pod.tolerations.unwrap()[0].value.as_deref(), Some("high-memory"));
    }

    #[test]
    fn test_ttl_clamped_with_note() {
        let mut spec = create_test_spec();
        spec.ttl_hours = 1_000;
        let desired = translate_spec(spec).unwrap();
        assert_eq!(desired.ttl_hours, 168);
        assert_eq!(desired.message().as_deref(), Some("ttlHours 1000 clamped to 168"));

        let mut spec = create_test_spec();
        spec.ttl_hours = 0;
        assert_eq!(translate_spec(spec).unwrap().ttl_hours, 1);
    }

    #[test]
    fn test_storage_creates_pvc_and_mounts_it() {
        let mut spec = create_test_spec();
        spec.resources.storage = Some("50Gi".to_string());
        let desired = translate_spec(spec).unwrap();

        let pvc = desired.pvc.as_ref().unwrap();
        let pvc_spec = pvc.spec.as_ref().unwrap();
        assert_eq!(pvc_spec.storage_class_name.as_deref(), Some("gp3"));
        assert_eq!(pvc_spec.access_modes.as_ref().unwrap(), &vec!["ReadWriteOnce".to_string()]);

        let pod = desired.deployment.spec.unwrap().template.spec.unwrap();
        let workspace = &pod.volumes.unwrap()[0];
        assert_eq!(
            workspace.persistent_volume_claim.as_ref().unwrap().claim_name,
            "workspace-storage"
        );
    }

    #[test]
    fn test_root_package_manager_relaxes_pod_security() {
        let mut spec = create_test_spec();
        spec.packages = vec![
            PackageSpec {
                manager: PackageManager::Apt,
                packages: vec!["build-essential".to_string()],
            },
            PackageSpec {
                manager: PackageManager::Pip,
                packages: vec!["requests".to_string()],
            },
        ];
        let desired = translate_spec(spec).unwrap();

        let ns_labels = desired.namespace.metadata.labels.as_ref().unwrap();
        assert_eq!(ns_labels["pod-security.kubernetes.io/enforce"], "baseline");

        let pod = desired.deployment.spec.unwrap().template.spec.unwrap();
        let init = pod.init_containers.unwrap();
        assert_eq!(init[0].name, "install-apt-packages-0");
        assert_eq!(init[0].security_context.as_ref().unwrap().run_as_user, Some(0));
        assert_eq!(init[1].name, "install-pip-packages-1");
        assert_eq!(init[1].security_context.as_ref().unwrap().run_as_non_root, Some(true));
    }

    #[test]
    fn test_default_pod_security_is_restricted() {
        let desired = translate_spec(create_test_spec()).unwrap();
        let ns_labels = desired.namespace.metadata.labels.as_ref().unwrap();
        assert_eq!(ns_labels["pod-security.kubernetes.io/enforce"], "restricted");
    }

    #[test]
    fn test_unsafe_package_name_rejected() {
        let mut spec = create_test_spec();
        spec.packages = vec![PackageSpec {
            manager: PackageManager::Pip,
            packages: vec!["numpy; rm -rf /".to_string()],
        }];
        assert!(translate_spec(spec).is_err());
    }

    #[test]
    fn test_reserved_environment_variable_rejected() {
        let mut spec = create_test_spec();
        spec.environment_variables.insert("TEAM".to_string(), "other".to_string());
        assert!(translate_spec(spec).is_err());

        let mut spec = create_test_spec();
        spec.environment_variables.insert("1BAD".to_string(), "x".to_string());
        assert!(translate_spec(spec).is_err());
    }

    #[test]
    fn test_platform_environment_variables_set() {
        let mut spec = create_test_spec();
        spec.environment_variables.insert("EDITOR".to_string(), "vim".to_string());
        let desired = translate_spec(spec).unwrap();
        let pod = desired.deployment.spec.unwrap().template.spec.unwrap();
        let env: Vec<(String, String)> = pod.containers[0]
            .env
            .as_ref()
            .unwrap()
            .iter()
            .map(|e| (e.name.clone(), e.value.clone().unwrap()))
            .collect();
        assert_eq!(
            env,
            vec![
                ("EDITOR".to_string(), "vim".to_string()),
                ("ENVIRONMENT_ID".to_string(), TEST_UID.to_string()),
                ("TEAM".to_string(), "eng".to_string()),
                ("PROJECT".to_string(), "demo".to_string()),
            ]
        );
    }

    #[test]
    fn test_missing_uid_rejected() {
        let mut env = create_test_environment("scratch", create_test_spec());
        env.metadata.uid = None;
        assert!(translate(&env, &ControllerConfig::default()).is_err());
    }

    #[test]
    fn test_fingerprint_ignores_mutable_fields() {
        let spec = create_test_spec();
        let mut scaled = spec.clone();
        scaled.ttl_hours = 48;
        scaled.limits.memory = "8Gi".to_string();
        assert_eq!(fingerprint(&spec), fingerprint(&scaled));

        let mut rebased = spec.clone();
        rebased.base_image = "python:3.11".to_string();
        assert_ne!(fingerprint(&spec), fingerprint(&rebased));
    }

    #[test]
    fn test_fingerprint_tracks_every_immutable_field() {
        let spec = create_test_spec();
        let base = fingerprint(&spec);
        assert_eq!(base.len(), 64);

        let mut with_var = spec.clone();
        with_var.environment_variables.insert("MODE".to_string(), "dev".to_string());
        let mut with_jupyter = spec.clone();
        with_jupyter.enable_jupyter = true;
        let mut one_group = spec.clone();
        one_group.packages = vec![PackageSpec {
            manager: PackageManager::Pip,
            packages: vec!["numpy".to_string(), "pandas".to_string()],
        }];
        let mut two_groups = spec.clone();
        two_groups.packages = vec![
            PackageSpec {
                manager: PackageManager::Pip,
                packages: vec!["numpy".to_string()],
            },
            PackageSpec {
                manager: PackageManager::Pip,
                packages: vec!["pandas".to_string()],
            },
        ];
        let mut split_team = spec.clone();
        split_team.team = "en".to_string();
        split_team.project = "gdemo".to_string();

        let hashes = [
            fingerprint(&with_var),
            fingerprint(&with_jupyter),
            fingerprint(&one_group),
            fingerprint(&two_groups),
            fingerprint(&split_team),
        ];
        for (i, hash) in hashes.iter().enumerate() {
            assert_ne!(hash, &base, "variant {i}");
            for other in &hashes[i + 1..] {
                assert_ne!(hash, other);
            }
        }
    }

    #[test]
    fn test_teardown_order() {
        let names = ObjectNames::for_environment(TEST_UID, "dev.company.com");
        let kinds: Vec<ObjectKind> = names.teardown_order().iter().map(|k| k.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ObjectKind::Ingress,
                ObjectKind::Service,
                ObjectKind::Deployment,
                ObjectKind::NetworkPolicy,
                ObjectKind::PersistentVolumeClaim,
                ObjectKind::Namespace,
            ]
        );
    }
}
