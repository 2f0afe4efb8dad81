//! Test utilities for unit testing the translator and reconciler
//!
//! This module provides helpers for creating test data and setting up test scenarios.

#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use crate::config::ControllerConfig;
#[cfg(test)]
use crate::metrics::Metrics;
#[cfg(test)]
use crate::reconciler::Reconciler;
#[cfg(test)]
use crds::*;
#[cfg(test)]
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
#[cfg(test)]
use resource_store::MockResourceStore;

/// Fixed uid so derived names are predictable (`dev-env-3f2a9c1e`)
#[cfg(test)]
pub const TEST_UID: &str = "3f2a9c1e-7b4d-4e8a-9c2f-0a1b2c3d4e5f";

/// The SSH-only spec used by the end-to-end scenario
#[cfg(test)]
pub fn create_test_spec() -> DevelopmentEnvironmentSpec {
    DevelopmentEnvironmentSpec {
        name: "scratch".to_string(),
        base_image: "ubuntu:22.04".to_string(),
        custom_image: None,
        packages: Vec::new(),
        resources: ResourceRequests {
            cpu: "1".to_string(),
            memory: "2Gi".to_string(),
            gpu: None,
            storage: None,
        },
        limits: ResourceLimits {
            cpu: "2".to_string(),
            memory: "4Gi".to_string(),
            gpu: None,
        },
        enable_ssh: true,
        enable_jupyter: false,
        enable_vscode: false,
        team: "eng".to_string(),
        project: "demo".to_string(),
        ttl_hours: 24,
        environment_variables: Default::default(),
    }
}

/// Helper to create a test DevelopmentEnvironment with a uid
#[cfg(test)]
pub fn create_test_environment(name: &str, spec: DevelopmentEnvironmentSpec) -> DevelopmentEnvironment {
    create_test_environment_with_uid(name, TEST_UID, spec)
}

#[cfg(test)]
pub fn create_test_environment_with_uid(name: &str, uid: &str, spec: DevelopmentEnvironmentSpec) -> DevelopmentEnvironment {
    DevelopmentEnvironment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

/// Config with quick retries so tests do not wait on real backoff
#[cfg(test)]
pub fn create_test_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_secs = 1;
    config.retry.max_attempts = 3;
    config
}

/// Reconciler wired to a mock store and a private metrics registry
#[cfg(test)]
pub fn create_test_reconciler(store: &MockResourceStore, config: ControllerConfig) -> Arc<Reconciler> {
    let metrics = Arc::new(Metrics::new().unwrap());
    Arc::new(Reconciler::new(Arc::new(store.clone()), config, metrics))
}
