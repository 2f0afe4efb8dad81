//! Integration tests for the Kubernetes resource store
//!
//! These tests require a reachable cluster with the DevelopmentEnvironment
//! CRD installed. They use the current kubeconfig context.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use resource_store::{KubeResourceStore, NativeObject, ObjectKey, ObjectKind, ResourceStore};

async fn store() -> KubeResourceStore {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let client = kube::Client::try_default()
        .await
        .expect("Failed to create Kubernetes client");
    KubeResourceStore::new(client)
}

fn scratch_namespace(name: &str) -> NativeObject {
    NativeObject::Namespace(Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                crds::labels::MANAGED_BY_LABEL.to_string(),
                "dev-platform-integration-test".to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    })
}

#[tokio::test]
#[ignore] // Requires a running cluster
async fn test_list_environments() {
    let store = store().await;

    let environments = store
        .list_environments()
        .await
        .expect("Failed to list environments");

    println!("Found {} environments", environments.len());
}

#[tokio::test]
#[ignore]
async fn test_apply_is_idempotent() {
    let store = store().await;
    let namespace = scratch_namespace("dev-platform-store-it");

    let first = store.apply(&namespace).await.expect("Failed to apply namespace");
    let second = store.apply(&namespace).await.expect("Failed to re-apply namespace");
    assert_eq!(first.resource_version(), second.resource_version());

    store.delete(&first.key()).await.expect("Failed to delete namespace");
}

#[tokio::test]
#[ignore]
async fn test_delete_absent_object() {
    let store = store().await;
    let key = ObjectKey::cluster(ObjectKind::Namespace, "dev-platform-does-not-exist");

    store.delete(&key).await.expect("Deleting an absent object should succeed");
    assert!(store.get(&key).await.expect("Failed to get").is_none());
}
