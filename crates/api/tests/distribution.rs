use std::sync::Arc;
use std::time::Duration;

use keel_api::{ApiError, Distribution, NodeCreateOptions};
use keel_cache::Cache;
use keel_controller::{Controller, DeploymentReconciler};
use keel_converge::{DeploymentManifest, Manifest, NamespaceManifest, PodManifest};
use keel_core::{Deployment, Kind, Pod};
use keel_storage::Storage;
use tokio_util::sync::CancellationToken;

const DEPLOYMENT: &str = r#"
meta:
  name: web
  description: front door
spec:
  replicas: 2
  template:
    containers:
      - name: app
        image:
          name: nginx:1.25
        resources:
          request:
            ram: 256Mi
            cpu: 500m
"#;

async fn with_namespace(api: &Distribution, name: &str) {
    let m = NamespaceManifest::decode(format!("meta:\n  name: {name}\n").as_bytes()).unwrap();
    api.namespace_create(&m).await.unwrap();
}

#[tokio::test]
async fn deployment_apply_creates_then_is_idempotent() {
    let api = Distribution::new(Storage::in_memory());
    with_namespace(&api, "prod").await;
    let m = DeploymentManifest::decode(DEPLOYMENT.as_bytes()).unwrap();

    let first = api.deployment_apply("prod", &m).await.unwrap();
    assert!(first.created);
    assert_eq!(first.value.meta.self_link, "prod:web");
    assert_eq!(first.value.spec.template.containers[0].resources.request.ram, 256 << 20);

    let again = api.deployment_apply("prod", &m).await.unwrap();
    assert!(!again.created);
    assert!(!again.changed);
    assert_eq!(again.value.spec.template.updated, first.value.spec.template.updated);

    let mut bigger = m.clone();
    bigger.spec.replicas = Some(5);
    let third = api.deployment_apply("prod", &bigger).await.unwrap();
    assert!(third.changed);
    let stored = api.deployment_get("prod", "web").await.unwrap().unwrap();
    assert_eq!(stored.spec.replicas, 5);
}

#[tokio::test]
async fn apply_requires_an_existing_namespace_and_a_name() {
    let api = Distribution::new(Storage::in_memory());
    let m = DeploymentManifest::decode(DEPLOYMENT.as_bytes()).unwrap();
    assert!(matches!(api.deployment_apply("nope", &m).await, Err(ApiError::NotFound(_))));

    with_namespace(&api, "prod").await;
    let nameless = PodManifest::default();
    assert!(matches!(api.pod_apply("prod", &nameless).await, Err(ApiError::Validation(_))));

    let dup = NamespaceManifest::decode(b"meta:\n  name: prod\n").unwrap();
    assert!(matches!(api.namespace_create(&dup).await, Err(ApiError::Conflict(_))));
}

#[tokio::test]
async fn nodes_register_with_a_token_and_toggle_online() {
    let api = Distribution::new(Storage::in_memory());
    assert_eq!(api.node_get("n1").await.unwrap(), None);

    let node = api.node_create(NodeCreateOptions { name: "n1".into(), ..Default::default() }).await.unwrap();
    assert_eq!(node.token.len(), 32);
    assert!(node.online);

    let off = api.node_set_offline("n1").await.unwrap();
    assert!(!off.online);
    assert!(!api.node_get("n1").await.unwrap().unwrap().online);
    assert_eq!(api.node_list().await.unwrap().keys().cloned().collect::<Vec<_>>(), vec!["n1"]);

    assert!(matches!(api.node_set_online("ghost").await, Err(ApiError::NotFound(_))));
}

#[tokio::test]
async fn non_empty_namespace_cannot_be_removed() {
    let api = Distribution::new(Storage::in_memory());
    with_namespace(&api, "prod").await;
    let pod = PodManifest::decode(b"meta:\n  name: solo\n").unwrap();
    api.pod_apply("prod", &pod).await.unwrap();
    assert!(matches!(api.namespace_remove("prod").await, Err(ApiError::Conflict(_))));
    api.pod_remove("prod", "solo").await.unwrap();
    api.namespace_remove("prod").await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn applied_deployments_reach_the_controller() {
    let stg = Storage::in_memory();
    let cache = Arc::new(Cache::<Deployment>::new());
    let ctrl = Arc::new(Controller::new(stg.clone(), cache, Arc::new(DeploymentReconciler::new(stg.clone()))));
    let cancel = CancellationToken::new();
    ctrl.resume(&cancel).await;
    let task = tokio::spawn({
        let ctrl = ctrl.clone();
        let cancel = cancel.clone();
        async move { ctrl.observe(cancel).await }
    });

    let api = Distribution::new(stg.clone()).with_deployment_controller(ctrl.clone());
    with_namespace(&api, "prod").await;
    api.deployment_apply("prod", &DeploymentManifest::decode(DEPLOYMENT.as_bytes()).unwrap()).await.unwrap();

    let pods = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let pods: Vec<Pod> = stg.list(&cancel, Kind::Pod, "prod").await.unwrap();
            if pods.len() == 2 {
                return pods;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pods were not created");
    assert!(pods.iter().all(|p| p.meta.owner.as_deref() == Some("web")));

    cancel.cancel();
    assert_eq!(task.await.unwrap(), Ok(()));
}
