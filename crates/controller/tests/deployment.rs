use std::sync::Arc;

use chrono::{Duration, Utc};
use keel_controller::{DeploymentReconciler, Reconciler};
use keel_core::{Deployment, DeploymentState, Kind, Meta, Object, Pod, PodState, SpecTemplateContainer};
use keel_storage::Storage;
use tokio_util::sync::CancellationToken;

async fn store_deployment(stg: &Storage, d: &Deployment) {
    stg.upsert(&CancellationToken::new(), Kind::Deployment, &d.self_link(), d, None).await.unwrap();
}

async fn pods(stg: &Storage) -> Vec<Pod> {
    stg.list(&CancellationToken::new(), Kind::Pod, "prod").await.unwrap()
}

async fn stored(stg: &Storage) -> Deployment {
    stg.get(&CancellationToken::new(), Kind::Deployment, "prod:web").await.unwrap()
}

fn web(replicas: u32) -> Deployment {
    let mut d = Deployment { meta: Meta::new(Some("prod"), "web"), ..Default::default() };
    d.spec.replicas = replicas;
    d.spec.template.containers = vec![SpecTemplateContainer { name: "app".into(), ..Default::default() }];
    d.spec.template.updated = Utc::now();
    d
}

#[tokio::test]
async fn scales_pods_and_reports_status() {
    let stg = Storage::in_memory();
    let rec = DeploymentReconciler::new(stg.clone());
    let cancel = CancellationToken::new();

    let d = web(3);
    store_deployment(&stg, &d).await;
    rec.reconcile_spec(&cancel, Arc::new(d.clone())).await.unwrap();

    let owned = pods(&stg).await;
    assert_eq!(owned.len(), 3);
    assert!(owned.iter().all(|p| p.meta.owner.as_deref() == Some("web")));
    assert!(owned.iter().all(|p| p.spec.template == d.spec.template));
    let status = stored(&stg).await.status;
    assert_eq!((status.desired, status.provisioned, status.state), (3, 3, DeploymentState::Ready));
    assert_eq!(status.observed, Some(d.spec.template.updated));

    let mut smaller = stored(&stg).await;
    smaller.spec.replicas = 1;
    store_deployment(&stg, &smaller).await;
    rec.reconcile_spec(&cancel, Arc::new(smaller)).await.unwrap();
    assert_eq!(pods(&stg).await.len(), 1);
    assert_eq!(stored(&stg).await.status.provisioned, 1);
}

#[tokio::test]
async fn stale_pods_are_refreshed_from_the_template() {
    let stg = Storage::in_memory();
    let rec = DeploymentReconciler::new(stg.clone());
    let cancel = CancellationToken::new();

    let d = web(2);
    store_deployment(&stg, &d).await;
    rec.reconcile_spec(&cancel, Arc::new(d.clone())).await.unwrap();

    let mut next = stored(&stg).await;
    next.spec.template.containers[0].image.name = "nginx:1.27".into();
    next.spec.template.updated = d.spec.template.updated + Duration::seconds(10);
    store_deployment(&stg, &next).await;
    rec.reconcile_spec(&cancel, Arc::new(next.clone())).await.unwrap();

    let owned = pods(&stg).await;
    assert_eq!(owned.len(), 2);
    for p in owned {
        assert_eq!(p.spec.template.containers[0].image.name, "nginx:1.27");
        assert_eq!(p.status.state, PodState::Provision);
    }
    assert_eq!(stored(&stg).await.status.observed, Some(next.spec.template.updated));
}

#[tokio::test]
async fn removal_deletes_only_owned_pods() {
    let stg = Storage::in_memory();
    let rec = DeploymentReconciler::new(stg.clone());
    let cancel = CancellationToken::new();

    let stray = Pod { meta: Meta::new(Some("prod"), "stray"), ..Default::default() };
    stg.create(&cancel, Kind::Pod, &stray.self_link(), &stray, None).await.unwrap();

    let d = web(2);
    store_deployment(&stg, &d).await;
    rec.reconcile_spec(&cancel, Arc::new(d.clone())).await.unwrap();
    assert_eq!(pods(&stg).await.len(), 3);

    stg.remove(&cancel, Kind::Deployment, "prod:web").await.unwrap();
    rec.remove(&cancel, Arc::new(d)).await.unwrap();
    let left = pods(&stg).await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].meta.name, "stray");
}

#[tokio::test]
async fn status_write_is_skipped_for_a_vanished_deployment() {
    let stg = Storage::in_memory();
    let rec = DeploymentReconciler::new(stg.clone());
    // never stored: pods are created, the status write finds nothing and is dropped
    rec.reconcile_spec(&CancellationToken::new(), Arc::new(web(1))).await.unwrap();
    assert_eq!(pods(&stg).await.len(), 1);
}
