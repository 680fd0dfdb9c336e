use std::sync::Arc;
use std::time::Duration;

use keel_cache::{spawn_resync, spawn_sync, Cache};
use keel_core::{Action, Deployment, Error, Kind, Meta};
use keel_storage::{Backend, MemoryBackend, PutMode, Storage};
use tokio_util::sync::CancellationToken;

fn deployment(ns: &str, name: &str, replicas: u32) -> Deployment {
    let mut d = Deployment { meta: Meta::new(Some(ns), name), ..Default::default() };
    d.spec.replicas = replicas;
    d
}

async fn wait_for_epoch(cache: &Cache<Deployment>, min: u64) {
    let mut rx = cache.subscribe_epoch();
    tokio::time::timeout(Duration::from_secs(2), async {
        while *rx.borrow_and_update() < min {
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .expect("epoch not reached");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lists_then_follows_the_store() {
    let stg = Storage::in_memory();
    let cancel = CancellationToken::new();
    stg.create(&cancel, Kind::Deployment, "a:web", &deployment("a", "web", 1), None).await.unwrap();

    let cache = Arc::new(Cache::<Deployment>::new());
    let mut events = cache.subscribe();
    let task = spawn_sync(cache.clone(), stg.clone(), cancel.clone());

    let first = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
    assert_eq!(first.action, Action::Create);
    assert_eq!(first.self_link, "a:web");

    stg.update(&cancel, Kind::Deployment, "a:web", &deployment("a", "web", 3), None).await.unwrap();
    stg.create(&cancel, Kind::Deployment, "b:web", &deployment("b", "web", 1), None).await.unwrap();
    stg.remove(&cancel, Kind::Deployment, "a:web").await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let ev = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        seen.push((ev.action, ev.self_link));
    }
    assert_eq!(
        seen,
        vec![
            (Action::Update, "a:web".to_string()),
            (Action::Create, "b:web".to_string()),
            (Action::Delete, "a:web".to_string()),
        ]
    );
    wait_for_epoch(&cache, 4).await;
    let snap = cache.current();
    assert_eq!(snap.len(), 1);
    assert!(snap.contains("b:web"));

    cancel.cancel();
    let res = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert_eq!(res, Ok(()));
}

#[tokio::test]
async fn terminated_watch_reaches_subscribers() {
    let backend = Arc::new(MemoryBackend::with_watch_buffer(1));
    let stg = Storage::new(backend.clone());
    let cache = Cache::<Deployment>::new();
    let mut events = cache.subscribe();

    // Fill the buffer before the pump gets a chance to read.
    let stream_ready = cache.sync(&stg, CancellationToken::new());
    let writer = async {
        tokio::task::yield_now().await;
        for i in 0..16 {
            let d = deployment("a", &format!("d{i}"), 1);
            backend
                .put(&format!("deployment/a/d{i}"), serde_json::to_vec(&d).unwrap(), PutMode::Create, None)
                .await
                .unwrap();
        }
    };
    let (res, ()) = tokio::time::timeout(Duration::from_secs(2), async { tokio::join!(stream_ready, writer) })
        .await
        .unwrap();
    assert!(matches!(res, Err(Error::StreamTerminated(_))));

    let mut last = None;
    while let Ok(ev) = events.try_recv() {
        last = Some(ev);
    }
    let last = last.unwrap();
    assert_eq!(last.action, Action::Error);
    assert!(last.error.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undecodable_rows_do_not_block_the_initial_list() {
    let backend = Arc::new(MemoryBackend::new());
    let stg = Storage::new(backend.clone());
    let cancel = CancellationToken::new();
    for name in ["a", "b", "c"] {
        stg.create(&cancel, Kind::Deployment, &format!("ns0:{name}"), &deployment("ns0", name, 1), None).await.unwrap();
    }
    backend.put("deployment/ns0/zz", b"not json".to_vec(), PutMode::Create, None).await.unwrap();

    let cache = Arc::new(Cache::<Deployment>::new());
    let mut epochs = cache.subscribe_epoch();
    let task = spawn_sync(cache.clone(), stg.clone(), cancel.clone());
    tokio::time::timeout(Duration::from_secs(2), epochs.changed()).await.unwrap().unwrap();
    assert_eq!(cache.current().len(), 3);

    stg.create(&cancel, Kind::Deployment, "ns0:d", &deployment("ns0", "d", 1), None).await.unwrap();
    wait_for_epoch(&cache, 2).await;
    assert!(cache.current().contains("ns0:d"));

    cancel.cancel();
    assert_eq!(task.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn resync_relists_after_a_terminated_stream() {
    let backend = Arc::new(MemoryBackend::with_watch_buffer(1));
    let stg = Storage::new(backend.clone());
    let cancel = CancellationToken::new();
    let cache = Arc::new(Cache::<Deployment>::new());
    let mut events = cache.subscribe();
    let mut epochs = cache.subscribe_epoch();
    let task = spawn_resync(cache.clone(), stg.clone(), cancel.clone(), Duration::from_millis(20));
    // initial prime: the watch is open and the pump is parked
    tokio::time::timeout(Duration::from_secs(2), epochs.changed()).await.unwrap().unwrap();

    for i in 0..16 {
        let d = deployment("a", &format!("d{i}"), 1);
        backend
            .put(&format!("deployment/a/d{i}"), serde_json::to_vec(&d).unwrap(), PutMode::Create, None)
            .await
            .unwrap();
    }

    let relisted = tokio::time::timeout(Duration::from_secs(2), async {
        while cache.current().len() < 16 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(relisted.is_ok(), "cache did not recover");

    let mut saw_error = false;
    while let Ok(ev) = events.try_recv() {
        saw_error |= ev.action == Action::Error;
    }
    assert!(saw_error);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
}
