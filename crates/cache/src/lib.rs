//! Keel cache: in-RAM mirror of one resource kind, fed by store watch events.
//!
//! Writes are serialized through a single builder; readers only ever see immutable
//! snapshots swapped in atomically, so nothing a subscriber holds can change under it.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use keel_core::{Action, Error, Kind, Object, Result, WatchEvent};
use keel_storage::Storage;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Depth of the channel between the watch pump and the cache writer.
const WATCH_CHANNEL: usize = 256;

/// Immutable view of the cache at one epoch.
#[derive(Debug)]
pub struct Snapshot<T> {
    pub epoch: u64,
    items: FxHashMap<String, Arc<T>>,
}

impl<T> Default for Snapshot<T> {
    fn default() -> Self {
        Self { epoch: 0, items: FxHashMap::default() }
    }
}

impl<T> Snapshot<T> {
    pub fn get(&self, self_link: &str) -> Option<Arc<T>> {
        self.items.get(self_link).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, self_link: &str) -> bool {
        self.items.contains_key(self_link)
    }

    /// Items ordered by self-link.
    pub fn list(&self) -> Vec<Arc<T>> {
        let mut keys: Vec<&String> = self.items.keys().collect();
        keys.sort();
        keys.into_iter().filter_map(|k| self.items.get(k).cloned()).collect()
    }
}

/// Change delivered to subscribers. `prev` and `current` are shared, read-only values.
#[derive(Debug)]
pub struct CacheEvent<T> {
    pub action: Action,
    pub name: String,
    pub self_link: String,
    pub prev: Option<Arc<T>>,
    pub current: Option<Arc<T>>,
    /// Set on `Action::Error` only; the cache stopped following the store.
    pub error: Option<String>,
}

impl<T> Clone for CacheEvent<T> {
    fn clone(&self) -> Self {
        Self {
            action: self.action,
            name: self.name.clone(),
            self_link: self.self_link.clone(),
            prev: self.prev.clone(),
            current: self.current.clone(),
            error: self.error.clone(),
        }
    }
}

struct Builder<T> {
    epoch: u64,
    items: FxHashMap<String, Arc<T>>,
}

pub struct Cache<T> {
    kind: Kind,
    builder: Mutex<Builder<T>>,
    snap: ArcSwap<Snapshot<T>>,
    epoch_tx: watch::Sender<u64>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<CacheEvent<T>>>>,
}

impl<T: Object> Default for Cache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Object> Cache<T> {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self {
            kind: T::KIND,
            builder: Mutex::new(Builder { epoch: 0, items: FxHashMap::default() }),
            snap: ArcSwap::from_pointee(Snapshot::default()),
            epoch_tx,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn current(&self) -> Arc<Snapshot<T>> {
        self.snap.load_full()
    }

    pub fn get(&self, self_link: &str) -> Option<Arc<T>> {
        self.snap.load().get(self_link)
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    /// Register for change events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CacheEvent<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).push(tx);
        rx
    }

    fn broadcast(&self, events: Vec<CacheEvent<T>>) {
        if events.is_empty() {
            return;
        }
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|tx| events.iter().all(|ev| tx.send(ev.clone()).is_ok()));
    }

    fn freeze(&self, builder: &mut Builder<T>) {
        builder.epoch = builder.epoch.saturating_add(1);
        let next = Snapshot { epoch: builder.epoch, items: builder.items.clone() };
        self.snap.store(Arc::new(next));
        let _ = self.epoch_tx.send(builder.epoch);
        gauge!("cache_epoch", builder.epoch as f64, "kind" => self.kind.as_str());
    }

    /// Fold one watch event into the cache.
    ///
    /// Puts become `Create` or `Update` depending on whether the item was already
    /// cached. Undecodable payloads are logged and skipped.
    pub fn apply(&self, ev: WatchEvent) {
        let mut builder = self.builder.lock().unwrap_or_else(|e| e.into_inner());
        let out = match ev.action {
            Action::Delete => {
                let Some(prev) = builder.items.remove(&ev.self_link) else {
                    debug!(kind = %self.kind, link = %ev.self_link, "delete for uncached item");
                    return;
                };
                CacheEvent {
                    action: Action::Delete,
                    name: ev.name,
                    self_link: ev.self_link,
                    prev: Some(prev),
                    current: None,
                    error: None,
                }
            }
            Action::Create | Action::Update => {
                let Some(data) = ev.data.as_deref() else {
                    warn!(kind = %self.kind, link = %ev.self_link, "put without payload");
                    return;
                };
                let value: T = match serde_json::from_slice(data) {
                    Ok(v) => v,
                    Err(e) => {
                        counter!("cache_decode_failed_total", 1u64, "kind" => self.kind.as_str());
                        warn!(kind = %self.kind, link = %ev.self_link, error = %e, "skipping undecodable item");
                        return;
                    }
                };
                let current = Arc::new(value);
                let prev = builder.items.insert(ev.self_link.clone(), Arc::clone(&current));
                CacheEvent {
                    action: if prev.is_some() { Action::Update } else { Action::Create },
                    name: ev.name,
                    self_link: ev.self_link,
                    prev,
                    current: Some(current),
                    error: None,
                }
            }
            Action::Error => {
                let msg = ev.data.map(|d| String::from_utf8_lossy(&d).into_owned()).unwrap_or_default();
                drop(builder);
                self.fail(msg);
                return;
            }
        };
        self.freeze(&mut builder);
        counter!("cache_events_total", 1u64, "kind" => self.kind.as_str());
        // Broadcast under the builder lock so subscribers see writes in order.
        self.broadcast(vec![out]);
    }

    /// Replace the whole content with a fresh listing. Items missing from `items`
    /// are reported as deleted.
    pub fn prime(&self, items: Vec<T>) {
        let mut builder = self.builder.lock().unwrap_or_else(|e| e.into_inner());
        let mut next: FxHashMap<String, Arc<T>> = FxHashMap::default();
        let mut events = Vec::with_capacity(items.len());
        for item in items {
            let link = item.self_link();
            let current = Arc::new(item);
            let prev = builder.items.remove(&link);
            events.push(CacheEvent {
                action: if prev.is_some() { Action::Update } else { Action::Create },
                name: current.meta().name.clone(),
                self_link: link.clone(),
                prev,
                current: Some(Arc::clone(&current)),
                error: None,
            });
            next.insert(link, current);
        }
        for (link, prev) in builder.items.drain() {
            events.push(CacheEvent {
                action: Action::Delete,
                name: prev.meta().name.clone(),
                self_link: link,
                prev: Some(prev),
                current: None,
                error: None,
            });
        }
        builder.items = next;
        self.freeze(&mut builder);
        debug!(kind = %self.kind, count = builder.items.len(), "cache primed");
        self.broadcast(events);
    }

    /// Tell subscribers the cache stopped following the store.
    pub fn fail(&self, msg: String) {
        error!(kind = %self.kind, error = %msg, "cache lost its watch");
        self.broadcast(vec![CacheEvent {
            action: Action::Error,
            name: String::new(),
            self_link: String::new(),
            prev: None,
            current: None,
            error: Some(msg),
        }]);
    }

    /// List then follow the store until `cancel` fires.
    ///
    /// The watch is established before listing, so nothing written in between is
    /// missed. Undecodable rows are skipped like undecodable events. Any error is
    /// reported to subscribers and returned.
    pub async fn sync(&self, storage: &Storage, cancel: CancellationToken) -> Result<()> {
        let t0 = std::time::Instant::now();
        let stream = match storage.open_watch(self.kind).await {
            Ok(s) => s,
            Err(e) => {
                self.fail(e.to_string());
                return Err(e);
            }
        };
        let (items, bad) = match storage.list_lenient::<T>(&cancel, self.kind, "").await {
            Ok(listed) => listed,
            Err(Error::Cancelled) => return Ok(()),
            Err(e) => {
                self.fail(e.to_string());
                return Err(e);
            }
        };
        for key in &bad {
            counter!("cache_decode_failed_total", 1u64, "kind" => self.kind.as_str());
            warn!(kind = %self.kind, key = %key, "skipping undecodable item");
        }
        let count = items.len();
        self.prime(items);
        info!(kind = %self.kind, count, skipped = bad.len(), took_ms = %t0.elapsed().as_millis(), "cache: initial list");

        let (tx, mut rx) = mpsc::channel(WATCH_CHANNEL);
        let pump = stream.run(cancel, tx);
        let consume = async {
            while let Some(ev) = rx.recv().await {
                self.apply(ev);
            }
        };
        let (res, ()) = tokio::join!(pump, consume);
        if let Err(e) = &res {
            self.fail(e.to_string());
        }
        info!(kind = %self.kind, "cache sync stopped");
        res
    }
}

/// Run [`Cache::sync`] on its own task.
pub fn spawn_sync<T: Object>(cache: Arc<Cache<T>>, storage: Storage, cancel: CancellationToken) -> JoinHandle<Result<()>> {
    tokio::spawn(async move { cache.sync(&storage, cancel).await })
}

/// Keep `cache` synced until `cancel` fires, re-listing after `backoff` whenever the
/// stream terminates. Each re-list reconciles the cache through [`Cache::prime`].
pub async fn resync<T: Object>(cache: &Cache<T>, storage: &Storage, cancel: CancellationToken, backoff: Duration) {
    let mut attempt = 0u64;
    loop {
        match cache.sync(storage, cancel.clone()).await {
            Ok(()) => return,
            Err(e) => {
                attempt += 1;
                counter!("cache_resyncs_total", 1u64, "kind" => cache.kind().as_str());
                warn!(kind = %cache.kind(), attempt, error = %e, backoff_ms = %backoff.as_millis(), "cache sync ended; re-listing");
            }
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

/// Run [`resync`] on its own task.
pub fn spawn_resync<T: Object>(cache: Arc<Cache<T>>, storage: Storage, cancel: CancellationToken, backoff: Duration) -> JoinHandle<()> {
    tokio::spawn(async move { resync(&cache, &storage, cancel, backoff).await })
}
