//! Keel storage: keyed store client over a replicated key-value backend.
//!
//! Values are full serialized resource documents; there are no partial-field
//! writes. Every call takes a cancellation token and either completes or
//! surfaces `Error::Cancelled` without writing.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_core::{query_prefix, store_key, Error, Kind, Result, WatchEvent};
use metrics::{counter, histogram};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub mod backend;
pub mod memory;
pub mod watch;

pub use backend::{Backend, BackendWatch, Notification, Notifier, PutMode};
pub use memory::MemoryBackend;
pub use watch::{translate, KeyPattern, WatchStream};

/// Write options.
#[derive(Debug, Clone, Copy, Default)]
pub struct Opts {
    /// Lease-style expiry of the written key.
    pub ttl: Option<Duration>,
}

impl Opts {
    pub fn ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

/// Keyed store client. Cheap to clone; pass it to every component that needs it.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn Backend>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

async fn cancellable<T, F>(cancel: &CancellationToken, op: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let t0 = Instant::now();
    let res = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        r = fut => r,
    };
    histogram!("storage_op_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
    res
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(key: &str, data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| Error::Backend(format!("decoding {}: {}", key, e)))
}

impl Storage {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Storage over a fresh in-process backend.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Fetch one resource by self-link.
    pub async fn get<T: DeserializeOwned>(&self, cancel: &CancellationToken, kind: Kind, name: &str) -> Result<T> {
        let key = store_key(kind, name);
        trace!(key = %key, "get");
        let data = cancellable(cancel, "get", self.backend.get(&key))
            .await?
            .ok_or_else(|| Error::NotFound(key.clone()))?;
        decode(&key, &data)
    }

    /// All resources of `kind` under `query` (a namespace, or empty for all), ordered by key.
    pub async fn list<T: DeserializeOwned>(&self, cancel: &CancellationToken, kind: Kind, query: &str) -> Result<Vec<T>> {
        let prefix = query_prefix(kind, query);
        let rows = cancellable(cancel, "list", self.backend.range(&prefix)).await?;
        debug!(prefix = %prefix, count = rows.len(), "list");
        rows.iter().map(|(k, v)| decode(k, v)).collect()
    }

    /// Like `list`, but rows that fail to decode are skipped and their keys returned
    /// alongside the decoded items.
    pub async fn list_lenient<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        kind: Kind,
        query: &str,
    ) -> Result<(Vec<T>, Vec<String>)> {
        let prefix = query_prefix(kind, query);
        let rows = cancellable(cancel, "list", self.backend.range(&prefix)).await?;
        let mut items = Vec::with_capacity(rows.len());
        let mut bad = Vec::new();
        for (key, value) in rows {
            match decode(&key, &value) {
                Ok(v) => items.push(v),
                Err(e) => {
                    counter!("storage_decode_failed_total", 1u64, "kind" => kind.as_str());
                    warn!(key = %key, error = %e, "list: skipping undecodable value");
                    bad.push(key);
                }
            }
        }
        debug!(prefix = %prefix, count = items.len(), skipped = bad.len(), "list lenient");
        Ok((items, bad))
    }

    /// Like `list`, keyed by self-link.
    pub async fn map<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        kind: Kind,
        query: &str,
    ) -> Result<BTreeMap<String, T>> {
        let prefix = query_prefix(kind, query);
        let pattern = KeyPattern::new(kind)?;
        let rows = cancellable(cancel, "map", self.backend.range(&prefix)).await?;
        let mut out = BTreeMap::new();
        for (key, value) in rows {
            // Keys that do not parse cannot be addressed by self-link; skip them like watch does.
            let Some((_, link)) = pattern.parse(&key) else { continue };
            out.insert(link, decode(&key, &value)?);
        }
        debug!(prefix = %prefix, count = out.len(), "map");
        Ok(out)
    }

    pub async fn create<T: Serialize + Sync>(
        &self,
        cancel: &CancellationToken,
        kind: Kind,
        name: &str,
        value: &T,
        opts: Option<&Opts>,
    ) -> Result<()> {
        self.put(cancel, "create", kind, name, value, PutMode::Create, opts).await
    }

    pub async fn update<T: Serialize + Sync>(
        &self,
        cancel: &CancellationToken,
        kind: Kind,
        name: &str,
        value: &T,
        opts: Option<&Opts>,
    ) -> Result<()> {
        self.put(cancel, "update", kind, name, value, PutMode::Update, opts).await
    }

    pub async fn upsert<T: Serialize + Sync>(
        &self,
        cancel: &CancellationToken,
        kind: Kind,
        name: &str,
        value: &T,
        opts: Option<&Opts>,
    ) -> Result<()> {
        self.put(cancel, "upsert", kind, name, value, PutMode::Upsert, opts).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn put<T: Serialize + Sync>(
        &self,
        cancel: &CancellationToken,
        op: &'static str,
        kind: Kind,
        name: &str,
        value: &T,
        mode: PutMode,
        opts: Option<&Opts>,
    ) -> Result<()> {
        let key = store_key(kind, name);
        let data = encode(value)?;
        let ttl = opts.and_then(|o| o.ttl);
        let revision = cancellable(cancel, op, self.backend.put(&key, data, mode, ttl)).await?;
        debug!(key = %key, revision, op, "write");
        Ok(())
    }

    pub async fn remove(&self, cancel: &CancellationToken, kind: Kind, name: &str) -> Result<()> {
        let key = store_key(kind, name);
        let revision = cancellable(cancel, "remove", self.backend.delete(&key)).await?;
        debug!(key = %key, revision, "remove");
        Ok(())
    }

    /// Establish a watch on `kind` without pumping it yet. Writes committed after this
    /// returns are guaranteed to be observed by the stream.
    pub async fn open_watch(&self, kind: Kind) -> Result<WatchStream> {
        let inner = self.backend.watch(&kind.prefix()).await?;
        WatchStream::new(kind, inner)
    }

    /// Stream typed events for `kind` into `tx` until `cancel` fires.
    pub async fn watch(&self, cancel: CancellationToken, kind: Kind, tx: mpsc::Sender<WatchEvent>) -> Result<()> {
        let stream = self.open_watch(kind).await?;
        stream.run(cancel, tx).await
    }
}
