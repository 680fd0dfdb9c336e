//! Backend contract for the replicated key-value store and the notification
//! plumbing shared by backend implementations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use keel_core::Result;
use tokio::sync::broadcast;

/// Default depth of the notification buffer a watcher may fall behind by.
pub const DEFAULT_WATCH_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Fails with `AlreadyExists` when the key is present.
    Create,
    /// Fails with `NotFound` when the key is absent.
    Update,
    Upsert,
}

/// Raw change notification as delivered by a backend watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Put { key: String, value: Vec<u8>, revision: u64 },
    Delete { key: String, revision: u64 },
    /// Terminal failure; the stream ends after it.
    Error(String),
}

impl Notification {
    pub fn key(&self) -> Option<&str> {
        match self {
            Notification::Put { key, .. } | Notification::Delete { key, .. } => Some(key),
            Notification::Error(_) => None,
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// All live entries under `prefix`, ordered by key.
    async fn range(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Write a full value. Returns the revision assigned to the write.
    async fn put(&self, key: &str, value: Vec<u8>, mode: PutMode, ttl: Option<Duration>) -> Result<u64>;

    /// Fails with `NotFound` when the key is absent.
    async fn delete(&self, key: &str) -> Result<u64>;

    /// Open a watch on every key under `prefix`. Notifications published after this
    /// call returns are delivered in revision order.
    async fn watch(&self, prefix: &str) -> Result<BackendWatch>;
}

/// Revision counter and fan-out of change notifications.
///
/// Callers must assign the revision and publish while still holding their data
/// lock so that watchers observe writes in commit order.
#[derive(Debug)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
    revision: AtomicU64,
}

impl Notifier {
    pub fn new(buffer: usize, start_revision: u64) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx, revision: AtomicU64::new(start_revision) }
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn publish(&self, n: Notification) {
        // No receivers is fine: nobody is watching.
        let _ = self.tx.send(n);
    }

    pub fn subscribe(&self, prefix: &str) -> BackendWatch {
        BackendWatch { prefix: prefix.to_string(), rx: self.tx.subscribe(), stopped: false }
    }
}

/// Server-side watch stream scoped to a key prefix.
#[derive(Debug)]
pub struct BackendWatch {
    prefix: String,
    rx: broadcast::Receiver<Notification>,
    stopped: bool,
}

impl BackendWatch {
    /// Next notification under the prefix; `None` once stopped or closed.
    pub async fn next(&mut self) -> Option<Notification> {
        if self.stopped {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(n) => {
                    let in_scope = n.key().map(|k| k.starts_with(&self.prefix)).unwrap_or(true);
                    if in_scope {
                        return Some(n);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.stopped = true;
                    return Some(Notification::Error(format!(
                        "watch on {} fell behind by {} notifications",
                        self.prefix, missed
                    )));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }
}
