//! In-process backend. Used by tests and single-node deployments.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{Error, Result};
use tracing::debug;

use crate::backend::{Backend, BackendWatch, Notification, Notifier, PutMode, DEFAULT_WATCH_BUFFER};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    revision: u64,
}

#[derive(Debug)]
struct Inner {
    data: RwLock<BTreeMap<String, Entry>>,
    notifier: Notifier,
}

impl Inner {
    fn expire(&self, key: &str, revision: u64) {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        // A rewrite after the lease was granted keeps the key alive.
        if data.get(key).map(|e| e.revision) != Some(revision) {
            return;
        }
        data.remove(key);
        let rev = self.notifier.next_revision();
        self.notifier.publish(Notification::Delete { key: key.to_string(), revision: rev });
        debug!(key, "ttl expired");
    }
}

#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::with_watch_buffer(DEFAULT_WATCH_BUFFER)
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_watch_buffer(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner { data: RwLock::new(BTreeMap::new()), notifier: Notifier::new(buffer, 0) }),
        }
    }

    pub fn revision(&self) -> u64 {
        self.inner.notifier.revision()
    }

    fn schedule_expiry(&self, key: &str, revision: u64, ttl: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(&key, revision);
            }
        });
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let data = self.inner.data.read().unwrap_or_else(|e| e.into_inner());
        Ok(data.get(key).map(|e| e.value.clone()))
    }

    async fn range(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let data = self.inner.data.read().unwrap_or_else(|e| e.into_inner());
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>, mode: PutMode, ttl: Option<Duration>) -> Result<u64> {
        let revision = {
            let mut data = self.inner.data.write().unwrap_or_else(|e| e.into_inner());
            let exists = data.contains_key(key);
            match mode {
                PutMode::Create if exists => return Err(Error::AlreadyExists(key.to_string())),
                PutMode::Update if !exists => return Err(Error::NotFound(key.to_string())),
                _ => {}
            }
            let revision = self.inner.notifier.next_revision();
            data.insert(key.to_string(), Entry { value: value.clone(), revision });
            self.inner.notifier.publish(Notification::Put { key: key.to_string(), value, revision });
            revision
        };
        if let Some(ttl) = ttl {
            self.schedule_expiry(key, revision, ttl);
        }
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut data = self.inner.data.write().unwrap_or_else(|e| e.into_inner());
        if data.remove(key).is_none() {
            return Err(Error::NotFound(key.to_string()));
        }
        let revision = self.inner.notifier.next_revision();
        self.inner.notifier.publish(Notification::Delete { key: key.to_string(), revision });
        Ok(revision)
    }

    async fn watch(&self, prefix: &str) -> Result<BackendWatch> {
        Ok(self.inner.notifier.subscribe(prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_update_delete_semantics() {
        let b = MemoryBackend::new();
        b.put("node/a", b"1".to_vec(), PutMode::Create, None).await.unwrap();
        assert_eq!(
            b.put("node/a", b"2".to_vec(), PutMode::Create, None).await,
            Err(Error::AlreadyExists("node/a".into()))
        );
        assert_eq!(
            b.put("node/b", b"2".to_vec(), PutMode::Update, None).await,
            Err(Error::NotFound("node/b".into()))
        );
        b.put("node/b", b"2".to_vec(), PutMode::Upsert, None).await.unwrap();
        b.put("node/b", b"3".to_vec(), PutMode::Update, None).await.unwrap();
        assert_eq!(b.get("node/b").await.unwrap(), Some(b"3".to_vec()));
        b.delete("node/b").await.unwrap();
        assert!(b.delete("node/b").await.unwrap_err().is_not_found());
        assert_eq!(b.revision(), 4);
    }

    #[tokio::test]
    async fn range_is_prefix_scoped_and_ordered() {
        let b = MemoryBackend::new();
        for k in ["pod/ns/b", "pod/ns/a", "pod/other/c", "podx/ns/d", "node/n"] {
            b.put(k, k.as_bytes().to_vec(), PutMode::Upsert, None).await.unwrap();
        }
        let keys: Vec<_> = b.range("pod/ns/").await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["pod/ns/a", "pod/ns/b"]);
        let all: Vec<_> = b.range("pod/").await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(all, vec!["pod/ns/a", "pod/ns/b", "pod/other/c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_unless_rewritten() {
        let b = MemoryBackend::new();
        let mut w = b.watch("node/").await.unwrap();
        b.put("node/a", b"1".to_vec(), PutMode::Create, Some(Duration::from_secs(5))).await.unwrap();
        b.put("node/b", b"1".to_vec(), PutMode::Create, Some(Duration::from_secs(5))).await.unwrap();
        // rewrite without ttl keeps b alive
        b.put("node/b", b"2".to_vec(), PutMode::Update, None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(b.get("node/a").await.unwrap(), None);
        assert_eq!(b.get("node/b").await.unwrap(), Some(b"2".to_vec()));

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(w.next().await.unwrap());
        }
        assert!(matches!(&seen[3], Notification::Delete { key, .. } if key == "node/a"));
    }
}
