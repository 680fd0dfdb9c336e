//! Keel persistence: durable SQLite backend for the keyed store.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{Error, Result};
use keel_storage::{Backend, BackendWatch, Notification, Notifier, PutMode};
use keel_storage::backend::DEFAULT_WATCH_BUFFER;
use metrics::{counter, histogram};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

fn db_err(e: rusqlite::Error) -> Error {
    Error::Backend(format!("sqlite: {}", e))
}

struct Inner {
    db: Mutex<Connection>,
    notifier: Notifier,
}

impl Inner {
    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expire(&self, key: &str, revision: u64) -> Result<()> {
        let db = self.conn();
        let removed = db
            .execute("DELETE FROM kv WHERE key = ?1 AND revision = ?2", (key, revision as i64))
            .map_err(db_err)?;
        if removed == 0 {
            return Ok(());
        }
        let rev = self.notifier.next_revision();
        bump_revision(&db, rev)?;
        self.notifier.publish(Notification::Delete { key: key.to_string(), revision: rev });
        counter!("persist_expired_total", 1u64);
        debug!(key, "ttl expired");
        Ok(())
    }
}

/// SQLite-backed store. Simple, synchronous under a mutex; watches are in-process.
pub struct SqliteBackend {
    inner: Arc<Inner>,
    /// Leases found on open, `(key, revision, expires_at)`, armed once a runtime is available.
    leases: Mutex<Vec<(String, u64, i64)>>,
}

impl SqliteBackend {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KEEL_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = Connection::open(path).map_err(|e| Error::Backend(format!("opening sqlite db at {}: {}", path, e)))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        let me = Self::init(db)?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(path, revision = me.revision(), "sqlite backend open");
        Ok(me)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(db: Connection) -> Result<Self> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key        TEXT PRIMARY KEY,
                value      BLOB NOT NULL,
                revision   INTEGER NOT NULL,
                expires_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv(expires_at);
            CREATE TABLE IF NOT EXISTS meta (
                k TEXT PRIMARY KEY,
                v INTEGER NOT NULL
            );",
        )
        .map_err(db_err)?;
        let purged = db
            .execute("DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1", [now_ms()])
            .map_err(db_err)?;
        if purged > 0 {
            debug!(purged, "purged expired keys");
        }
        let revision: i64 = db
            .query_row("SELECT v FROM meta WHERE k = 'revision'", [], |row| row.get(0))
            .optional()
            .map_err(db_err)?
            .unwrap_or(0);
        let leases = {
            let mut stmt = db
                .prepare("SELECT key, revision, expires_at FROM kv WHERE expires_at IS NOT NULL")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)))
                .map_err(db_err)?;
            let leases = rows
                .map(|r| r.map(|(k, rev, at)| (k, rev.max(0) as u64, at)))
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            leases
        };
        let inner = Inner { db: Mutex::new(db), notifier: Notifier::new(DEFAULT_WATCH_BUFFER, revision.max(0) as u64) };
        let me = Self { inner: Arc::new(inner), leases: Mutex::new(leases) };
        if tokio::runtime::Handle::try_current().is_ok() {
            me.arm_leases();
        }
        Ok(me)
    }

    /// Schedule expiry for leases still alive at open. Outside a runtime this is
    /// deferred to the first async call.
    fn arm_leases(&self) {
        let leases = std::mem::take(&mut *self.leases.lock().unwrap_or_else(|e| e.into_inner()));
        if leases.is_empty() {
            return;
        }
        let now = now_ms();
        debug!(count = leases.len(), "arming leases");
        for (key, revision, expires_at) in leases {
            let left = Duration::from_millis(expires_at.saturating_sub(now).max(0) as u64);
            self.schedule_expiry(&key, revision, left);
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
                if let Err(e) = inner.expire(&key, revision) {
                    tracing::warn!(key = %key, error = %e, "ttl expiry failed");
                }
            }
        });
    }
}

fn bump_revision(db: &Connection, revision: u64) -> Result<()> {
    db.execute(
        "INSERT INTO meta(k, v) VALUES ('revision', ?1) ON CONFLICT(k) DO UPDATE SET v = excluded.v",
        [revision as i64],
    )
    .map_err(db_err)?;
    Ok(())
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.arm_leases();
        let db = self.inner.conn();
        db.query_row(
            "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            (key, now_ms()),
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    async fn range(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.arm_leases();
        let started = std::time::Instant::now();
        let db = self.inner.conn();
        let mut stmt = db
            .prepare(
                "SELECT key, value FROM kv
                 WHERE substr(key, 1, length(?1)) = ?1
                   AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY key",
            )
            .map_err(db_err)?;
        let mut rows = stmt.query((prefix, now_ms())).map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            out.push((row.get(0).map_err(db_err)?, row.get(1).map_err(db_err)?));
        }
        histogram!("persist_range_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    async fn put(&self, key: &str, value: Vec<u8>, mode: PutMode, ttl: Option<Duration>) -> Result<u64> {
        self.arm_leases();
        let started = std::time::Instant::now();
        let revision = {
            let mut db = self.inner.conn();
            let now = now_ms();
            let tx = db.transaction().map_err(db_err)?;
            let exists = tx
                .query_row(
                    "SELECT 1 FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                    (key, now),
                    |_| Ok(()),
                )
                .optional()
                .map_err(db_err)?
                .is_some();
            match mode {
                PutMode::Create if exists => return Err(Error::AlreadyExists(key.to_string())),
                PutMode::Update if !exists => return Err(Error::NotFound(key.to_string())),
                _ => {}
            }
            let revision = self.inner.notifier.next_revision();
            let expires_at = ttl.map(|t| now.saturating_add(t.as_millis() as i64));
            tx.execute(
                "INSERT INTO kv(key, value, revision, expires_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, revision = excluded.revision, expires_at = excluded.expires_at",
                (key, &value, revision as i64, expires_at),
            )
            .map_err(db_err)?;
            bump_revision(&tx, revision)?;
            tx.commit().map_err(db_err)?;
            self.inner.notifier.publish(Notification::Put { key: key.to_string(), value, revision });
            revision
        };
        if let Some(ttl) = ttl {
            self.schedule_expiry(key, revision, ttl);
        }
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        self.arm_leases();
        let mut db = self.inner.conn();
        let tx = db.transaction().map_err(db_err)?;
        let removed = tx
            .execute(
                "DELETE FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                (key, now_ms()),
            )
            .map_err(db_err)?;
        if removed == 0 {
            return Err(Error::NotFound(key.to_string()));
        }
        let revision = self.inner.notifier.next_revision();
        bump_revision(&tx, revision)?;
        tx.commit().map_err(db_err)?;
        self.inner.notifier.publish(Notification::Delete { key: key.to_string(), revision });
        Ok(revision)
    }

    async fn watch(&self, prefix: &str) -> Result<BackendWatch> {
        self.arm_leases();
        Ok(self.inner.notifier.subscribe(prefix))
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".keel");
        let _ = std::fs::create_dir_all(&p);
        p.push("keel.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "keel.db".to_string()
}

/// Milliseconds since epoch.
pub fn now_ms() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_millis() as i64
}
