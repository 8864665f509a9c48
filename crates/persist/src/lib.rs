//! SQLite backend for the kiln store.
//!
//! One connection behind a mutex serializes every operation of a handle; calls
//! run on Tokio's blocking pool. Each write is an immediate transaction that
//! bumps the revision counter in `meta` and appends a row to `changes`; the
//! change log is trimmed to the configured history and watchers poll it.
//! Reads are deferred transactions, so under WAL they never wait for a writer
//! and several handles (or processes) may share one file.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use metrics::{counter, histogram};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};

use kiln_store::{Backend, BackendError, BackendResult, BackendWatchStream, KeyValue, RawEvent, RawEventKind};

pub const DEFAULT_HISTORY: usize = 1000;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

const KIND_PUT: i64 = 0;
const KIND_DELETE: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key           TEXT PRIMARY KEY,
    value         BLOB NOT NULL,
    revision      INTEGER NOT NULL,
    expires_at_ms INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv(expires_at_ms) WHERE expires_at_ms > 0;
CREATE TABLE IF NOT EXISTS changes (
    revision   INTEGER PRIMARY KEY,
    key        TEXT NOT NULL,
    kind       INTEGER NOT NULL,
    value      BLOB,
    prev_value BLOB
);
CREATE TABLE IF NOT EXISTS meta (
    name  TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
INSERT OR IGNORE INTO meta(name, value) VALUES ('revision', 0), ('compacted', 0);
";

#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Change rows kept for watch replay.
    pub history: usize,
    pub poll_interval: Duration,
}

impl Default for SqliteConfig {
    fn default() -> Self { Self { history: DEFAULT_HISTORY, poll_interval: DEFAULT_POLL_INTERVAL } }
}

impl SqliteConfig {
    /// `KILN_WATCH_HISTORY` and `KILN_WATCH_POLL_MS` over the defaults.
    pub fn from_env() -> Self {
        let history = std::env::var("KILN_WATCH_HISTORY").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(DEFAULT_HISTORY);
        let poll_interval = std::env::var("KILN_WATCH_POLL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        Self { history: history.max(1), poll_interval }
    }
}

enum OpError {
    Sql(rusqlite::Error),
    Store(BackendError),
}

impl From<rusqlite::Error> for OpError {
    fn from(e: rusqlite::Error) -> Self { OpError::Sql(e) }
}

impl From<BackendError> for OpError {
    fn from(e: BackendError) -> Self { OpError::Store(e) }
}

impl From<OpError> for BackendError {
    fn from(e: OpError) -> Self {
        match e {
            OpError::Sql(e) => BackendError::Unavailable(format!("sqlite: {e}")),
            OpError::Store(e) => e,
        }
    }
}

type OpResult<T> = Result<T, OpError>;

fn now_ms() -> i64 { chrono::Utc::now().timestamp_millis() }

fn deadline_ms(now: i64, ttl: u64) -> i64 {
    if ttl == 0 {
        return 0;
    }
    now.saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX).saturating_mul(1000))
}

fn remaining_secs(now: i64, expires_at: i64) -> u64 {
    if expires_at == 0 {
        return 0;
    }
    let left = u64::try_from(expires_at - now).unwrap_or(0);
    ((left + 999) / 1000).max(1)
}

fn prefix_end(prefix: &str) -> String { format!("{prefix}{}", char::MAX) }

fn pack(value: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("KILN_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        if let Ok(z) = zstd::encode_all(value, lvl) {
            return z;
        }
    }
    value.to_vec()
}

fn unpack(blob: Vec<u8>) -> Bytes {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(&blob)) {
            return Bytes::from(de);
        }
    }
    Bytes::from(blob)
}

struct Shared {
    db: Mutex<Connection>,
    cfg: SqliteConfig,
}

impl Shared {
    fn lock(&self) -> BackendResult<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| BackendError::Unavailable("sqlite connection lock poisoned".into()))
    }

    /// Run `f` in a write transaction after purging expired rows. Logical
    /// failures still commit the purge; SQLite failures roll everything back.
    fn write<T>(&self, op: &'static str, f: impl FnOnce(&Transaction<'_>, i64) -> OpResult<T>) -> BackendResult<T> {
        let started = Instant::now();
        let mut db = self.lock()?;
        // Immediate: the revision counter is read-modify-write across handles.
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate).map_err(OpError::from)?;
        let now = now_ms();
        let out = self.purge_expired(&tx, now).and_then(|_| f(&tx, now));
        let out = match out {
            Err(OpError::Sql(e)) => Err(OpError::Sql(e)),
            other => tx.commit().map_err(OpError::from).and(other),
        };
        histogram!("persist_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
        out.map_err(BackendError::from)
    }

    /// Run `f` in a deferred read transaction. Nothing is purged; queries
    /// must skip rows whose deadline passed.
    fn read<T>(&self, op: &'static str, f: impl FnOnce(&Transaction<'_>, i64) -> OpResult<T>) -> BackendResult<T> {
        let started = Instant::now();
        let mut db = self.lock()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Deferred).map_err(OpError::from)?;
        let out = f(&tx, now_ms());
        drop(tx);
        histogram!("persist_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
        out.map_err(BackendError::from)
    }

    fn meta(tx: &Transaction<'_>, name: &str) -> OpResult<u64> {
        let v: i64 = tx.query_row("SELECT value FROM meta WHERE name = ?1", [name], |r| r.get(0))?;
        Ok(u64::try_from(v).unwrap_or(0))
    }

    fn bump(tx: &Transaction<'_>) -> OpResult<u64> {
        tx.execute("UPDATE meta SET value = value + 1 WHERE name = 'revision'", [])?;
        Self::meta(tx, "revision")
    }

    fn record(
        &self,
        tx: &Transaction<'_>,
        rev: u64,
        key: &str,
        kind: i64,
        value: Option<&[u8]>,
        prev: Option<&[u8]>,
    ) -> OpResult<()> {
        tx.execute(
            "INSERT INTO changes(revision, key, kind, value, prev_value) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![rev as i64, key, kind, value, prev],
        )?;
        let floor = rev as i64 - self.cfg.history as i64;
        if floor > 0 {
            tx.execute("DELETE FROM changes WHERE revision <= ?1", [floor])?;
            tx.execute("UPDATE meta SET value = MAX(value, ?1) WHERE name = 'compacted'", [floor])?;
        }
        Ok(())
    }

    /// Stored row for `key`, expired or not.
    fn load(tx: &Transaction<'_>, key: &str) -> OpResult<Option<(Vec<u8>, u64, i64)>> {
        let row = tx
            .query_row("SELECT value, revision, expires_at_ms FROM kv WHERE key = ?1", [key], |r| {
                Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
            })
            .optional()?;
        Ok(row.map(|(v, rev, exp)| (v, rev as u64, exp)))
    }

    fn purge_expired(&self, tx: &Transaction<'_>, now: i64) -> OpResult<usize> {
        let expired: Vec<(String, Vec<u8>)> = {
            let mut stmt = tx.prepare_cached(
                "SELECT key, value FROM kv WHERE expires_at_ms > 0 AND expires_at_ms <= ?1 ORDER BY expires_at_ms, key",
            )?;
            let rows = stmt.query_map([now], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for (key, value) in &expired {
            tx.execute("DELETE FROM kv WHERE key = ?1", [key])?;
            let rev = Self::bump(tx)?;
            self.record(tx, rev, key, KIND_DELETE, None, Some(value.as_slice()))?;
        }
        if !expired.is_empty() {
            counter!("backend_expired_total", expired.len() as u64, "backend" => "sqlite");
            debug!(purged = expired.len(), "persist: expired rows removed");
        }
        Ok(expired.len())
    }

    fn has_expired(&self) -> BackendResult<bool> {
        self.read("has_expired", |tx, now| {
            let hit = tx
                .query_row("SELECT 1 FROM kv WHERE expires_at_ms > 0 AND expires_at_ms <= ?1 LIMIT 1", [now], |_| Ok(()))
                .optional()?;
            Ok(hit.is_some())
        })
    }

    /// Write transaction that only purges; skipped when nothing expired.
    fn sweep(&self) -> BackendResult<()> {
        if self.has_expired()? {
            self.write("sweep", |_, _| Ok(()))?;
        }
        Ok(())
    }

    fn poll(&self, prefix: &str, after: u64) -> BackendResult<(Vec<RawEvent>, u64)> {
        // Expiry deletes must reach watchers of idle stores.
        if let Err(e) = self.sweep() {
            debug!(error = %e, "persist: sweep before poll skipped");
        }
        self.read("poll", |tx, _| {
            let compacted = Self::meta(tx, "compacted")?;
            if after < compacted {
                return Err(BackendError::Compacted { requested: after, oldest: compacted + 1 }.into());
            }
            let mut stmt = tx.prepare_cached(
                "SELECT revision, key, kind, value, prev_value FROM changes
                 WHERE revision > ?1 AND key >= ?2 AND key < ?3 ORDER BY revision",
            )?;
            let rows = stmt.query_map(params![after as i64, prefix, prefix_end(prefix)], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, Option<Vec<u8>>>(3)?,
                    r.get::<_, Option<Vec<u8>>>(4)?,
                ))
            })?;
            let mut events = Vec::new();
            for row in rows {
                let (rev, key, kind, value, prev) = row?;
                if !key.starts_with(prefix) {
                    continue;
                }
                let kind = if kind == KIND_DELETE { RawEventKind::Delete } else { RawEventKind::Put };
                events.push(RawEvent { kind, key, value: value.map(unpack), prev_value: prev.map(unpack), revision: rev as u64 });
            }
            Ok((events, Self::meta(tx, "revision")?))
        })
    }
}

fn live(exp: i64, now: i64) -> bool { exp == 0 || exp > now }

/// Run a rusqlite call on the blocking pool so a locked database never
/// stalls the async runtime.
async fn blocking<T, F>(shared: &Arc<Shared>, f: F) -> BackendResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Shared) -> BackendResult<T> + Send + 'static,
{
    let shared = Arc::clone(shared);
    tokio::task::spawn_blocking(move || f(&shared))
        .await
        .map_err(|e| BackendError::Unavailable(format!("sqlite task failed: {e}")))?
}

/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct SqliteBackend {
    shared: Arc<Shared>,
}

impl SqliteBackend {
    pub fn open(path: &str) -> Result<Self> { Self::open_with(path, SqliteConfig::from_env()) }

    pub fn open_with(path: &str, cfg: SqliteConfig) -> Result<Self> {
        let started = Instant::now();
        let db = Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.busy_timeout(Duration::from_secs(5)).context("setting busy timeout")?;
        let me = Self::init(db, cfg)?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(path, history = me.shared.cfg.history, "persist: opened");
        Ok(me)
    }

    pub fn open_in_memory() -> Result<Self> { Self::open_in_memory_with(SqliteConfig::from_env()) }

    pub fn open_in_memory_with(cfg: SqliteConfig) -> Result<Self> {
        let db = Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::init(db, cfg)
    }

    fn init(db: Connection, cfg: SqliteConfig) -> Result<Self> {
        db.execute_batch(SCHEMA).context("creating kiln tables")?;
        Ok(Self { shared: Arc::new(Shared { db: Mutex::new(db), cfg }) })
    }

    /// Remove expired rows now; returns how many were removed.
    /// Blocking; call from the blocking pool inside a runtime.
    pub fn purge_expired(&self) -> BackendResult<usize> {
        let mut db = self.shared.lock()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate).map_err(OpError::from)?;
        let purged = self.shared.purge_expired(&tx, now_ms())?;
        tx.commit().map_err(OpError::from)?;
        Ok(purged)
    }
}

struct Poller {
    shared: Arc<Shared>,
    prefix: String,
    last: u64,
    pending: VecDeque<RawEvent>,
    primed: bool,
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn create(&self, key: &str, value: Bytes, ttl: u64) -> BackendResult<u64> {
        let key = key.to_string();
        blocking(&self.shared, move |shared| {
            shared.write("create", |tx, now| {
                if Shared::load(tx, &key)?.is_some() {
                    return Err(BackendError::AlreadyExists.into());
                }
                let rev = Shared::bump(tx)?;
                let packed = pack(&value);
                tx.execute(
                    "INSERT INTO kv(key, value, revision, expires_at_ms) VALUES (?1, ?2, ?3, ?4)",
                    params![key, packed, rev as i64, deadline_ms(now, ttl)],
                )?;
                shared.record(tx, rev, &key, KIND_PUT, Some(packed.as_slice()), None)?;
                Ok(rev)
            })
        })
        .await
    }

    async fn get(&self, key: &str) -> BackendResult<KeyValue> {
        let key = key.to_string();
        blocking(&self.shared, move |shared| {
            shared.read("get", |tx, now| {
                let (value, revision, exp) = Shared::load(tx, &key)?
                    .filter(|(_, _, exp)| live(*exp, now))
                    .ok_or(BackendError::NotFound)?;
                Ok(KeyValue { key: key.clone(), value: unpack(value), revision, ttl: remaining_secs(now, exp) })
            })
        })
        .await
    }

    async fn update(&self, key: &str, expected: u64, value: Bytes, ttl: u64) -> BackendResult<u64> {
        let key = key.to_string();
        blocking(&self.shared, move |shared| {
            shared.write("update", |tx, now| {
                let (prev, actual, _) = Shared::load(tx, &key)?.ok_or(BackendError::NotFound)?;
                if actual != expected {
                    return Err(BackendError::Conflict { expected, actual }.into());
                }
                let rev = Shared::bump(tx)?;
                let packed = pack(&value);
                tx.execute(
                    "UPDATE kv SET value = ?2, revision = ?3, expires_at_ms = ?4 WHERE key = ?1",
                    params![key, packed, rev as i64, deadline_ms(now, ttl)],
                )?;
                shared.record(tx, rev, &key, KIND_PUT, Some(packed.as_slice()), Some(prev.as_slice()))?;
                Ok(rev)
            })
        })
        .await
    }

    async fn delete(&self, key: &str, expected: Option<u64>) -> BackendResult<KeyValue> {
        let key = key.to_string();
        blocking(&self.shared, move |shared| {
            shared.write("delete", |tx, now| {
                let (prev, actual, exp) = Shared::load(tx, &key)?.ok_or(BackendError::NotFound)?;
                if let Some(expected) = expected {
                    if actual != expected {
                        return Err(BackendError::Conflict { expected, actual }.into());
                    }
                }
                tx.execute("DELETE FROM kv WHERE key = ?1", [&key])?;
                let rev = Shared::bump(tx)?;
                shared.record(tx, rev, &key, KIND_DELETE, None, Some(prev.as_slice()))?;
                Ok(KeyValue { key: key.clone(), value: unpack(prev), revision: actual, ttl: remaining_secs(now, exp) })
            })
        })
        .await
    }

    async fn list(&self, prefix: &str) -> BackendResult<(Vec<KeyValue>, u64)> {
        let prefix = prefix.to_string();
        blocking(&self.shared, move |shared| {
            shared.read("list", |tx, now| {
                let mut stmt = tx.prepare_cached(
                    "SELECT key, value, revision, expires_at_ms FROM kv
                     WHERE key >= ?1 AND key < ?2 AND (expires_at_ms = 0 OR expires_at_ms > ?3) ORDER BY key",
                )?;
                let rows = stmt.query_map(params![prefix, prefix_end(&prefix), now], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, Vec<u8>>(1)?, r.get::<_, i64>(2)?, r.get::<_, i64>(3)?))
                })?;
                let mut items = Vec::new();
                for row in rows {
                    let (key, value, rev, exp) = row?;
                    if key.starts_with(prefix.as_str()) {
                        items.push(KeyValue { key, value: unpack(value), revision: rev as u64, ttl: remaining_secs(now, exp) });
                    }
                }
                Ok((items, Shared::meta(tx, "revision")?))
            })
        })
        .await
    }

    async fn watch(&self, prefix: &str, from: u64) -> BackendResult<BackendWatchStream> {
        let compacted = blocking(&self.shared, |shared| shared.read("watch", |tx, _| Shared::meta(tx, "compacted"))).await?;
        if from < compacted {
            return Err(BackendError::Compacted { requested: from, oldest: compacted + 1 });
        }
        debug!(prefix = %prefix, from, "persist: watch opened");
        let poller = Poller {
            shared: Arc::clone(&self.shared),
            prefix: prefix.to_string(),
            last: from,
            pending: VecDeque::new(),
            primed: false,
        };
        let events = stream::unfold(Some(poller), |state| async move {
            let mut p = state?;
            loop {
                if let Some(ev) = p.pending.pop_front() {
                    return Some((Ok(ev), Some(p)));
                }
                if p.primed {
                    tokio::time::sleep(p.shared.cfg.poll_interval).await;
                }
                p.primed = true;
                let (prefix, last) = (p.prefix.clone(), p.last);
                match blocking(&p.shared, move |shared| shared.poll(&prefix, last)).await {
                    Ok((events, head)) => {
                        p.last = p.last.max(head);
                        p.pending.extend(events);
                    }
                    Err(e) => {
                        warn!(prefix = %p.prefix, last = p.last, error = %e, "persist: watch poll failed");
                        return Some((Err(e), None));
                    }
                }
            }
        });
        Ok(Box::pin(events))
    }

    async fn revision(&self) -> BackendResult<u64> {
        blocking(&self.shared, |shared| shared.read("revision", |tx, _| Shared::meta(tx, "revision"))).await
    }
}
