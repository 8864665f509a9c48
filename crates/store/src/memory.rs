//! In-memory reference backend.
//!
//! Ordered entries, one global revision counter, a bounded ring of recent
//! changes for watch replay and a broadcast channel for live changes. TTL
//! deadlines are `tokio::time::Instant`s; expired entries are removed (with a
//! delete event) before every operation.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::{Backend, BackendError, BackendResult, BackendWatchStream, KeyValue, RawEvent, RawEventKind};

pub const DEFAULT_HISTORY: usize = 1000;

struct Entry {
    value: Bytes,
    revision: u64,
    expires_at: Option<Instant>,
}

struct State {
    revision: u64,
    entries: BTreeMap<String, Entry>,
    expiry: BTreeSet<(Instant, String)>,
    history: VecDeque<RawEvent>,
    history_cap: usize,
    /// Highest revision dropped from `history`.
    compacted: u64,
}

impl State {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn record(&mut self, ev: RawEvent, tx: &broadcast::Sender<RawEvent>) {
        if self.history.len() >= self.history_cap {
            if let Some(old) = self.history.pop_front() {
                self.compacted = old.revision;
            }
        }
        self.history.push_back(ev.clone());
        // No receivers is fine.
        let _ = tx.send(ev);
    }

    fn set_expiry(&mut self, key: &str, old: Option<Instant>, new: Option<Instant>) {
        if let Some(at) = old {
            self.expiry.remove(&(at, key.to_string()));
        }
        if let Some(at) = new {
            self.expiry.insert((at, key.to_string()));
        }
    }

    fn purge_expired(&mut self, now: Instant, tx: &broadcast::Sender<RawEvent>) -> usize {
        let mut purged = 0usize;
        while let Some((at, key)) = self.expiry.first().cloned() {
            if at > now {
                break;
            }
            self.expiry.remove(&(at, key.clone()));
            if let Some(entry) = self.entries.remove(&key) {
                let revision = self.next_revision();
                self.record(
                    RawEvent { kind: RawEventKind::Delete, key, value: None, prev_value: Some(entry.value), revision },
                    tx,
                );
                purged += 1;
            }
        }
        if purged > 0 {
            metrics::counter!("backend_expired_total", purged as u64, "backend" => "memory");
            debug!(purged, revision = self.revision, "memory: expired entries removed");
        }
        purged
    }

    fn key_value(&self, key: &str, entry: &Entry, now: Instant) -> KeyValue {
        KeyValue { key: key.to_string(), value: entry.value.clone(), revision: entry.revision, ttl: remaining(entry, now) }
    }
}

fn deadline(now: Instant, ttl: u64) -> Option<Instant> {
    (ttl > 0).then(|| now + Duration::from_secs(ttl))
}

fn remaining(entry: &Entry, now: Instant) -> u64 {
    match entry.expires_at {
        None => 0,
        Some(at) => {
            let left = at.saturating_duration_since(now);
            (left.as_secs() + u64::from(left.subsec_nanos() > 0)).max(1)
        }
    }
}

fn history_from_env() -> usize {
    std::env::var("KILN_WATCH_HISTORY").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(DEFAULT_HISTORY)
}

pub struct MemoryBackend {
    state: Mutex<State>,
    events: broadcast::Sender<RawEvent>,
}

impl Default for MemoryBackend {
    fn default() -> Self { Self::new() }
}

impl MemoryBackend {
    /// History length from `KILN_WATCH_HISTORY`, default 1000.
    ///
    /// Expiry runs on the next operation. A watcher of an otherwise idle
    /// backend sees the `Delete` of an expired entry only once
    /// [`spawn_sweeper`](Self::spawn_sweeper) is running.
    pub fn new() -> Self { Self::with_history(history_from_env()) }

    pub fn with_history(history: usize) -> Self {
        let history_cap = history.max(1);
        let (events, _) = broadcast::channel(history_cap.max(16));
        let state = State {
            revision: 0,
            entries: BTreeMap::new(),
            expiry: BTreeSet::new(),
            history: VecDeque::with_capacity(history_cap.min(4096)),
            history_cap,
            compacted: 0,
        };
        Self { state: Mutex::new(state), events }
    }

    fn lock(&self) -> BackendResult<MutexGuard<'_, State>> {
        let mut st = self.state.lock().map_err(|_| BackendError::Unavailable("memory backend lock poisoned".into()))?;
        st.purge_expired(Instant::now(), &self.events);
        Ok(st)
    }

    /// Remove expired entries now; returns how many were removed.
    pub fn purge_expired(&self) -> BackendResult<usize> {
        let mut st = self.state.lock().map_err(|_| BackendError::Unavailable("memory backend lock poisoned".into()))?;
        Ok(st.purge_expired(Instant::now(), &self.events))
    }

    /// Number of live entries.
    pub fn len(&self) -> BackendResult<usize> { Ok(self.lock()?.entries.len()) }

    pub fn is_empty(&self) -> BackendResult<bool> { Ok(self.len()? == 0) }

    /// Periodically expire entries of an otherwise idle backend. The task
    /// ends once the backend is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(backend) = weak.upgrade() else { break };
                if let Err(e) = backend.purge_expired() {
                    warn!(error = %e, "memory: sweep failed");
                }
            }
            debug!("memory: sweeper stopped");
        })
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create(&self, key: &str, value: Bytes, ttl: u64) -> BackendResult<u64> {
        let mut st = self.lock()?;
        if st.entries.contains_key(key) {
            return Err(BackendError::AlreadyExists);
        }
        let now = Instant::now();
        let revision = st.next_revision();
        let expires_at = deadline(now, ttl);
        st.entries.insert(key.to_string(), Entry { value: value.clone(), revision, expires_at });
        st.set_expiry(key, None, expires_at);
        st.record(
            RawEvent { kind: RawEventKind::Put, key: key.to_string(), value: Some(value), prev_value: None, revision },
            &self.events,
        );
        Ok(revision)
    }

    async fn get(&self, key: &str) -> BackendResult<KeyValue> {
        let st = self.lock()?;
        let entry = st.entries.get(key).ok_or(BackendError::NotFound)?;
        Ok(st.key_value(key, entry, Instant::now()))
    }

    async fn update(&self, key: &str, expected: u64, value: Bytes, ttl: u64) -> BackendResult<u64> {
        let mut st = self.lock()?;
        let (actual, old_expiry) = match st.entries.get(key) {
            Some(entry) => (entry.revision, entry.expires_at),
            None => return Err(BackendError::NotFound),
        };
        if actual != expected {
            return Err(BackendError::Conflict { expected, actual });
        }
        let now = Instant::now();
        let revision = st.next_revision();
        let expires_at = deadline(now, ttl);
        let prev = st.entries.insert(key.to_string(), Entry { value: value.clone(), revision, expires_at });
        st.set_expiry(key, old_expiry, expires_at);
        st.record(
            RawEvent {
                kind: RawEventKind::Put,
                key: key.to_string(),
                value: Some(value),
                prev_value: prev.map(|e| e.value),
                revision,
            },
            &self.events,
        );
        Ok(revision)
    }

    async fn delete(&self, key: &str, expected: Option<u64>) -> BackendResult<KeyValue> {
        let mut st = self.lock()?;
        let actual = st.entries.get(key).map(|e| e.revision).ok_or(BackendError::NotFound)?;
        if let Some(expected) = expected {
            if actual != expected {
                return Err(BackendError::Conflict { expected, actual });
            }
        }
        let now = Instant::now();
        let entry = st.entries.remove(key).ok_or(BackendError::NotFound)?;
        let removed = st.key_value(key, &entry, now);
        st.set_expiry(key, entry.expires_at, None);
        let revision = st.next_revision();
        st.record(
            RawEvent { kind: RawEventKind::Delete, key: key.to_string(), value: None, prev_value: Some(entry.value), revision },
            &self.events,
        );
        Ok(removed)
    }

    async fn list(&self, prefix: &str) -> BackendResult<(Vec<KeyValue>, u64)> {
        let st = self.lock()?;
        let now = Instant::now();
        let items = st
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| st.key_value(k, e, now))
            .collect();
        Ok((items, st.revision))
    }

    async fn watch(&self, prefix: &str, from: u64) -> BackendResult<BackendWatchStream> {
        let (backlog, rx) = {
            let st = self.lock()?;
            if from < st.compacted {
                return Err(BackendError::Compacted { requested: from, oldest: st.compacted + 1 });
            }
            let backlog: Vec<RawEvent> = st
                .history
                .iter()
                .filter(|e| e.revision > from && e.key.starts_with(prefix))
                .cloned()
                .collect();
            // Subscribe under the lock so nothing falls between backlog and live.
            (backlog, self.events.subscribe())
        };
        debug!(prefix = %prefix, from, backlog = backlog.len(), "memory: watch opened");

        let prefix = prefix.to_string();
        let live = stream::unfold(Some((rx, from)), move |state| {
            let prefix = prefix.clone();
            async move {
                let (mut rx, mut last) = state?;
                loop {
                    match rx.recv().await {
                        Ok(ev) if ev.revision > last && ev.key.starts_with(&prefix) => {
                            last = ev.revision;
                            return Some((Ok(ev), Some((rx, last))));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, last, "memory: watcher fell behind");
                            let err = BackendError::Compacted { requested: last, oldest: last + skipped + 1 };
                            return Some((Err(err), None));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(Box::pin(stream::iter(backlog.into_iter().map(Ok)).chain(live)))
    }

    async fn revision(&self) -> BackendResult<u64> {
        Ok(self.lock()?.revision)
    }
}
