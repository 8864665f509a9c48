//! Key-value backend contract the store engine runs on.
//!
//! Backends own revisions, TTL expiry and change history. The engine never
//! locks; every concurrent mutation is ordered by the backend's
//! compare-and-swap on the revision of a key.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use kiln_core::StoreError;
use thiserror::Error;

/// A stored value with the revision that last modified it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    pub revision: u64,
    /// Remaining seconds to live, 0 when the entry never expires.
    pub ttl: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Put,
    Delete,
}

/// A change to one key, as recorded by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawEventKind,
    pub key: String,
    /// New value for puts, `None` for deletes.
    pub value: Option<Bytes>,
    /// Value before the change, `None` when the key did not exist.
    pub prev_value: Option<Bytes>,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("key not found")]
    NotFound,
    #[error("key already exists")]
    AlreadyExists,
    #[error("revision mismatch: expected {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },
    #[error("revision {requested} compacted (oldest retained {oldest})")]
    Compacted { requested: u64, oldest: u64 },
    #[error("{0}")]
    Unavailable(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

pub(crate) const CONFLICT_MESSAGE: &str =
    "the object has been modified; please apply your changes to the latest version and try again";

impl BackendError {
    /// Attach the resource and object name the failed call was about.
    pub fn into_store_error(self, resource: &str, name: &str) -> StoreError {
        match self {
            BackendError::NotFound => StoreError::not_found(resource, name),
            BackendError::AlreadyExists => StoreError::already_exists(resource, name),
            BackendError::Conflict { .. } => StoreError::conflict(resource, name, CONFLICT_MESSAGE),
            BackendError::Compacted { requested, oldest } => StoreError::Gone { requested, oldest },
            BackendError::Unavailable(msg) => StoreError::BackendUnavailable(msg),
        }
    }
}

/// Change stream for a key prefix. Dropping it releases the subscription.
pub type BackendWatchStream = Pin<Box<dyn Stream<Item = BackendResult<RawEvent>> + Send>>;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Create-only write. `ttl` of 0 means no expiry.
    async fn create(&self, key: &str, value: Bytes, ttl: u64) -> BackendResult<u64>;

    async fn get(&self, key: &str) -> BackendResult<KeyValue>;

    /// Write only if the key is still at `expected`; returns the new revision.
    async fn update(&self, key: &str, expected: u64, value: Bytes, ttl: u64) -> BackendResult<u64>;

    /// Delete, conditionally on `expected` when given; returns the removed entry.
    async fn delete(&self, key: &str, expected: Option<u64>) -> BackendResult<KeyValue>;

    /// Live entries under `prefix` in key order, with the revision of the snapshot.
    async fn list(&self, prefix: &str) -> BackendResult<(Vec<KeyValue>, u64)>;

    /// Changes under `prefix` with revision strictly greater than `from`.
    async fn watch(&self, prefix: &str, from: u64) -> BackendResult<BackendWatchStream>;

    /// Latest revision written.
    async fn revision(&self) -> BackendResult<u64>;
}
