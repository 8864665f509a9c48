use std::fmt;
use std::sync::Arc;

use crate::backend::Backend;

pub const DEFAULT_DELETE_COLLECTION_WORKERS: usize = 1;
pub const DEFAULT_UPDATE_RETRIES: usize = 5;
pub const DEFAULT_WATCH_CHANNEL_CAPACITY: usize = 256;

/// Shared construction options handed to every resource kind.
#[derive(Clone)]
pub struct StoreOptions {
    pub backend: Arc<dyn Backend>,
    /// Concurrent deletes during delete-collection.
    pub delete_collection_workers: usize,
    /// Extra attempts after an update loses a compare-and-swap race.
    pub update_retries: usize,
    pub watch_channel_capacity: usize,
}

impl StoreOptions {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            delete_collection_workers: DEFAULT_DELETE_COLLECTION_WORKERS,
            update_retries: DEFAULT_UPDATE_RETRIES,
            watch_channel_capacity: DEFAULT_WATCH_CHANNEL_CAPACITY,
        }
    }

    /// Defaults overridden by `KILN_DELETE_COLLECTION_WORKERS`,
    /// `KILN_UPDATE_RETRIES` and `KILN_WATCH_QUEUE_CAP`.
    pub fn from_env(backend: Arc<dyn Backend>) -> Self {
        let workers = env_usize("KILN_DELETE_COLLECTION_WORKERS", DEFAULT_DELETE_COLLECTION_WORKERS).max(1);
        let retries = env_usize("KILN_UPDATE_RETRIES", DEFAULT_UPDATE_RETRIES);
        let cap = env_usize("KILN_WATCH_QUEUE_CAP", DEFAULT_WATCH_CHANNEL_CAPACITY).max(1);
        Self { backend, delete_collection_workers: workers, update_retries: retries, watch_channel_capacity: cap }
    }

    pub fn with_delete_collection_workers(mut self, n: usize) -> Self {
        self.delete_collection_workers = n.max(1);
        self
    }

    pub fn with_update_retries(mut self, n: usize) -> Self {
        self.update_retries = n;
        self
    }

    pub fn with_watch_channel_capacity(mut self, n: usize) -> Self {
        self.watch_channel_capacity = n.max(1);
        self
    }
}

impl fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("delete_collection_workers", &self.delete_collection_workers)
            .field("update_retries", &self.update_retries)
            .field("watch_channel_capacity", &self.watch_channel_capacity)
            .finish_non_exhaustive()
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<usize>().ok()).unwrap_or(default)
}
