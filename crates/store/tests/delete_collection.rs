#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use k8s_openapi::api::core::v1::ConfigMap;
use kiln_core::{FieldError, LabelSelector, RequestContext, StoreError};
use kiln_store::{
    Backend, BackendResult, BackendWatchStream, KeyValue, ListOptions, MemoryBackend, Store, StoreOptions, Strategy,
};

/// Tracks how many deletes are in flight at once.
#[derive(Default)]
struct Counting {
    inner: MemoryBackend,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait]
impl Backend for Counting {
    async fn create(&self, key: &str, value: Bytes, ttl: u64) -> BackendResult<u64> { self.inner.create(key, value, ttl).await }
    async fn get(&self, key: &str) -> BackendResult<KeyValue> { self.inner.get(key).await }
    async fn update(&self, key: &str, expected: u64, value: Bytes, ttl: u64) -> BackendResult<u64> {
        self.inner.update(key, expected, value, ttl).await
    }
    async fn delete(&self, key: &str, expected: Option<u64>) -> BackendResult<KeyValue> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        let out = self.inner.delete(key, expected).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }
    async fn list(&self, prefix: &str) -> BackendResult<(Vec<KeyValue>, u64)> { self.inner.list(prefix).await }
    async fn watch(&self, prefix: &str, from: u64) -> BackendResult<BackendWatchStream> { self.inner.watch(prefix, from).await }
    async fn revision(&self) -> BackendResult<u64> { self.inner.revision().await }
}

/// Refuses to delete objects labelled `protected=true`.
struct Guarded;

impl Strategy<ConfigMap> for Guarded {
    fn validate(&self, obj: &ConfigMap) -> Vec<FieldError> { kiln_core::validation::validate_object_meta(&obj.metadata, true) }
    fn validate_update(&self, new: &ConfigMap, _old: &ConfigMap) -> Vec<FieldError> { self.validate(new) }
    fn validate_delete(&self, obj: &ConfigMap) -> Vec<FieldError> {
        let protected = obj.metadata.labels.as_ref().and_then(|l| l.get("protected")).map_or(false, |v| v == "true");
        if protected {
            vec![FieldError::forbidden("metadata.labels", "object is protected")]
        } else {
            Vec::new()
        }
    }
}

fn cm(name: &str, protected: bool) -> ConfigMap {
    let mut obj = ConfigMap::default();
    obj.metadata.name = Some(name.to_string());
    if protected {
        obj.metadata.labels = Some([("protected".to_string(), "true".to_string())].into_iter().collect());
    }
    obj
}

async fn seeded(backend: Arc<Counting>, workers: usize, names: &[(&str, bool)]) -> Store<ConfigMap> {
    let opts = StoreOptions::new(backend).with_delete_collection_workers(workers);
    let s = Store::builder("configmaps", Guarded, opts).build();
    for (i, (name, protected)) in names.iter().enumerate() {
        let ns = if i % 2 == 0 { "a" } else { "b" };
        s.create(&RequestContext::namespaced(ns), cm(name, *protected)).await.unwrap();
    }
    s
}

#[tokio::test]
async fn deletes_everything_with_bounded_workers() {
    let backend = Arc::new(Counting::default());
    let names: Vec<String> = (0..10).map(|i| format!("c{i}")).collect();
    let items: Vec<(&str, bool)> = names.iter().map(|n| (n.as_str(), false)).collect();
    let s = seeded(backend.clone(), 3, &items).await;

    let deleted = s.delete_collection(&RequestContext::cluster(), &ListOptions::default()).await.unwrap();
    assert_eq!(deleted.items.len(), 10);
    assert!(s.list(&RequestContext::cluster(), &ListOptions::default()).await.unwrap().items.is_empty());
    let max = backend.max_in_flight.load(Ordering::SeqCst);
    assert!(max >= 1 && max <= 3, "max in flight {max}");
}

#[tokio::test]
async fn failures_are_collected_and_the_rest_deleted() {
    let backend = Arc::new(Counting::default());
    let s = seeded(backend, 2, &[("a1", false), ("b1", true), ("a2", false), ("b2", true), ("a3", false)]).await;

    let err = s.delete_collection(&RequestContext::cluster(), &ListOptions::default()).await.unwrap_err();
    match err {
        StoreError::Aggregate { deleted, failures } => {
            assert_eq!(deleted, 3);
            let mut failed: Vec<_> = failures.iter().map(|f| f.name.as_str()).collect();
            failed.sort();
            assert_eq!(failed, vec!["b1", "b2"]);
            assert!(failures.iter().all(|f| f.error.is_invalid()));
        }
        other => panic!("unexpected {other}"),
    }
    let left = s.list(&RequestContext::cluster(), &ListOptions::default()).await.unwrap();
    assert_eq!(left.items.len(), 2);
}

#[tokio::test]
async fn selector_limits_what_is_deleted() {
    let backend = Arc::new(Counting::default());
    let s = seeded(backend, 4, &[("a1", false), ("b1", false), ("a2", false)]).await;

    let only_a = RequestContext::namespaced("a");
    let deleted = s.delete_collection(&only_a, &ListOptions::default()).await.unwrap();
    assert_eq!(deleted.items.len(), 2);

    let opts = ListOptions::default().with_labels(LabelSelector::parse("protected").unwrap());
    let none = s.delete_collection(&RequestContext::cluster(), &opts).await.unwrap();
    assert!(none.items.is_empty());
    assert_eq!(s.list(&RequestContext::cluster(), &ListOptions::default()).await.unwrap().items.len(), 1);
}
