#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use k8s_openapi::api::core::v1::ConfigMap;
use kiln_core::{FieldError, FieldErrorKind, FieldSelector, LabelSelector, RequestContext, StoreError};
use kiln_store::{
    Backend, BackendError, BackendResult, BackendWatchStream, DeleteOptions, FixedTtl, KeyValue, ListOptions, MemoryBackend,
    ObjectMetaStrategy, Store, StoreOptions, Strategy,
};

fn cm(ns: Option<&str>, name: &str, labels: &[(&str, &str)]) -> ConfigMap {
    let mut obj = ConfigMap::default();
    obj.metadata.name = Some(name.to_string());
    obj.metadata.namespace = ns.map(String::from);
    if !labels.is_empty() {
        obj.metadata.labels = Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
    }
    obj
}

fn with_data(mut obj: ConfigMap, k: &str, v: &str) -> ConfigMap {
    obj.data.get_or_insert_with(BTreeMap::new).insert(k.to_string(), v.to_string());
    obj
}

fn rv(obj: &ConfigMap) -> u64 { obj.metadata.resource_version.as_deref().unwrap().parse().unwrap() }

fn store(backend: Arc<dyn Backend>) -> Store<ConfigMap> {
    Store::builder("configmaps", ObjectMetaStrategy::namespaced(), StoreOptions::new(backend)).build()
}

fn mem() -> Arc<dyn Backend> { Arc::new(MemoryBackend::with_history(128)) }

fn ns(n: &str) -> RequestContext { RequestContext::namespaced(n) }

#[tokio::test]
async fn create_then_get() {
    let s = store(mem());
    let created = s.create(&ns("default"), with_data(cm(None, "c1", &[]), "k", "v")).await.unwrap();
    assert_eq!(created.metadata.namespace.as_deref(), Some("default"));
    assert!(created.metadata.uid.is_some());
    assert!(created.metadata.creation_timestamp.is_some());

    let got = s.get(&ns("default"), "c1").await.unwrap();
    assert_eq!(got, created);

    let err = s.create(&ns("default"), cm(None, "c1", &[])).await.unwrap_err();
    assert!(err.is_already_exists(), "{err}");
    // Same name in another namespace is a different object.
    s.create(&ns("other"), cm(None, "c1", &[])).await.unwrap();

    let err = s.get(&ns("default"), "missing").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn create_checks_namespace_and_names() {
    let s = store(mem());
    let err = s.create(&ns("default"), cm(Some("other"), "c1", &[])).await.unwrap_err();
    match err {
        StoreError::ValidationFailed { errors, .. } => assert_eq!(errors[0].field, "metadata.namespace"),
        other => panic!("unexpected {other}"),
    }

    let err = s.create(&ns("default"), cm(None, "a/b", &[])).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidName { .. }), "{err}");

    let err = s.create(&ns("default"), cm(None, "Upper", &[])).await.unwrap_err();
    assert!(err.is_invalid(), "{err}");
    assert!(s.list(&ns("default"), &ListOptions::default()).await.unwrap().items.is_empty());
}

#[tokio::test]
async fn generate_name_appends_suffix() {
    let s = store(mem());
    let mut obj = cm(None, "", &[]);
    obj.metadata.name = None;
    obj.metadata.generate_name = Some("evt-".into());
    let a = s.create(&ns("default"), obj.clone()).await.unwrap();
    let b = s.create(&ns("default"), obj).await.unwrap();
    let (na, nb) = (a.metadata.name.unwrap(), b.metadata.name.unwrap());
    assert!(na.starts_with("evt-") && na.len() == 9, "{na}");
    assert_ne!(na, nb);
}

#[tokio::test]
async fn update_bumps_version_and_keeps_identity() {
    let s = store(mem());
    let created = s.create(&ns("default"), cm(None, "c1", &[])).await.unwrap();
    let updated = s
        .update(&ns("default"), "c1", |mut obj| {
            obj.metadata.uid = None;
            Ok(with_data(obj, "k", "v2"))
        })
        .await
        .unwrap();
    assert!(rv(&updated) > rv(&created));
    assert_eq!(updated.metadata.uid, created.metadata.uid);
    assert_eq!(s.get(&ns("default"), "c1").await.unwrap().data.unwrap()["k"], "v2");

    // An unchanged object still writes.
    let again = s.update(&ns("default"), "c1", Ok).await.unwrap();
    assert!(rv(&again) > rv(&updated));
}

#[tokio::test]
async fn update_rejects_immutable_and_mutator_errors() {
    let be = mem();
    let s = store(be.clone());
    let before = s.create(&ns("default"), cm(None, "c1", &[])).await.unwrap();
    let rev_before = be.revision().await.unwrap();

    let err = s
        .update(&ns("default"), "c1", |mut obj| {
            obj.metadata.uid = Some("other".into());
            Ok(obj)
        })
        .await
        .unwrap_err();
    match err {
        StoreError::ValidationFailed { errors, .. } => {
            assert_eq!(errors, vec![FieldError::immutable("metadata.uid")]);
        }
        other => panic!("unexpected {other}"),
    }
    // Nothing was written.
    assert_eq!(s.get(&ns("default"), "c1").await.unwrap(), before);
    assert_eq!(be.revision().await.unwrap(), rev_before);

    let err = s
        .update(&ns("default"), "c1", |_| Err(StoreError::BackendUnavailable("nope".into())))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::BackendUnavailable(_)));

    let err = s.update(&ns("default"), "missing", Ok).await.unwrap_err();
    assert!(err.is_not_found());
}

/// Sneaks a competing write in before the next `races` updates.
struct Racing {
    inner: MemoryBackend,
    races: AtomicUsize,
    updates: AtomicUsize,
}

#[async_trait]
impl Backend for Racing {
    async fn create(&self, key: &str, value: Bytes, ttl: u64) -> BackendResult<u64> { self.inner.create(key, value, ttl).await }
    async fn get(&self, key: &str) -> BackendResult<KeyValue> { self.inner.get(key).await }
    async fn update(&self, key: &str, expected: u64, value: Bytes, ttl: u64) -> BackendResult<u64> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if self.races.load(Ordering::SeqCst) > 0 {
            self.races.fetch_sub(1, Ordering::SeqCst);
            let cur = self.inner.get(key).await?;
            self.inner.update(key, cur.revision, cur.value, 0).await?;
        }
        self.inner.update(key, expected, value, ttl).await
    }
    async fn delete(&self, key: &str, expected: Option<u64>) -> BackendResult<KeyValue> { self.inner.delete(key, expected).await }
    async fn list(&self, prefix: &str) -> BackendResult<(Vec<KeyValue>, u64)> { self.inner.list(prefix).await }
    async fn watch(&self, prefix: &str, from: u64) -> BackendResult<BackendWatchStream> { self.inner.watch(prefix, from).await }
    async fn revision(&self) -> BackendResult<u64> { self.inner.revision().await }
}

fn racing(races: usize) -> Arc<Racing> {
    Arc::new(Racing { inner: MemoryBackend::with_history(128), races: AtomicUsize::new(races), updates: AtomicUsize::new(0) })
}

#[tokio::test]
async fn update_retries_lost_races() {
    let be = racing(0);
    let s = Store::builder("configmaps", ObjectMetaStrategy::namespaced(), StoreOptions::new(be.clone()).with_update_retries(3))
        .build();
    s.create(&ns("default"), cm(None, "c1", &[])).await.unwrap();

    be.races.store(2, Ordering::SeqCst);
    let mut calls = 0;
    let out = s
        .update(&ns("default"), "c1", |obj| {
            calls += 1;
            Ok(with_data(obj, "n", &calls.to_string()))
        })
        .await
        .unwrap();
    assert_eq!(calls, 3);
    assert_eq!(out.data.unwrap()["n"], "3");

    be.races.store(100, Ordering::SeqCst);
    be.updates.store(0, Ordering::SeqCst);
    let err = s.update(&ns("default"), "c1", Ok).await.unwrap_err();
    assert!(err.is_conflict(), "{err}");
    assert_eq!(be.updates.load(Ordering::SeqCst), 4);
}

/// Writes fail as if the backend were down; reads pass through.
struct Down {
    inner: MemoryBackend,
    updates: AtomicUsize,
    deletes: AtomicUsize,
}

#[async_trait]
impl Backend for Down {
    async fn create(&self, key: &str, value: Bytes, ttl: u64) -> BackendResult<u64> { self.inner.create(key, value, ttl).await }
    async fn get(&self, key: &str) -> BackendResult<KeyValue> { self.inner.get(key).await }
    async fn update(&self, _key: &str, _expected: u64, _value: Bytes, _ttl: u64) -> BackendResult<u64> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Err(BackendError::Unavailable("disk on fire".into()))
    }
    async fn delete(&self, _key: &str, _expected: Option<u64>) -> BackendResult<KeyValue> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Err(BackendError::Unavailable("disk on fire".into()))
    }
    async fn list(&self, prefix: &str) -> BackendResult<(Vec<KeyValue>, u64)> { self.inner.list(prefix).await }
    async fn watch(&self, prefix: &str, from: u64) -> BackendResult<BackendWatchStream> { self.inner.watch(prefix, from).await }
    async fn revision(&self) -> BackendResult<u64> { self.inner.revision().await }
}

#[tokio::test]
async fn unavailable_backend_is_surfaced_without_retry() {
    let be = Arc::new(Down { inner: MemoryBackend::with_history(128), updates: AtomicUsize::new(0), deletes: AtomicUsize::new(0) });
    let s = Store::builder("configmaps", ObjectMetaStrategy::namespaced(), StoreOptions::new(be.clone()).with_update_retries(5))
        .build();
    s.create(&ns("default"), cm(None, "c1", &[])).await.unwrap();

    let err = s.update(&ns("default"), "c1", Ok).await.unwrap_err();
    assert!(matches!(err, StoreError::BackendUnavailable(_)), "{err}");
    assert_eq!(be.updates.load(Ordering::SeqCst), 1);

    let err = s.delete(&ns("default"), "c1", &DeleteOptions::default()).await.unwrap_err();
    assert!(matches!(err, StoreError::BackendUnavailable(_)), "{err}");
    assert_eq!(be.deletes.load(Ordering::SeqCst), 1);
    assert!(s.get(&ns("default"), "c1").await.is_ok());
}

struct Upsert;

impl Strategy<ConfigMap> for Upsert {
    fn allow_create_on_update(&self) -> bool { true }
    fn allow_unconditional_update(&self) -> bool { false }
    fn validate(&self, obj: &ConfigMap) -> Vec<FieldError> { kiln_core::validation::validate_object_meta(&obj.metadata, true) }
    fn validate_update(&self, new: &ConfigMap, _old: &ConfigMap) -> Vec<FieldError> { self.validate(new) }
}

#[tokio::test]
async fn replace_is_conditional_on_resource_version() {
    let s = store(mem());
    let created = s.create(&ns("default"), cm(None, "c1", &[])).await.unwrap();

    let fresh = s.replace(&ns("default"), with_data(created.clone(), "k", "1")).await.unwrap();
    assert!(rv(&fresh) > rv(&created));

    // `created` now carries a stale version.
    let err = s.replace(&ns("default"), with_data(created, "k", "2")).await.unwrap_err();
    assert!(err.is_conflict(), "{err}");

    let err = s.replace(&ns("default"), cm(None, "absent", &[])).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn replace_creates_when_allowed() {
    let s = Store::builder("configmaps", Upsert, StoreOptions::new(mem())).build();
    let err = s.replace(&ns("default"), cm(None, "c1", &[])).await.unwrap_err();
    match err {
        StoreError::ValidationFailed { errors, .. } => assert_eq!(errors[0].kind, FieldErrorKind::Required),
        other => panic!("unexpected {other}"),
    }

    let mut obj = cm(None, "c1", &[]);
    obj.metadata.resource_version = Some("0".into());
    let err = s.replace(&ns("default"), obj).await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

#[tokio::test]
async fn replace_without_version_creates_missing_object() {
    struct Loose;
    impl Strategy<ConfigMap> for Loose {
        fn allow_create_on_update(&self) -> bool { true }
        fn validate(&self, _: &ConfigMap) -> Vec<FieldError> { Vec::new() }
        fn validate_update(&self, _: &ConfigMap, _: &ConfigMap) -> Vec<FieldError> { Vec::new() }
    }
    let s = Store::builder("configmaps", Loose, StoreOptions::new(mem())).build();
    let created = s.replace(&ns("default"), cm(None, "c1", &[])).await.unwrap();
    assert!(created.metadata.uid.is_some());
    let replaced = s.replace(&ns("default"), with_data(cm(None, "c1", &[]), "k", "v")).await.unwrap();
    assert_eq!(replaced.metadata.uid, created.metadata.uid);
    assert!(rv(&replaced) > rv(&created));
}

#[tokio::test]
async fn delete_honours_preconditions() {
    let s = store(mem());
    let created = s.create(&ns("default"), cm(None, "c1", &[])).await.unwrap();

    let err = s.delete(&ns("default"), "c1", &DeleteOptions::default().with_uid("nope")).await.unwrap_err();
    assert!(err.is_conflict(), "{err}");
    let err = s
        .delete(&ns("default"), "c1", &DeleteOptions::default().with_resource_version("999"))
        .await
        .unwrap_err();
    assert!(err.is_conflict(), "{err}");

    let opts = DeleteOptions::default()
        .with_uid(created.metadata.uid.clone().unwrap())
        .with_resource_version(created.metadata.resource_version.clone().unwrap());
    let deleted = s.delete(&ns("default"), "c1", &opts).await.unwrap();
    assert_eq!(deleted.metadata.name.as_deref(), Some("c1"));
    assert!(s.get(&ns("default"), "c1").await.unwrap_err().is_not_found());
    assert!(s.delete(&ns("default"), "c1", &DeleteOptions::default()).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn list_scopes_and_filters() {
    let s = store(mem());
    s.create(&ns("a"), cm(None, "x", &[("app", "web")])).await.unwrap();
    s.create(&ns("a"), cm(None, "y", &[("app", "db")])).await.unwrap();
    let last = s.create(&ns("ab"), cm(None, "z", &[("app", "web")])).await.unwrap();

    let names = |l: &kiln_store::List<ConfigMap>| -> Vec<String> {
        l.items.iter().map(|o| o.metadata.name.clone().unwrap()).collect()
    };

    let in_a = s.list(&ns("a"), &ListOptions::default()).await.unwrap();
    assert_eq!(names(&in_a), vec!["x", "y"]);
    assert_eq!(in_a.metadata.resource_version.as_deref(), Some(rv(&last).to_string().as_str()));

    let all = s.list(&RequestContext::cluster(), &ListOptions::default()).await.unwrap();
    assert_eq!(all.items.len(), 3);

    let web = ListOptions::default().with_labels(LabelSelector::parse("app=web").unwrap());
    assert_eq!(names(&s.list(&RequestContext::cluster(), &web).await.unwrap()), vec!["x", "z"]);

    let one = ListOptions::default().with_fields(FieldSelector::one_term("metadata.name", "y"));
    assert_eq!(names(&s.list(&ns("a"), &one).await.unwrap()), vec!["y"]);
    assert!(s.list(&ns("ab"), &one).await.unwrap().items.is_empty());

    let unknown = ListOptions::parse("", "spec.nodeName=n1").unwrap();
    assert!(s.list(&ns("a"), &unknown).await.unwrap().items.is_empty());

    assert!(matches!(ListOptions::parse("app in (web", ""), Err(StoreError::InvalidSelector(_))));
}

#[tokio::test(start_paused = true)]
async fn ttl_expires_objects() {
    let s = Store::builder("configmaps", ObjectMetaStrategy::namespaced(), StoreOptions::new(mem()))
        .with_ttl(FixedTtl(5))
        .build();
    s.create(&ns("default"), cm(None, "short", &[])).await.unwrap();

    tokio::time::advance(Duration::from_secs(4)).await;
    assert!(s.get(&ns("default"), "short").await.is_ok());
    assert_eq!(s.list(&ns("default"), &ListOptions::default()).await.unwrap().items.len(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(s.get(&ns("default"), "short").await.unwrap_err().is_not_found());
    assert!(s.list(&ns("default"), &ListOptions::default()).await.unwrap().items.is_empty());
}

#[tokio::test(start_paused = true)]
async fn update_refreshes_ttl() {
    let s = Store::builder("configmaps", ObjectMetaStrategy::namespaced(), StoreOptions::new(mem()))
        .with_ttl(FixedTtl(5))
        .build();
    s.create(&ns("default"), cm(None, "c1", &[])).await.unwrap();
    tokio::time::advance(Duration::from_secs(4)).await;
    s.update(&ns("default"), "c1", Ok).await.unwrap();
    tokio::time::advance(Duration::from_secs(4)).await;
    assert!(s.get(&ns("default"), "c1").await.is_ok());
}
