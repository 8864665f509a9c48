#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kiln_core::{EventType, FieldSelector, LabelSelector, RequestContext, WatchEvent};
use kiln_store::{
    Backend, DeleteOptions, FixedTtl, ListOptions, MemoryBackend, ObjectMetaStrategy, Store, StoreOptions, Watcher,
};

fn cm(name: &str, labels: &[(&str, &str)]) -> ConfigMap {
    let mut obj = ConfigMap::default();
    obj.metadata.name = Some(name.to_string());
    if !labels.is_empty() {
        obj.metadata.labels = Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
    }
    obj
}

fn store(backend: Arc<dyn Backend>) -> Store<ConfigMap> {
    Store::builder("configmaps", ObjectMetaStrategy::namespaced(), StoreOptions::new(backend)).build()
}

fn ctx() -> RequestContext { RequestContext::namespaced("default") }

async fn next(w: &mut Watcher<ConfigMap>) -> WatchEvent<ConfigMap> {
    tokio::time::timeout(Duration::from_secs(60), w.next())
        .await
        .expect("watch timed out")
        .expect("watch closed")
        .expect("watch error")
}

fn summary(ev: &WatchEvent<ConfigMap>) -> (EventType, String, String) {
    let meta = &ev.object().metadata;
    (ev.event_type(), meta.name.clone().unwrap_or_default(), meta.resource_version.clone().unwrap_or_default())
}

fn relabel(app: &'static str) -> impl FnMut(ConfigMap) -> kiln_core::StoreResult<ConfigMap> + Send {
    move |mut obj| {
        obj.metadata.labels = Some([("app".to_string(), app.to_string())].into_iter().collect());
        Ok(obj)
    }
}

#[tokio::test]
async fn watch_from_version_delivers_later_changes() {
    let s = store(Arc::new(MemoryBackend::with_history(64)));
    s.create(&ctx(), cm("a", &[])).await.unwrap();
    let list = s.list(&ctx(), &ListOptions::default()).await.unwrap();
    let from: u64 = list.metadata.resource_version.unwrap().parse().unwrap();

    let mut w = s.watch(&ctx(), &ListOptions::default().with_resource_version(from)).await.unwrap();
    s.create(&ctx(), cm("b", &[])).await.unwrap();
    s.update(&ctx(), "b", relabel("web")).await.unwrap();
    s.delete(&ctx(), "b", &DeleteOptions::default()).await.unwrap();

    assert_eq!(summary(&next(&mut w).await), (EventType::Added, "b".into(), "2".into()));
    assert_eq!(summary(&next(&mut w).await), (EventType::Modified, "b".into(), "3".into()));
    assert_eq!(summary(&next(&mut w).await), (EventType::Deleted, "b".into(), "4".into()));
}

#[tokio::test]
async fn watch_without_version_starts_with_current_items() {
    let s = store(Arc::new(MemoryBackend::with_history(64)));
    s.create(&ctx(), cm("a", &[])).await.unwrap();
    s.create(&ctx(), cm("b", &[])).await.unwrap();
    s.create(&RequestContext::namespaced("other"), cm("c", &[])).await.unwrap();

    let mut w = s.watch(&ctx(), &ListOptions::default()).await.unwrap();
    assert_eq!(summary(&next(&mut w).await), (EventType::Added, "a".into(), "1".into()));
    assert_eq!(summary(&next(&mut w).await), (EventType::Added, "b".into(), "2".into()));

    s.create(&ctx(), cm("d", &[])).await.unwrap();
    assert_eq!(summary(&next(&mut w).await), (EventType::Added, "d".into(), "4".into()));
}

#[tokio::test]
async fn selector_transitions_become_added_and_deleted() {
    let s = store(Arc::new(MemoryBackend::with_history(64)));
    let web = ListOptions::default().with_labels(LabelSelector::parse("app=web").unwrap()).with_resource_version(0);
    let mut w = s.watch(&ctx(), &web).await.unwrap();

    s.create(&ctx(), cm("x", &[("app", "db")])).await.unwrap();
    s.update(&ctx(), "x", relabel("web")).await.unwrap();
    s.update(&ctx(), "x", relabel("db")).await.unwrap();
    s.create(&ctx(), cm("y", &[("app", "web")])).await.unwrap();

    let ev = next(&mut w).await;
    assert_eq!(summary(&ev), (EventType::Added, "x".into(), "2".into()));
    let ev = next(&mut w).await;
    assert_eq!(summary(&ev), (EventType::Deleted, "x".into(), "3".into()));
    // The last matching state is reported.
    assert_eq!(ev.object().metadata.labels.as_ref().unwrap()["app"], "web");
    assert_eq!(summary(&next(&mut w).await), (EventType::Added, "y".into(), "4".into()));
}

#[tokio::test]
async fn single_name_watch_ignores_siblings() {
    let s = store(Arc::new(MemoryBackend::with_history(64)));
    s.create(&ctx(), cm("a", &[])).await.unwrap();
    s.create(&ctx(), cm("ab", &[])).await.unwrap();

    let opts = ListOptions::default().with_fields(FieldSelector::one_term("metadata.name", "a")).with_resource_version(2);
    let mut w = s.watch(&ctx(), &opts).await.unwrap();
    s.update(&ctx(), "ab", relabel("web")).await.unwrap();
    s.update(&ctx(), "a", relabel("web")).await.unwrap();
    assert_eq!(summary(&next(&mut w).await), (EventType::Modified, "a".into(), "4".into()));
}

#[tokio::test]
async fn cancelled_watch_delivers_nothing() {
    let s = store(Arc::new(MemoryBackend::with_history(64)));
    let mut w = s.watch(&ctx(), &ListOptions::default().with_resource_version(0)).await.unwrap();
    s.create(&ctx(), cm("a", &[])).await.unwrap();
    w.cancel();
    assert!(w.is_cancelled());
    s.create(&ctx(), cm("b", &[])).await.unwrap();
    assert!(w.next().await.is_none());
    assert!(w.recv().await.is_none());
}

#[tokio::test]
async fn dropping_watcher_cancels_pump() {
    let s = store(Arc::new(MemoryBackend::with_history(64)));
    let w = s.watch(&ctx(), &ListOptions::default()).await.unwrap();
    let token = w.cancel_token();
    assert!(!token.is_cancelled());
    drop(w);
    assert!(token.is_cancelled());
}

#[tokio::test]
async fn compacted_history_is_gone() {
    let s = store(Arc::new(MemoryBackend::with_history(2)));
    for name in ["a", "b", "c", "d", "e"] {
        s.create(&ctx(), cm(name, &[])).await.unwrap();
    }
    match s.watch(&ctx(), &ListOptions::default().with_resource_version(1)).await {
        Err(e) => assert!(e.is_gone(), "{e}"),
        Ok(_) => panic!("expected Gone"),
    }
    assert!(s.watch(&ctx(), &ListOptions::default()).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn expiry_is_reported_as_deleted() {
    let backend = Arc::new(MemoryBackend::with_history(64));
    let sweeper = backend.spawn_sweeper(Duration::from_secs(1));
    let s = Store::builder("configmaps", ObjectMetaStrategy::namespaced(), StoreOptions::new(backend.clone()))
        .with_ttl(FixedTtl(5))
        .build();
    s.create(&ctx(), cm("short", &[])).await.unwrap();

    let mut w = s.watch(&ctx(), &ListOptions::default().with_resource_version(1)).await.unwrap();
    let ev = next(&mut w).await;
    assert_eq!(summary(&ev), (EventType::Deleted, "short".into(), "2".into()));
    sweeper.abort();
}
