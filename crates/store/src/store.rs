//! The generic resource store.
//!
//! `Store<K>` owns no state besides its configuration; every consistency
//! guarantee comes from the backend's compare-and-swap on key revisions.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::SubsecRound;
use futures::{stream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::List;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kiln_core::validation::validate_object_meta_update;
use kiln_core::{
    parse_resource_version, FieldError, FieldSelector, ItemError, LabelSelector, RequestContext, StoreError,
    StoreResult,
};

use crate::backend::{Backend, BackendError};
use crate::codec::{Codec, JsonCodec};
use crate::factory::ObjectFactory;
use crate::key::{ClusterKeys, KeyScheme, NamespacedKeys};
use crate::matcher::{default_object_fields, FieldsFn, SelectionPredicate};
use crate::options::StoreOptions;
use crate::strategy::Strategy;
use crate::ttl::{ExpiryPolicy, NoExpiry};
use crate::watch::{spawn_pump, PumpConfig, Watcher};
use crate::Object;

const GENERATED_SUFFIX_LEN: usize = 5;
const MAX_GENERATED_BASE_LEN: usize = 58;

/// Selectors plus the revision a watch resumes after.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub label_selector: LabelSelector,
    pub field_selector: FieldSelector,
    /// Watch only: deliver changes strictly after this revision. `None` or
    /// `Some(0)` starts with the current items as `Added`.
    pub resource_version: Option<u64>,
}

impl ListOptions {
    pub fn parse(labels: &str, fields: &str) -> StoreResult<Self> {
        Ok(Self {
            label_selector: LabelSelector::parse(labels)?,
            field_selector: FieldSelector::parse(fields)?,
            resource_version: None,
        })
    }

    pub fn with_labels(mut self, sel: LabelSelector) -> Self {
        self.label_selector = sel;
        self
    }

    pub fn with_fields(mut self, sel: FieldSelector) -> Self {
        self.field_selector = sel;
        self
    }

    pub fn with_resource_version(mut self, rv: u64) -> Self {
        self.resource_version = Some(rv);
        self
    }
}

/// Conditions a delete must satisfy against the stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub uid: Option<String>,
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub preconditions: Preconditions,
}

impl DeleteOptions {
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.preconditions.uid = Some(uid.into());
        self
    }

    pub fn with_resource_version(mut self, rv: impl Into<String>) -> Self {
        self.preconditions.resource_version = Some(rv.into());
        self
    }
}

struct Inner<K: Object> {
    resource: String,
    factory: ObjectFactory<K>,
    keys: Arc<dyn KeyScheme>,
    fields: FieldsFn<K>,
    ttl: Arc<dyn ExpiryPolicy<K>>,
    strategy: Arc<dyn Strategy<K>>,
    codec: Arc<dyn Codec<K>>,
    backend: Arc<dyn Backend>,
    delete_collection_workers: usize,
    update_retries: usize,
    watch_channel_capacity: usize,
}

pub struct Store<K: Object> {
    inner: Arc<Inner<K>>,
}

impl<K: Object> Clone for Store<K> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

pub struct StoreBuilder<K: Object> {
    resource: String,
    strategy: Arc<dyn Strategy<K>>,
    opts: StoreOptions,
    factory: ObjectFactory<K>,
    keys: Option<Arc<dyn KeyScheme>>,
    fields: Option<FieldsFn<K>>,
    ttl: Arc<dyn ExpiryPolicy<K>>,
    codec: Arc<dyn Codec<K>>,
}

impl<K: Object> StoreBuilder<K> {
    pub fn with_factory(mut self, factory: ObjectFactory<K>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_keys(mut self, keys: impl KeyScheme + 'static) -> Self {
        self.keys = Some(Arc::new(keys));
        self
    }

    pub fn with_fields<F>(mut self, f: F) -> Self
    where
        F: Fn(&K) -> kiln_core::Fields + Send + Sync + 'static,
    {
        self.fields = Some(Arc::new(f));
        self
    }

    pub fn with_ttl(mut self, ttl: impl ExpiryPolicy<K> + 'static) -> Self {
        self.ttl = Arc::new(ttl);
        self
    }

    pub fn with_codec(mut self, codec: impl Codec<K> + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn build(self) -> Store<K> {
        let namespaced = self.strategy.namespace_scoped();
        let keys = self.keys.unwrap_or_else(|| {
            let prefix = format!("/{}", self.resource);
            if namespaced {
                Arc::new(NamespacedKeys::new(&prefix)) as Arc<dyn KeyScheme>
            } else {
                Arc::new(ClusterKeys::new(&prefix))
            }
        });
        let fields: FieldsFn<K> = match self.fields {
            Some(f) => f,
            None => Arc::new(move |obj: &K| default_object_fields(obj.metadata(), namespaced)),
        };
        debug!(resource = %self.resource, namespaced, opts = ?self.opts, "store: built");
        Store {
            inner: Arc::new(Inner {
                resource: self.resource,
                factory: self.factory,
                keys,
                fields,
                ttl: self.ttl,
                strategy: self.strategy,
                codec: self.codec,
                backend: self.opts.backend,
                delete_collection_workers: self.opts.delete_collection_workers.max(1),
                update_retries: self.opts.update_retries,
                watch_channel_capacity: self.opts.watch_channel_capacity.max(1),
            }),
        }
    }
}

fn object_name<K: Object>(obj: &K) -> String { obj.metadata().name.clone().unwrap_or_default() }

fn generate_name(base: &str) -> String {
    let base: String = base.chars().take(MAX_GENERATED_BASE_LEN).collect();
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(GENERATED_SUFFIX_LEN).collect();
    format!("{base}{suffix}")
}

impl<K: Object> Store<K> {
    /// Start configuring a kind. Keys default to `/<resource>/...` scoped per
    /// the strategy, fields to name/namespace, TTL to none, codec to JSON.
    pub fn builder(resource: &str, strategy: impl Strategy<K> + 'static, opts: StoreOptions) -> StoreBuilder<K> {
        StoreBuilder {
            resource: resource.to_string(),
            strategy: Arc::new(strategy),
            opts,
            factory: ObjectFactory::default(),
            keys: None,
            fields: None,
            ttl: Arc::new(NoExpiry),
            codec: Arc::new(JsonCodec),
        }
    }

    pub fn resource(&self) -> &str { &self.inner.resource }
    pub fn backend(&self) -> &Arc<dyn Backend> { &self.inner.backend }
    pub fn key_scheme(&self) -> &dyn KeyScheme { self.inner.keys.as_ref() }

    pub fn predicate(&self, opts: &ListOptions) -> SelectionPredicate<K> {
        SelectionPredicate::new(opts.label_selector.clone(), opts.field_selector.clone(), Arc::clone(&self.inner.fields))
    }

    async fn instrument<T, F>(&self, op: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let started = Instant::now();
        metrics::counter!("store_requests_total", 1u64, "resource" => self.inner.resource.clone(), "op" => op);
        let res = fut.await;
        let took_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("store_request_ms", took_ms, "op" => op);
        if let Err(e) = &res {
            metrics::counter!(
                "store_errors_total", 1u64,
                "resource" => self.inner.resource.clone(), "op" => op, "reason" => e.reason()
            );
            debug!(resource = %self.inner.resource, op, took_ms, error = %e, "store: request failed");
        }
        res
    }

    fn err(&self, e: BackendError, name: &str) -> StoreError { e.into_store_error(&self.inner.resource, name) }

    fn decode(&self, data: &[u8], revision: u64) -> StoreResult<K> {
        let mut obj = self.inner.factory.new_object();
        self.inner.codec.decode_into(data, &mut obj)?;
        obj.metadata_mut().resource_version = Some(revision.to_string());
        Ok(obj)
    }

    /// Encode without the version token; the backend revision is the token.
    fn encode(&self, obj: &mut K) -> StoreResult<Bytes> {
        let rv = obj.metadata_mut().resource_version.take();
        let out = self.inner.codec.encode(obj);
        obj.metadata_mut().resource_version = rv;
        out
    }

    fn item_ctx(&self, ctx: &RequestContext, obj: &K) -> RequestContext {
        match obj.metadata().namespace.as_deref().filter(|ns| !ns.is_empty()) {
            Some(ns) if self.inner.strategy.namespace_scoped() => RequestContext::namespaced(ns),
            _ => ctx.clone(),
        }
    }

    fn before_create(&self, ctx: &RequestContext, obj: &mut K) -> StoreResult<()> {
        let resource = &self.inner.resource;
        let namespaced = self.inner.strategy.namespace_scoped();
        let meta = obj.metadata_mut();
        if namespaced {
            let own = meta.namespace.clone().filter(|ns| !ns.is_empty());
            match (ctx.namespace(), own) {
                (Some(req), Some(own)) if req != own => {
                    let name = meta.name.clone().unwrap_or_default();
                    let err = FieldError::invalid("metadata.namespace", own, "does not match the namespace sent on the request");
                    return Err(StoreError::invalid(resource, &name, vec![err]));
                }
                (Some(req), None) => meta.namespace = Some(req.to_string()),
                _ => {}
            }
        } else {
            meta.namespace = None;
        }
        if meta.name.as_deref().map_or(true, str::is_empty) {
            if let Some(base) = meta.generate_name.as_deref().filter(|g| !g.is_empty()) {
                meta.name = Some(generate_name(base));
            }
        }
        Ok(())
    }

    fn stamp_system_fields(obj: &mut K) {
        let meta = obj.metadata_mut();
        meta.uid = Some(Uuid::new_v4().to_string());
        // Whole seconds, the precision the timestamp serializes with.
        meta.creation_timestamp = Some(Time(chrono::Utc::now().trunc_subsecs(0)));
        meta.deletion_timestamp = None;
        meta.resource_version = None;
    }

    fn before_update(&self, obj: &mut K, old: &K) -> StoreResult<()> {
        let strategy = &self.inner.strategy;
        {
            let old_meta = old.metadata();
            let meta = obj.metadata_mut();
            if strategy.namespace_scoped() {
                if meta.namespace.as_deref().map_or(true, str::is_empty) {
                    meta.namespace = old_meta.namespace.clone();
                }
            } else {
                meta.namespace = None;
            }
            if meta.name.as_deref().map_or(true, str::is_empty) {
                meta.name = old_meta.name.clone();
            }
            if meta.uid.as_deref().map_or(true, str::is_empty) {
                meta.uid = old_meta.uid.clone();
            }
            if meta.creation_timestamp.is_none() {
                meta.creation_timestamp = old_meta.creation_timestamp.clone();
            }
        }
        strategy.prepare_for_update(obj, old);
        let mut errs = validate_object_meta_update(obj.metadata(), old.metadata());
        errs.extend(strategy.validate_update(obj, old));
        if !errs.is_empty() {
            return Err(StoreError::invalid(&self.inner.resource, &object_name(old), errs));
        }
        Ok(())
    }

    /// Insert a new object. Fails with `AlreadyExists` if the name is taken.
    pub async fn create(&self, ctx: &RequestContext, obj: K) -> StoreResult<K> {
        self.instrument("create", self.create_inner(ctx, obj)).await
    }

    async fn create_inner(&self, ctx: &RequestContext, mut obj: K) -> StoreResult<K> {
        self.before_create(ctx, &mut obj)?;
        let name = object_name(&obj);
        let key = self.inner.keys.item_key(&self.item_ctx(ctx, &obj), &name)?;
        debug!(resource = %self.inner.resource, key = %key, "store: create start");

        self.inner.strategy.prepare_for_create(&mut obj);
        Self::stamp_system_fields(&mut obj);
        let errs = self.inner.strategy.validate(&obj);
        if !errs.is_empty() {
            return Err(StoreError::invalid(&self.inner.resource, &name, errs));
        }
        let ttl = self.inner.ttl.ttl(&obj, 0, false)?;
        let value = self.encode(&mut obj)?;
        let rev = self.inner.backend.create(&key, value, ttl).await.map_err(|e| self.err(e, &name))?;
        obj.metadata_mut().resource_version = Some(rev.to_string());
        debug!(resource = %self.inner.resource, key = %key, rev, ttl, "store: create done");
        Ok(obj)
    }

    pub async fn get(&self, ctx: &RequestContext, name: &str) -> StoreResult<K> {
        self.instrument("get", async {
            let key = self.inner.keys.item_key(ctx, name)?;
            let kv = self.inner.backend.get(&key).await.map_err(|e| self.err(e, name))?;
            self.decode(&kv.value, kv.revision)
        })
        .await
    }

    /// Read-modify-write. `mutate` gets the current object and returns the
    /// desired one; its errors end the update. Lost races are retried up to
    /// `update_retries` times before surfacing `Conflict`.
    pub async fn update<F>(&self, ctx: &RequestContext, name: &str, mutate: F) -> StoreResult<K>
    where
        F: FnMut(K) -> StoreResult<K> + Send,
    {
        self.instrument("update", self.update_inner(ctx, name, mutate)).await
    }

    async fn update_inner<F>(&self, ctx: &RequestContext, name: &str, mut mutate: F) -> StoreResult<K>
    where
        F: FnMut(K) -> StoreResult<K> + Send,
    {
        let key = self.inner.keys.item_key(ctx, name)?;
        let mut attempt = 0usize;
        loop {
            let current = self.inner.backend.get(&key).await.map_err(|e| self.err(e, name))?;
            let old = self.decode(&current.value, current.revision)?;
            let mut obj = mutate(old.clone())?;
            self.before_update(&mut obj, &old)?;
            let ttl = self.inner.ttl.ttl(&obj, current.ttl, true)?;
            let value = self.encode(&mut obj)?;
            match self.inner.backend.update(&key, current.revision, value, ttl).await {
                Ok(rev) => {
                    obj.metadata_mut().resource_version = Some(rev.to_string());
                    debug!(resource = %self.inner.resource, key = %key, rev, attempt, "store: update done");
                    return Ok(obj);
                }
                Err(BackendError::Conflict { expected, actual }) if attempt < self.inner.update_retries => {
                    attempt += 1;
                    metrics::counter!("store_update_conflicts_total", 1u64, "resource" => self.inner.resource.clone());
                    debug!(resource = %self.inner.resource, key = %key, expected, actual, attempt, "store: update conflict, retrying");
                }
                Err(e) => {
                    if matches!(e, BackendError::Conflict { .. }) {
                        warn!(resource = %self.inner.resource, key = %key, attempt, "store: update retries exhausted");
                    }
                    return Err(self.err(e, name));
                }
            }
        }
    }

    /// Replace the whole object (PUT). A set `resourceVersion` must match the
    /// stored one. With `allow_create_on_update` a missing object is created.
    pub async fn replace(&self, ctx: &RequestContext, obj: K) -> StoreResult<K> {
        self.instrument("replace", self.replace_inner(ctx, obj)).await
    }

    async fn replace_inner(&self, ctx: &RequestContext, obj: K) -> StoreResult<K> {
        let resource = &self.inner.resource;
        let name = object_name(&obj);
        let expected = parse_resource_version(obj.metadata().resource_version.as_deref().unwrap_or(""))?;
        let strategy = &self.inner.strategy;
        if expected.is_none() && !strategy.allow_unconditional_update() {
            let err = FieldError::required("metadata.resourceVersion", "must be specified for an update");
            return Err(StoreError::invalid(resource, &name, vec![err]));
        }

        let put = |current: K| -> StoreResult<K> {
            if let Some(exp) = expected {
                let actual = current.metadata().resource_version.clone().unwrap_or_default();
                if actual != exp.to_string() {
                    return Err(StoreError::conflict(resource, &name, crate::backend::CONFLICT_MESSAGE));
                }
            }
            Ok(obj.clone())
        };
        match self.update_inner(ctx, &name, put).await {
            Err(e) if e.is_not_found() && expected.is_none() && strategy.allow_create_on_update() => {}
            other => return other,
        }

        debug!(resource = %resource, name = %name, "store: replace creating missing object");
        let mut fresh = obj.clone();
        fresh.metadata_mut().resource_version = None;
        match self.create_inner(ctx, fresh).await {
            Err(e) if e.is_already_exists() => self.update_inner(ctx, &name, |_| Ok(obj.clone())).await,
            other => other,
        }
    }

    /// Delete and return the last stored state.
    pub async fn delete(&self, ctx: &RequestContext, name: &str, opts: &DeleteOptions) -> StoreResult<K> {
        self.instrument("delete", self.delete_inner(ctx, name, opts)).await
    }

    async fn delete_inner(&self, ctx: &RequestContext, name: &str, opts: &DeleteOptions) -> StoreResult<K> {
        let resource = &self.inner.resource;
        let key = self.inner.keys.item_key(ctx, name)?;
        let pre = &opts.preconditions;
        let want_rv = parse_resource_version(pre.resource_version.as_deref().unwrap_or(""))?;
        let mut attempt = 0usize;
        loop {
            let current = self.inner.backend.get(&key).await.map_err(|e| self.err(e, name))?;
            let obj = self.decode(&current.value, current.revision)?;
            if let Some(uid) = pre.uid.as_deref() {
                let actual = obj.metadata().uid.as_deref().unwrap_or("");
                if actual != uid {
                    let msg = format!("Precondition failed: UID in precondition: {uid}, UID in object meta: {actual}");
                    return Err(StoreError::conflict(resource, name, msg));
                }
            }
            if let Some(rv) = want_rv {
                if rv != current.revision {
                    let msg = format!(
                        "Precondition failed: ResourceVersion in precondition: {rv}, ResourceVersion in object meta: {}",
                        current.revision
                    );
                    return Err(StoreError::conflict(resource, name, msg));
                }
            }
            let errs = self.inner.strategy.validate_delete(&obj);
            if !errs.is_empty() {
                return Err(StoreError::invalid(resource, name, errs));
            }
            match self.inner.backend.delete(&key, Some(current.revision)).await {
                Ok(_) => {
                    debug!(resource = %resource, key = %key, rev = current.revision, "store: delete done");
                    return Ok(obj);
                }
                Err(BackendError::Conflict { .. }) if want_rv.is_none() && attempt < self.inner.update_retries => {
                    attempt += 1;
                    debug!(resource = %resource, key = %key, attempt, "store: delete raced a write, retrying");
                }
                Err(e) => return Err(self.err(e, name)),
            }
        }
    }

    /// Matching items under the request's root, with the snapshot revision
    /// in `metadata.resourceVersion`.
    pub async fn list(&self, ctx: &RequestContext, opts: &ListOptions) -> StoreResult<List<K>> {
        self.instrument("list", async {
            let (list, _) = self.list_inner(ctx, opts).await?;
            Ok(list)
        })
        .await
    }

    async fn list_inner(&self, ctx: &RequestContext, opts: &ListOptions) -> StoreResult<(List<K>, u64)> {
        let pred = self.predicate(opts);
        let mut out = self.inner.factory.new_list();
        let rev = match pred.matches_single().and_then(|name| self.inner.keys.item_key(ctx, name).ok()) {
            Some(key) => {
                let rev = self.inner.backend.revision().await.map_err(|e| self.err(e, ""))?;
                match self.inner.backend.get(&key).await {
                    Ok(kv) => {
                        let obj = self.decode(&kv.value, kv.revision)?;
                        if pred.matches(&obj) {
                            out.items.push(obj);
                        }
                        rev.max(kv.revision)
                    }
                    Err(BackendError::NotFound) => rev,
                    Err(e) => return Err(self.err(e, "")),
                }
            }
            None => {
                let prefix = self.inner.keys.list_prefix(ctx);
                let (kvs, rev) = self.inner.backend.list(&prefix).await.map_err(|e| self.err(e, ""))?;
                for kv in kvs {
                    let obj = self.decode(&kv.value, kv.revision)?;
                    if pred.matches(&obj) {
                        out.items.push(obj);
                    }
                }
                rev
            }
        };
        out.metadata.resource_version = Some(rev.to_string());
        debug!(resource = %self.inner.resource, items = out.items.len(), rev, "store: list done");
        Ok((out, rev))
    }

    /// Follow changes of matching items. See [`ListOptions::resource_version`].
    pub async fn watch(&self, ctx: &RequestContext, opts: &ListOptions) -> StoreResult<Watcher<K>> {
        self.instrument("watch", async {
            let pred = self.predicate(opts);
            let exact_key = pred.matches_single().and_then(|name| self.inner.keys.item_key(ctx, name).ok());
            let prefix = exact_key.clone().unwrap_or_else(|| self.inner.keys.list_prefix(ctx));
            let (initial, from) = match opts.resource_version {
                None | Some(0) => {
                    let (list, rev) = self.list_inner(ctx, opts).await?;
                    (list.items, rev)
                }
                Some(rv) => (Vec::new(), rv),
            };
            let events = self.inner.backend.watch(&prefix, from).await.map_err(|e| self.err(e, ""))?;
            info!(resource = %self.inner.resource, prefix = %prefix, from, initial = initial.len(), "store: watch start");

            let cfg = PumpConfig {
                resource: self.inner.resource.clone(),
                pred,
                exact_key,
                capacity: self.inner.watch_channel_capacity,
            };
            let this = self.clone();
            Ok(spawn_pump(cfg, initial, events, move |data: &[u8], rev: u64| this.decode(data, rev)))
        })
        .await
    }

    /// Delete every matching item with bounded concurrency. Items deleted
    /// concurrently by someone else are skipped; other failures are
    /// collected into `Aggregate` after all deletes ran.
    pub async fn delete_collection(&self, ctx: &RequestContext, opts: &ListOptions) -> StoreResult<List<K>> {
        self.instrument("delete_collection", async {
            let (list, _) = self.list_inner(ctx, opts).await?;
            let workers = self.inner.delete_collection_workers;
            let total = list.items.len();
            let no_preconditions = DeleteOptions::default();
            let results: Vec<(String, StoreResult<K>)> = stream::iter(list.items.into_iter().map(|item| {
                let name = object_name(&item);
                let item_ctx = self.item_ctx(ctx, &item);
                let del = &no_preconditions;
                async move {
                    let res = self.delete_inner(&item_ctx, &name, del).await;
                    (name, res)
                }
            }))
            .buffered(workers)
            .collect()
            .await;

            let mut out = self.inner.factory.new_list();
            let mut failures = Vec::new();
            for (name, res) in results {
                match res {
                    Ok(obj) => out.items.push(obj),
                    Err(e) if e.is_not_found() => {}
                    Err(error) => failures.push(ItemError { name, error }),
                }
            }
            if !failures.is_empty() {
                warn!(resource = %self.inner.resource, total, failed = failures.len(), "store: delete collection partial");
                return Err(StoreError::Aggregate { deleted: out.items.len(), failures });
            }
            info!(resource = %self.inner.resource, deleted = out.items.len(), workers, "store: delete collection done");
            Ok(out)
        })
        .await
    }
}
