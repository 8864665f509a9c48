//! Storage key layout.
//!
//! Namespaced kinds: `/<prefix>/<namespace>/<name>`, rooted at
//! `/<prefix>/<namespace>` (or `/<prefix>` for cluster-wide requests).
//! Cluster kinds: `/<prefix>/<name>`.

use kiln_core::validation::path_segment_violation;
use kiln_core::{RequestContext, StoreError, StoreResult};

pub trait KeyScheme: Send + Sync {
    /// Root under which every item visible to `ctx` lives.
    fn root_key(&self, ctx: &RequestContext) -> String;

    fn item_key(&self, ctx: &RequestContext, name: &str) -> StoreResult<String>;

    /// Prefix scanned by list and watch. The trailing `/` keeps namespace
    /// `a` from seeing items of `ab`.
    fn list_prefix(&self, ctx: &RequestContext) -> String { format!("{}/", self.root_key(ctx)) }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    format!("/{trimmed}")
}

fn check_segment(name: &str) -> StoreResult<()> {
    match path_segment_violation(name) {
        Some(reason) => Err(StoreError::invalid_name(name, reason)),
        None => Ok(()),
    }
}

#[derive(Debug, Clone)]
pub struct NamespacedKeys {
    prefix: String,
}

impl NamespacedKeys {
    pub fn new(prefix: &str) -> Self { Self { prefix: normalize_prefix(prefix) } }
    pub fn prefix(&self) -> &str { &self.prefix }
}

impl KeyScheme for NamespacedKeys {
    fn root_key(&self, ctx: &RequestContext) -> String {
        match ctx.namespace() {
            Some(ns) => format!("{}/{}", self.prefix, ns),
            None => self.prefix.clone(),
        }
    }

    fn item_key(&self, ctx: &RequestContext, name: &str) -> StoreResult<String> {
        check_segment(name)?;
        let ns = ctx.namespace().ok_or_else(|| StoreError::invalid_name(name, "namespace required"))?;
        check_segment(ns)?;
        Ok(format!("{}/{}/{}", self.prefix, ns, name))
    }
}

#[derive(Debug, Clone)]
pub struct ClusterKeys {
    prefix: String,
}

impl ClusterKeys {
    pub fn new(prefix: &str) -> Self { Self { prefix: normalize_prefix(prefix) } }
    pub fn prefix(&self) -> &str { &self.prefix }
}

impl KeyScheme for ClusterKeys {
    fn root_key(&self, _ctx: &RequestContext) -> String { self.prefix.clone() }

    fn item_key(&self, _ctx: &RequestContext, name: &str) -> StoreResult<String> {
        check_segment(name)?;
        Ok(format!("{}/{}", self.prefix, name))
    }
}
