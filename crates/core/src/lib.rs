//! Kiln core types shared by the store engine, backends and resource kinds.
//!
//! - `RequestContext`: the namespace scope a request runs in
//! - `StoreError` and `FieldError`: the error taxonomy
//! - label/field selectors and the `Fields` set they evaluate against
//! - object metadata validation helpers

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod error;
pub mod selector;
pub mod validation;

pub use error::{FieldError, FieldErrorKind, ItemError, StoreError, StoreResult};
pub use selector::{FieldSelector, Fields, LabelSelector, Labels, SelectorError};

pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ListMeta, ObjectMeta};

pub mod prelude {
    pub use super::{
        EventType, FieldError, FieldSelector, Fields, LabelSelector, RequestContext, StoreError,
        StoreResult, WatchEvent,
    };
}

/// Scope of a single request. A missing namespace means cluster-wide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub namespace: Option<String>,
}

impl RequestContext {
    pub fn namespaced(ns: impl Into<String>) -> Self {
        Self { namespace: Some(ns.into()) }
    }

    pub fn cluster() -> Self {
        Self { namespace: None }
    }

    /// Namespace of the request, treating `""` as absent.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// A change delivered by a watch, carrying the object after the change
/// (or the last known state for deletions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K> WatchEvent<K> {
    pub fn event_type(&self) -> EventType {
        match self {
            WatchEvent::Added(_) => EventType::Added,
            WatchEvent::Modified(_) => EventType::Modified,
            WatchEvent::Deleted(_) => EventType::Deleted,
        }
    }

    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
        }
    }

    pub fn into_object(self) -> K {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
        }
    }
}

/// Parse a `metadata.resourceVersion` string into a backend revision.
/// Empty means "unset".
pub fn parse_resource_version(rv: &str) -> StoreResult<Option<u64>> {
    if rv.is_empty() {
        return Ok(None);
    }
    rv.parse::<u64>()
        .map(Some)
        .map_err(|_| StoreError::InvalidResourceVersion(rv.to_string()))
}
