//! Kiln store: a generic, namespace-aware CRUD + list + watch + TTL engine.
//!
//! A resource kind is configured, not coded: it supplies a key scheme, an
//! object factory, a field extractor, an expiry policy, a strategy and a
//! codec. `Store<K>` does the rest over any [`Backend`].

#![forbid(unsafe_code)]

use std::fmt::Debug;

use k8s_openapi::{ListableResource, Metadata, Resource};
use serde::{de::DeserializeOwned, Serialize};

use kiln_core::ObjectMeta;

pub mod backend;
pub mod codec;
pub mod factory;
pub mod key;
pub mod matcher;
pub mod memory;
pub mod options;
pub mod store;
pub mod strategy;
pub mod ttl;
pub mod watch;

pub use backend::{Backend, BackendError, BackendResult, BackendWatchStream, KeyValue, RawEvent, RawEventKind};
pub use codec::{Codec, JsonCodec};
pub use factory::{empty_list, ObjectFactory};
pub use key::{ClusterKeys, KeyScheme, NamespacedKeys};
pub use matcher::{default_object_fields, FieldsFn, SelectionPredicate};
pub use memory::MemoryBackend;
pub use options::StoreOptions;
pub use store::{DeleteOptions, ListOptions, Preconditions, Store, StoreBuilder};
pub use strategy::{ObjectMetaStrategy, Strategy};
pub use ttl::{ExpiryPolicy, FixedTtl, NoExpiry, TtlFn};
pub use watch::Watcher;

pub use k8s_openapi::List;

/// Anything the engine can store: a Kubernetes-shaped resource with
/// `ObjectMeta` that serializes.
pub trait Object:
    Resource
    + ListableResource
    + Metadata<Ty = ObjectMeta>
    + Clone
    + Default
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> Object for T where
    T: Resource
        + ListableResource
        + Metadata<Ty = ObjectMeta>
        + Clone
        + Default
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}
