//! `events`: namespaced, expiring, no caching layer in front of the backend.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Event;
use tracing::debug;

use kiln_core::validation::validate_object_meta;
use kiln_core::{FieldError, FieldSelector, Fields, LabelSelector};
use kiln_store::{
    default_object_fields, empty_list, FixedTtl, JsonCodec, NamespacedKeys, ObjectFactory, SelectionPredicate, Store,
    StoreOptions, Strategy,
};

pub const RESOURCE: &str = "events";
pub const PREFIX: &str = "/events";

#[derive(Debug, Clone, Copy, Default)]
pub struct EventStrategy;

impl Strategy<Event> for EventStrategy {
    fn namespace_scoped(&self) -> bool { true }
    fn allow_create_on_update(&self) -> bool { true }
    fn allow_unconditional_update(&self) -> bool { true }

    fn validate(&self, obj: &Event) -> Vec<FieldError> { validate_event(obj) }

    fn validate_update(&self, new: &Event, _old: &Event) -> Vec<FieldError> { validate_event(new) }
}

pub fn validate_event(ev: &Event) -> Vec<FieldError> {
    let mut errs = validate_object_meta(&ev.metadata, true);
    if let Some(involved) = ev.involved_object.namespace.as_deref().filter(|ns| !ns.is_empty()) {
        if ev.metadata.namespace.as_deref() != Some(involved) {
            errs.push(FieldError::invalid("involvedObject.namespace", involved, "does not match involvedObject"));
        }
    }
    errs
}

/// Selectable fields. Unset values are the empty string.
pub fn event_fields(ev: &Event) -> Fields {
    let mut fields = default_object_fields(&ev.metadata, true);
    let io = &ev.involved_object;
    let mut put = |k: &str, v: &Option<String>| {
        fields.insert(k.to_string(), v.clone().unwrap_or_default());
    };
    put("involvedObject.kind", &io.kind);
    put("involvedObject.namespace", &io.namespace);
    put("involvedObject.name", &io.name);
    put("involvedObject.uid", &io.uid);
    put("involvedObject.apiVersion", &io.api_version);
    put("involvedObject.resourceVersion", &io.resource_version);
    put("involvedObject.fieldPath", &io.field_path);
    put("reason", &ev.reason);
    put("type", &ev.type_);
    let source = ev.source.as_ref().and_then(|s| s.component.clone());
    put("source", &source);
    fields
}

pub fn match_event(label: LabelSelector, field: FieldSelector) -> SelectionPredicate<Event> {
    SelectionPredicate::new(label, field, Arc::new(event_fields))
}

/// Events store over `opts.backend`; every write expires after `ttl` seconds.
pub fn new_event_store(opts: StoreOptions, ttl: u64) -> Store<Event> {
    debug!(ttl, workers = opts.delete_collection_workers, "registry: events store");
    Store::builder(RESOURCE, EventStrategy, opts)
        .with_keys(NamespacedKeys::new(PREFIX))
        .with_factory(ObjectFactory::new(Event::default, empty_list::<Event>))
        .with_fields(event_fields)
        .with_ttl(FixedTtl(ttl))
        .with_codec(JsonCodec)
        .build()
}
