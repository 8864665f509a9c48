//! Label/field selection over stored objects.

use std::sync::Arc;

use k8s_openapi::Metadata;
use kiln_core::{FieldSelector, Fields, LabelSelector, Labels, ObjectMeta};

/// Exposes the selectable fields of an object.
pub type FieldsFn<K> = Arc<dyn Fn(&K) -> Fields + Send + Sync>;

static NO_LABELS: Labels = Labels::new();

/// `metadata.name`, plus `metadata.namespace` for namespaced kinds.
pub fn default_object_fields(meta: &ObjectMeta, namespaced: bool) -> Fields {
    let mut fields = Fields::new();
    fields.insert("metadata.name".into(), meta.name.clone().unwrap_or_default());
    if namespaced {
        fields.insert("metadata.namespace".into(), meta.namespace.clone().unwrap_or_default());
    }
    fields
}

pub struct SelectionPredicate<K> {
    label: LabelSelector,
    field: FieldSelector,
    fields: FieldsFn<K>,
}

impl<K> Clone for SelectionPredicate<K> {
    fn clone(&self) -> Self {
        Self { label: self.label.clone(), field: self.field.clone(), fields: Arc::clone(&self.fields) }
    }
}

impl<K> std::fmt::Debug for SelectionPredicate<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionPredicate")
            .field("label", &self.label.to_string())
            .field("field", &self.field.to_string())
            .finish()
    }
}

impl<K: Metadata<Ty = ObjectMeta>> SelectionPredicate<K> {
    pub fn new(label: LabelSelector, field: FieldSelector, fields: FieldsFn<K>) -> Self {
        Self { label, field, fields }
    }

    pub fn label(&self) -> &LabelSelector { &self.label }
    pub fn field(&self) -> &FieldSelector { &self.field }
    pub fn is_everything(&self) -> bool { self.label.is_empty() && self.field.is_empty() }

    pub fn matches(&self, obj: &K) -> bool {
        if self.is_everything() {
            return true;
        }
        if !self.label.is_empty() {
            let labels = obj.metadata().labels.as_ref().unwrap_or(&NO_LABELS);
            if !self.label.matches(labels) {
                return false;
            }
        }
        if !self.field.is_empty() {
            let fields = (self.fields)(obj);
            if !self.field.matches(&fields) {
                return false;
            }
        }
        true
    }

    /// Name pinned by a `metadata.name=<x>` field term, if any.
    pub fn matches_single(&self) -> Option<&str> { self.field.requires_exact("metadata.name") }
}
