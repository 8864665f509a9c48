//! Per-kind create/update/delete hooks.

use k8s_openapi::Metadata;
use kiln_core::validation::validate_object_meta;
use kiln_core::{FieldError, ObjectMeta};

/// Hooks run in order before any backend write. A non-empty error list
/// aborts the operation with `ValidationFailed`. Metadata immutability on
/// update is checked by the engine itself.
pub trait Strategy<K>: Send + Sync {
    fn namespace_scoped(&self) -> bool { true }

    /// Whether `replace` of a missing object creates it.
    fn allow_create_on_update(&self) -> bool { false }

    /// Whether `replace` without a resourceVersion is accepted.
    fn allow_unconditional_update(&self) -> bool { true }

    fn prepare_for_create(&self, _obj: &mut K) {}

    fn validate(&self, obj: &K) -> Vec<FieldError>;

    fn prepare_for_update(&self, _new: &mut K, _old: &K) {}

    fn validate_update(&self, new: &K, old: &K) -> Vec<FieldError>;

    fn validate_delete(&self, _obj: &K) -> Vec<FieldError> { Vec::new() }
}

/// Validates object metadata only.
#[derive(Debug, Clone, Copy)]
pub struct ObjectMetaStrategy {
    pub namespaced: bool,
}

impl ObjectMetaStrategy {
    pub fn namespaced() -> Self { Self { namespaced: true } }
    pub fn cluster() -> Self { Self { namespaced: false } }
}

impl<K: Metadata<Ty = ObjectMeta>> Strategy<K> for ObjectMetaStrategy {
    fn namespace_scoped(&self) -> bool { self.namespaced }

    fn validate(&self, obj: &K) -> Vec<FieldError> { validate_object_meta(obj.metadata(), self.namespaced) }

    fn validate_update(&self, new: &K, _old: &K) -> Vec<FieldError> {
        validate_object_meta(new.metadata(), self.namespaced)
    }
}
