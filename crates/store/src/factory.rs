use k8s_openapi::{List, ListableResource};
use kiln_core::ListMeta;

use crate::Object;

/// A list with no items and no metadata.
pub fn empty_list<K: ListableResource>() -> List<K> {
    List { items: Vec::new(), metadata: ListMeta::default() }
}

/// Produces fresh decode targets and list containers for one kind.
pub struct ObjectFactory<K: ListableResource> {
    new_object: fn() -> K,
    new_list: fn() -> List<K>,
}

impl<K: ListableResource> Clone for ObjectFactory<K> {
    fn clone(&self) -> Self { *self }
}

impl<K: ListableResource> Copy for ObjectFactory<K> {}

impl<K: ListableResource> ObjectFactory<K> {
    pub fn new(new_object: fn() -> K, new_list: fn() -> List<K>) -> Self { Self { new_object, new_list } }
    pub fn new_object(&self) -> K { (self.new_object)() }
    pub fn new_list(&self) -> List<K> { (self.new_list)() }
}

impl<K: Object> Default for ObjectFactory<K> {
    fn default() -> Self { Self::new(K::default, empty_list::<K>) }
}
