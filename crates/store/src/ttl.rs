//! Expiry policies. A TTL of 0 means the object never expires.

use kiln_core::StoreResult;

pub trait ExpiryPolicy<K>: Send + Sync {
    /// `existing` is the remaining TTL of the stored value (0 on create).
    fn ttl(&self, obj: &K, existing: u64, update: bool) -> StoreResult<u64>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoExpiry;

impl<K> ExpiryPolicy<K> for NoExpiry {
    fn ttl(&self, _obj: &K, _existing: u64, _update: bool) -> StoreResult<u64> { Ok(0) }
}

/// Same TTL for every write, whatever the object.
#[derive(Debug, Clone, Copy)]
pub struct FixedTtl(pub u64);

impl<K> ExpiryPolicy<K> for FixedTtl {
    fn ttl(&self, _obj: &K, _existing: u64, _update: bool) -> StoreResult<u64> { Ok(self.0) }
}

/// Wraps a closure `(obj, existing, update) -> ttl`.
pub struct TtlFn<F>(pub F);

impl<K, F> ExpiryPolicy<K> for TtlFn<F>
where
    F: Fn(&K, u64, bool) -> StoreResult<u64> + Send + Sync,
{
    fn ttl(&self, obj: &K, existing: u64, update: bool) -> StoreResult<u64> { (self.0)(obj, existing, update) }
}
