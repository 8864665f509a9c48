//! Object <-> bytes.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use kiln_core::StoreResult;

pub trait Codec<K>: Send + Sync {
    fn encode(&self, obj: &K) -> StoreResult<Bytes>;

    /// Decode into a target produced by the object factory.
    fn decode_into(&self, data: &[u8], into: &mut K) -> StoreResult<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<K: Serialize + DeserializeOwned> Codec<K> for JsonCodec {
    fn encode(&self, obj: &K) -> StoreResult<Bytes> { Ok(Bytes::from(serde_json::to_vec(obj)?)) }

    fn decode_into(&self, data: &[u8], into: &mut K) -> StoreResult<()> {
        *into = serde_json::from_slice(data)?;
        Ok(())
    }
}
