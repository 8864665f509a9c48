//! Resource kinds configured on the kiln store.
//!
//! Each kind supplies keys, factories, selectable fields, an expiry policy
//! and a strategy; the storage engine is shared.

#![forbid(unsafe_code)]

pub mod event;

pub use event::{event_fields, match_event, new_event_store, validate_event, EventStrategy};
