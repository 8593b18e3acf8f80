//! Entry Codecs
//!
//! Built-in implementations of [`CacheCodec`](crate::traits::CacheCodec).
//! Entries are JSON so that a store shared with other services (or inspected
//! with `redis-cli`) stays readable.

mod json;
pub use json::JsonCodec;
