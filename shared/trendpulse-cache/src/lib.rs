//! TrendPulse layered cache
//!
//! Serialized aggregate snapshots live in an external key-value store
//! under layer-qualified, hashed keys. The cache is an optimization only:
//! [`CacheService`] turns every backend failure into a miss or a `false`
//! so callers always fall back to the relational store.

mod entry;
mod error;
mod keys;
mod memory;
mod redis_store;
mod service;
mod store;

pub use entry::CacheEntry;
pub use error::{CacheError, Result};
pub use keys::{sanitize_segment, CacheLayer, KeyBuilder};
pub use memory::{MemoryCacheStore, StoreCalls};
pub use redis_store::RedisCacheStore;
pub use service::{CacheService, CacheStats, MAX_TTL};
pub use store::CacheStore;

/// Re-export for convenience
pub mod prelude {
    pub use super::{CacheLayer, CacheService, CacheStore, KeyBuilder};
}
