//! Cache store trait

use async_trait::async_trait;
use std::time::Duration;

use crate::Result;

/// Raw key-value store with TTL, glob scan and batched variants.
///
/// Implementations report failures; swallowing them is the job of
/// [`crate::CacheService`].
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete the given keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// All live keys matching a glob pattern
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    async fn mset(&self, entries: &[(String, String)], ttl: Duration) -> Result<()>;
}
