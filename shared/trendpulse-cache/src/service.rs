//! Fail-safe cache facade
//!
//! Every backend call is bounded by a timeout and every failure is
//! logged and converted into a neutral value (`None`, `false`, `0`).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use trendpulse_telemetry::Counter;

use crate::entry::CacheEntry;
use crate::keys::{CacheLayer, KeyBuilder};
use crate::store::CacheStore;
use crate::Result;

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(500);
/// Longer TTLs are clamped to this
pub const MAX_TTL: Duration = Duration::from_secs(365 * 86_400);

/// Cache effectiveness counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub sets: u64,
    pub invalidated: u64,
    /// Hits over lookups, 0.0 before the first lookup
    pub hit_rate: f64,
}

#[derive(Clone)]
pub struct CacheService {
    store: Arc<dyn CacheStore>,
    keys: KeyBuilder,
    op_timeout: Duration,
    hits: Counter,
    misses: Counter,
    errors: Counter,
    sets: Counter,
    invalidated: Counter,
}

impl CacheService {
    pub fn new(store: Arc<dyn CacheStore>, keys: KeyBuilder) -> Self {
        Self {
            store,
            keys,
            op_timeout: DEFAULT_OP_TIMEOUT,
            hits: Counter::new("cache_hits"),
            misses: Counter::new("cache_misses"),
            errors: Counter::new("cache_errors"),
            sets: Counter::new("cache_sets"),
            invalidated: Counter::new("cache_invalidated_keys"),
        }
    }

    pub fn with_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    async fn guarded<T, F>(&self, op: &'static str, target: &str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        match timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.errors.inc();
                warn!(op, key = target, error = %e, "Cache operation failed");
                None
            }
            Err(_) => {
                self.errors.inc();
                warn!(op, key = target, timeout_ms = self.op_timeout.as_millis() as u64, "Cache operation timed out");
                None
            }
        }
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, raw: &str) -> Option<T> {
        match serde_json::from_str::<CacheEntry<T>>(raw) {
            Ok(entry) if entry.is_fresh() => Some(entry.into_value()),
            Ok(_) => None,
            Err(e) => {
                self.errors.inc();
                warn!(key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    fn encode<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Option<String> {
        match serde_json::to_string(&CacheEntry::new(value, ttl)) {
            Ok(raw) => Some(raw),
            Err(e) => {
                self.errors.inc();
                warn!(key, error = %e, "Cannot serialize cache entry");
                None
            }
        }
    }

    /// Fresh cached value, or `None` on miss, expiry or any failure
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.guarded("get", key, self.store.get(key)).await.flatten();
        let value = raw.and_then(|raw| self.decode(key, &raw));
        if value.is_some() {
            self.hits.inc();
        } else {
            self.misses.inc();
        }
        value
    }

    /// Store under the layer's default TTL unless `ttl` overrides it
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        layer: CacheLayer,
        ttl: Option<Duration>,
    ) -> bool {
        let ttl = ttl.unwrap_or_else(|| layer.default_ttl()).min(MAX_TTL);
        let Some(raw) = self.encode(key, value, ttl) else {
            return false;
        };
        let stored = self
            .guarded("set", key, self.store.set(key, &raw, ttl))
            .await
            .is_some();
        if stored {
            self.sets.inc();
        }
        stored
    }

    pub async fn mget<T: DeserializeOwned>(&self, keys: &[String]) -> Vec<Option<T>> {
        let target = keys.first().map(String::as_str).unwrap_or("");
        let Some(raws) = self.guarded("mget", target, self.store.mget(keys)).await else {
            self.misses.add(keys.len() as u64);
            return keys.iter().map(|_| None).collect();
        };

        raws.into_iter()
            .zip(keys)
            .map(|(raw, key)| {
                let value = raw.and_then(|raw| self.decode(key, &raw));
                if value.is_some() {
                    self.hits.inc();
                } else {
                    self.misses.inc();
                }
                value
            })
            .collect()
    }

    pub async fn mset<T: Serialize>(
        &self,
        entries: &[(String, T)],
        layer: CacheLayer,
        ttl: Option<Duration>,
    ) -> bool {
        let ttl = ttl.unwrap_or_else(|| layer.default_ttl()).min(MAX_TTL);
        let mut encoded = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let Some(raw) = self.encode(key, value, ttl) else {
                return false;
            };
            encoded.push((key.clone(), raw));
        }

        let target = entries.first().map(|(k, _)| k.as_str()).unwrap_or("");
        let stored = self
            .guarded("mset", target, self.store.mset(&encoded, ttl))
            .await
            .is_some();
        if stored {
            self.sets.add(entries.len() as u64);
        }
        stored
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.guarded("exists", key, self.store.exists(key))
            .await
            .unwrap_or(false)
    }

    /// Delete every key matching a glob pattern, returning how many went
    pub async fn invalidate(&self, pattern: &str) -> u64 {
        let Some(keys) = self.guarded("scan", pattern, self.store.scan(pattern)).await else {
            return 0;
        };
        if keys.is_empty() {
            return 0;
        }

        let removed = self
            .guarded("delete", pattern, self.store.delete(&keys))
            .await
            .unwrap_or(0);
        self.invalidated.add(removed);
        debug!(pattern, removed, "Invalidated cache pattern");
        removed
    }

    pub async fn invalidate_key(&self, key: &str) -> bool {
        let removed = self
            .guarded("delete", key, self.store.delete(&[key.to_string()]))
            .await
            .unwrap_or(0);
        self.invalidated.add(removed);
        removed > 0
    }

    /// Read-through: serve a fresh cached value or compute, cache and
    /// return a new one. Compute errors propagate; cache errors do not.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        layer: CacheLayer,
        compute: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(cached) = self.get::<T>(key).await {
            return Ok(cached);
        }
        let value = compute().await?;
        self.set(key, &value, layer, None).await;
        Ok(value)
    }

    pub fn get_stats(&self) -> CacheStats {
        let hits = self.hits.get();
        let misses = self.misses.get();
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            errors: self.errors.get(),
            sets: self.sets.get(),
            invalidated: self.invalidated.get(),
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }
}
