//! In-process cache store backed by DashMap

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use glob::Pattern;

use crate::store::CacheStore;
use crate::{CacheError, Result};

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    /// `None` when the TTL reaches past what `Instant` can represent
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: String, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now().checked_add(ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Default)]
struct CallCounters {
    gets: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    scans: AtomicU64,
}

/// Per-operation call counts, including failed calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCalls {
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
    pub scans: u64,
}

#[derive(Clone, Default)]
pub struct MemoryCacheStore {
    slots: Arc<DashMap<String, Slot>>,
    failing: Arc<AtomicBool>,
    calls: Arc<CallCounters>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every operation fails as if the backend were down
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> StoreCalls {
        StoreCalls {
            gets: self.calls.gets.load(Ordering::Relaxed),
            sets: self.calls.sets.load(Ordering::Relaxed),
            deletes: self.calls.deletes.load(Ordering::Relaxed),
            scans: self.calls.scans.load(Ordering::Relaxed),
        }
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots.iter().filter(|s| s.value().is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired slots, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.slots.len())
    }

    /// Slots held in memory, expired or not
    pub fn capacity_used(&self) -> usize {
        self.slots.len()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory store forced offline".into()));
        }
        Ok(())
    }

    /// Expired slots are evicted as they are read
    fn live_value(&self, key: &str, now: Instant) -> Option<String> {
        let value = {
            let slot = self.slots.get(key)?;
            slot.is_live(now).then(|| slot.value.clone())
        };
        if value.is_none() {
            self.slots.remove_if(key, |_, slot| !slot.is_live(now));
        }
        value
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.calls.gets.fetch_add(1, Ordering::Relaxed);
        self.check()?;
        Ok(self.live_value(key, Instant::now()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.calls.sets.fetch_add(1, Ordering::Relaxed);
        self.check()?;
        self.slots
            .insert(key.to_string(), Slot::new(value.to_string(), ttl));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.calls.deletes.fetch_add(1, Ordering::Relaxed);
        self.check()?;
        let now = Instant::now();
        let removed = keys
            .iter()
            .filter_map(|key| self.slots.remove(key))
            .filter(|(_, slot)| slot.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.calls.gets.fetch_add(1, Ordering::Relaxed);
        self.check()?;
        Ok(self.live_value(key, Instant::now()).is_some())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        self.calls.scans.fetch_add(1, Ordering::Relaxed);
        self.check()?;
        let pattern = Pattern::new(pattern)?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| entry.value().is_live(now) && pattern.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.calls.gets.fetch_add(1, Ordering::Relaxed);
        self.check()?;
        let now = Instant::now();
        Ok(keys.iter().map(|key| self.live_value(key, now)).collect())
    }

    async fn mset(&self, entries: &[(String, String)], ttl: Duration) -> Result<()> {
        self.calls.sets.fetch_add(1, Ordering::Relaxed);
        self.check()?;
        for (key, value) in entries {
            self.slots.insert(key.clone(), Slot::new(value.clone(), ttl));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_and_expiry() {
        let store = MemoryCacheStore::new();
        store.set("k", "v", Duration::from_secs(60)).await.unwrap();
        store.set("gone", "v", Duration::ZERO).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.get("gone").await.unwrap(), None);
        assert!(!store.exists("gone").await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_scan_and_delete() {
        let store = MemoryCacheStore::new();
        let ttl = Duration::from_secs(60);
        for key in ["tp:hourly:a:1", "tp:hourly:a:2", "tp:hourly:b:1"] {
            store.set(key, "x", ttl).await.unwrap();
        }

        let keys = store.scan("tp:hourly:a:*").await.unwrap();
        assert_eq!(keys, vec!["tp:hourly:a:1".to_string(), "tp:hourly:a:2".to_string()]);
        assert_eq!(store.delete(&keys).await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_mode() {
        let store = MemoryCacheStore::new();
        store.set_failing(true);
        assert!(store.get("k").await.is_err());
        assert!(store.set("k", "v", Duration::from_secs(1)).await.is_err());
        assert_eq!(store.calls().gets, 1);
        assert_eq!(store.calls().sets, 1);
    }

    #[tokio::test]
    async fn test_mset_mget() {
        let store = MemoryCacheStore::new();
        let entries = vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())];
        store.mset(&entries, Duration::from_secs(60)).await.unwrap();

        let values = store
            .mget(&["a".to_string(), "missing".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some("1".to_string()), None, Some("2".to_string())]);
    }

    #[tokio::test]
    async fn test_unbounded_ttl_never_expires() {
        let store = MemoryCacheStore::new();
        store.set("k", "v", Duration::from_secs(u64::MAX)).await.unwrap();
        store.mset(&[("m".to_string(), "w".to_string())], Duration::MAX).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert!(store.exists("m").await.unwrap());
        assert_eq!(store.purge_expired(), 0);
    }

    #[tokio::test]
    async fn test_expired_slots_are_released() {
        let store = MemoryCacheStore::new();
        for i in 0..5 {
            store.set(&format!("stale:{}", i), "x", Duration::ZERO).await.unwrap();
        }
        store.set("fresh", "x", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.capacity_used(), 6);

        assert_eq!(store.get("stale:0").await.unwrap(), None);
        assert_eq!(store.capacity_used(), 5);

        assert_eq!(store.purge_expired(), 4);
        assert_eq!(store.capacity_used(), 1);
    }

    #[tokio::test]
    async fn test_malformed_pattern_is_an_error() {
        let store = MemoryCacheStore::new();
        store.set("tp:hourly:a:1", "x", Duration::from_secs(60)).await.unwrap();
        assert!(matches!(store.scan("tp:[").await, Err(CacheError::Pattern(_))));
    }
}
