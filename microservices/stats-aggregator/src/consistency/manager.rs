//! Commit-bound cache invalidation
//!
//! Writers declare what changed while the transaction is open; the
//! matching keys are evicted only once the transaction has committed.
//! Plans scheduled under a transaction that rolls back are dropped
//! without touching the cache.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use trendpulse_cache::CacheService;
use trendpulse_telemetry::Counter;

use super::rules::{default_rules, InvalidationRule};
use crate::transaction::TransactionHook;

#[derive(Debug, Clone)]
struct InvalidationPlan {
    rule_key: String,
    patterns: Vec<String>,
    scheduled_at: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsistencyStats {
    pub rules: usize,
    pub pending_plans: usize,
    pub scheduled: u64,
    pub skipped_by_condition: u64,
    pub unknown_rules: u64,
    pub sweeps: u64,
    pub patterns_invalidated: u64,
    pub keys_invalidated: u64,
    pub rolled_back: u64,
    pub purged_stale: u64,
}

struct Inner {
    cache: CacheService,
    rules: RwLock<HashMap<String, InvalidationRule>>,
    pending: DashMap<String, Vec<InvalidationPlan>>,
    scheduled: Counter,
    skipped: Counter,
    unknown_rules: Counter,
    sweeps: Counter,
    patterns_invalidated: Counter,
    keys_invalidated: Counter,
    rolled_back: Counter,
    purged_stale: Counter,
}

#[derive(Clone)]
pub struct CacheConsistencyManager {
    inner: Arc<Inner>,
}

impl CacheConsistencyManager {
    /// Manager preloaded with the default rules for the cache's prefix
    pub fn new(cache: CacheService) -> Self {
        let rules = default_rules(cache.keys().prefix())
            .into_iter()
            .map(|rule| (rule.key.clone(), rule))
            .collect();

        Self {
            inner: Arc::new(Inner {
                cache,
                rules: RwLock::new(rules),
                pending: DashMap::new(),
                scheduled: Counter::new("consistency_scheduled"),
                skipped: Counter::new("consistency_skipped"),
                unknown_rules: Counter::new("consistency_unknown_rules"),
                sweeps: Counter::new("consistency_sweeps"),
                patterns_invalidated: Counter::new("consistency_patterns"),
                keys_invalidated: Counter::new("consistency_keys"),
                rolled_back: Counter::new("consistency_rolled_back"),
                purged_stale: Counter::new("consistency_purged"),
            }),
        }
    }

    /// Add or replace a rule
    pub fn register_rule(&self, rule: InvalidationRule) {
        debug!(rule = %rule.key, patterns = rule.patterns.len(), "Registering invalidation rule");
        self.inner.rules.write().insert(rule.key.clone(), rule);
    }

    pub fn rule_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.rules.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Buffer the patterns of `rule_key` under `transaction_id`. Returns
    /// false when the rule is unknown or its condition rejects `data`.
    pub fn schedule_invalidation(&self, transaction_id: &str, rule_key: &str, data: &Value) -> bool {
        let patterns = {
            let rules = self.inner.rules.read();
            let Some(rule) = rules.get(rule_key) else {
                self.inner.unknown_rules.inc();
                warn!(transaction_id, rule = rule_key, "Unknown invalidation rule");
                return false;
            };
            if !rule.applies_to(data) {
                self.inner.skipped.inc();
                return false;
            }
            rule.resolve(data)
        };

        if patterns.is_empty() {
            return false;
        }
        self.inner
            .pending
            .entry(transaction_id.to_string())
            .or_default()
            .push(InvalidationPlan {
                rule_key: rule_key.to_string(),
                patterns,
                scheduled_at: Instant::now(),
            });
        self.inner.scheduled.inc();
        true
    }

    /// Evict everything buffered for a committed transaction. Each unique
    /// pattern is invalidated once; returns the number of keys removed.
    pub async fn execute_invalidations(&self, transaction_id: &str) -> u64 {
        let Some((_, plans)) = self.inner.pending.remove(transaction_id) else {
            return 0;
        };

        let patterns: BTreeSet<String> = plans
            .iter()
            .flat_map(|plan| plan.patterns.iter().cloned())
            .collect();
        let rules: BTreeSet<&str> = plans.iter().map(|plan| plan.rule_key.as_str()).collect();

        let cache = &self.inner.cache;
        let removed: u64 = join_all(patterns.iter().map(|pattern| cache.invalidate(pattern)))
            .await
            .into_iter()
            .sum();

        self.inner.sweeps.inc();
        self.inner.patterns_invalidated.add(patterns.len() as u64);
        self.inner.keys_invalidated.add(removed);
        debug!(
            transaction_id,
            rules = ?rules,
            patterns = patterns.len(),
            removed,
            "Executed invalidation sweep"
        );
        removed
    }

    /// Drop the plans of an aborted transaction; returns how many
    pub fn rollback_invalidations(&self, transaction_id: &str) -> usize {
        let discarded = self
            .inner
            .pending
            .remove(transaction_id)
            .map_or(0, |(_, plans)| plans.len());
        if discarded > 0 {
            self.inner.rolled_back.add(discarded as u64);
            debug!(transaction_id, discarded, "Discarded invalidation plans");
        }
        discarded
    }

    /// Number of buffered plans across all open transactions
    pub fn pending_count(&self) -> usize {
        self.inner.pending.iter().map(|entry| entry.value().len()).sum()
    }

    /// Discard plans older than `max_age` whose transaction never
    /// reported an outcome
    pub fn purge_stale(&self, max_age: Duration) -> usize {
        let mut purged = 0;
        self.inner.pending.retain(|_, plans| {
            let before = plans.len();
            plans.retain(|plan| plan.scheduled_at.elapsed() < max_age);
            purged += before - plans.len();
            !plans.is_empty()
        });
        if purged > 0 {
            self.inner.purged_stale.add(purged as u64);
            info!(purged, "Purged stale invalidation plans");
        }
        purged
    }

    /// Hook for the transaction engine
    pub fn create_transaction_hook(&self) -> Arc<dyn TransactionHook> {
        Arc::new(ConsistencyHook {
            manager: self.clone(),
        })
    }

    pub fn get_statistics(&self) -> ConsistencyStats {
        let inner = &self.inner;
        ConsistencyStats {
            rules: inner.rules.read().len(),
            pending_plans: self.pending_count(),
            scheduled: inner.scheduled.get(),
            skipped_by_condition: inner.skipped.get(),
            unknown_rules: inner.unknown_rules.get(),
            sweeps: inner.sweeps.get(),
            patterns_invalidated: inner.patterns_invalidated.get(),
            keys_invalidated: inner.keys_invalidated.get(),
            rolled_back: inner.rolled_back.get(),
            purged_stale: inner.purged_stale.get(),
        }
    }
}

struct ConsistencyHook {
    manager: CacheConsistencyManager,
}

#[async_trait]
impl TransactionHook for ConsistencyHook {
    fn schedule_invalidation(&self, transaction_id: &str, rule_key: &str, data: &Value) -> bool {
        self.manager.schedule_invalidation(transaction_id, rule_key, data)
    }

    async fn on_commit(&self, transaction_id: &str) {
        self.manager.execute_invalidations(transaction_id).await;
    }

    async fn on_rollback(&self, transaction_id: &str) {
        self.manager.rollback_invalidations(transaction_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consistency::rules::{HOURLY_STATS_UPDATE, KEYWORD_PURGE, SENTIMENT_UPDATE};
    use serde_json::json;
    use trendpulse_cache::{CacheLayer, KeyBuilder, MemoryCacheStore};

    fn manager() -> (CacheConsistencyManager, CacheService, MemoryCacheStore) {
        let store = MemoryCacheStore::new();
        let cache = CacheService::new(Arc::new(store.clone()), KeyBuilder::new("tp"));
        (CacheConsistencyManager::new(cache.clone()), cache, store)
    }

    #[tokio::test]
    async fn test_unknown_rule_is_logged_not_raised() {
        let (manager, _, _) = manager();
        assert!(!manager.schedule_invalidation("tx-1", "no-such-rule", &json!({})));
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(manager.get_statistics().unknown_rules, 1);
    }

    #[tokio::test]
    async fn test_condition_blocks_scheduling() {
        let (manager, _, _) = manager();
        assert!(!manager.schedule_invalidation("tx-1", SENTIMENT_UPDATE, &json!({"keyword": "rust"})));
        assert!(manager.schedule_invalidation(
            "tx-1",
            SENTIMENT_UPDATE,
            &json!({"keyword": "rust", "sentiment": 0.2})
        ));
        assert_eq!(manager.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_commit_evicts_matching_keys_only() {
        let (manager, cache, _) = manager();
        let keys = cache.keys().clone();
        cache.set(&keys.realtime_key("rust"), &1, CacheLayer::Realtime, None).await;
        cache.set(&keys.realtime_key("go"), &1, CacheLayer::Realtime, None).await;

        manager.schedule_invalidation("tx-1", KEYWORD_PURGE, &json!({"keyword": "rust"}));
        let removed = manager.execute_invalidations("tx-1").await;

        assert_eq!(removed, 1);
        assert!(!cache.exists(&keys.realtime_key("rust")).await);
        assert!(cache.exists(&keys.realtime_key("go")).await);
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_rollback_never_touches_cache() {
        let (manager, _, store) = manager();
        manager.schedule_invalidation(
            "tx-1",
            HOURLY_STATS_UPDATE,
            &json!({"keyword": "rust", "hour": "2024060113"}),
        );

        assert_eq!(manager.rollback_invalidations("tx-1"), 1);
        assert_eq!(manager.execute_invalidations("tx-1").await, 0);
        assert_eq!(store.calls().scans, 0);
        assert_eq!(store.calls().deletes, 0);
    }

    #[tokio::test]
    async fn test_purge_stale_plans() {
        let (manager, _, _) = manager();
        manager.schedule_invalidation("tx-old", KEYWORD_PURGE, &json!({"keyword": "rust"}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.schedule_invalidation("tx-new", KEYWORD_PURGE, &json!({"keyword": "go"}));

        assert_eq!(manager.purge_stale(Duration::from_millis(10)), 1);
        assert_eq!(manager.pending_count(), 1);
        assert_eq!(manager.get_statistics().purged_stale, 1);
    }

    #[tokio::test]
    async fn test_registered_rule_used() {
        let (manager, cache, _) = manager();
        manager.register_rule(InvalidationRule::new(
            "archive-refresh",
            vec!["tp:archive:{keyword}:*".to_string()],
            "Archive rebuilt",
        ));
        let key = cache.keys().build(CacheLayer::Archive, &["rust", "2024"]);
        cache.set(&key, &"snapshot", CacheLayer::Archive, None).await;

        manager.schedule_invalidation("tx-9", "archive-refresh", &json!({"keyword": "rust"}));
        assert_eq!(manager.execute_invalidations("tx-9").await, 1);
        assert!(manager.rule_keys().contains(&"archive-refresh".to_string()));
    }
}
