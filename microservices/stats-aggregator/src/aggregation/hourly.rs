//! Hourly aggregation
//!
//! Applies one event's deltas to the (keyword, hour) row inside a
//! transaction and schedules the matching cache invalidations for commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, instrument};
use validator::Validate;

use trendpulse_cache::{CacheLayer, CacheService};
use trendpulse_core::time::truncate_to_hour;
use trendpulse_core::{HourlyStat, Sentiment, SentimentEvent};
use trendpulse_store::StoreTransaction;

use super::topk::merge_top_keywords;
use super::READ_FILL_TTL;
use crate::consistency::{HOURLY_STATS_UPDATE, SENTIMENT_UPDATE};
use crate::error::{AggregationError, Result, TransactionError};
use crate::transaction::{TransactionContext, TransactionEngine, TransactionOptions, UnitOfWork};

/// Deltas for one (keyword, hour) row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct HourlyUpdate {
    #[validate(length(min = 1, max = 256))]
    pub keyword: String,
    pub timestamp: DateTime<Utc>,
    #[validate(range(min = 0))]
    pub post_count: Option<i64>,
    #[validate(range(min = 0))]
    pub comment_count: Option<i64>,
    pub sentiment: Option<Sentiment>,
    pub keywords: Option<Vec<String>>,
}

impl HourlyUpdate {
    pub fn new(keyword: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            keyword: keyword.to_string(),
            timestamp,
            post_count: None,
            comment_count: None,
            sentiment: None,
            keywords: None,
        }
    }

    pub fn posts(mut self, count: i64) -> Self {
        self.post_count = Some(count);
        self
    }

    pub fn comments(mut self, count: i64) -> Self {
        self.comment_count = Some(count);
        self
    }

    pub fn sentiment(mut self, sentiment: Sentiment) -> Self {
        self.sentiment = Some(sentiment);
        self
    }

    pub fn keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = Some(keywords);
        self
    }

    fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| AggregationError::Validation(e.to_string()))?;
        if self.keyword.trim().is_empty() {
            return Err(AggregationError::Validation("keyword is blank".to_string()));
        }
        if let Some(sentiment) = &self.sentiment {
            if !sentiment.score.is_finite() {
                return Err(AggregationError::Validation(format!(
                    "sentiment score is not finite: {}",
                    sentiment.score
                )));
            }
        }
        Ok(())
    }
}

impl From<&SentimentEvent> for HourlyUpdate {
    fn from(event: &SentimentEvent) -> Self {
        Self {
            keyword: event.keyword.clone(),
            timestamp: event.timestamp,
            post_count: Some(1),
            comment_count: event.comment_count,
            sentiment: Some(event.sentiment),
            keywords: (!event.keywords.is_empty()).then(|| event.keywords.clone()),
        }
    }
}

/// Running mean after folding `increment` samples of `score` into a mean
/// over `old_weight` samples. With no prior weight the score is the mean.
pub fn weighted_average(old_avg: f64, old_weight: i64, score: f64, increment: i64) -> f64 {
    let total = old_weight + increment;
    if old_weight <= 0 || total <= 0 {
        return score;
    }
    (old_avg * old_weight as f64 + score * increment as f64) / total as f64
}

/// Apply an update's deltas to a loaded row
pub fn apply_update(stat: &mut HourlyStat, update: &HourlyUpdate) {
    let old_weight = stat.post_count;

    if let Some(posts) = update.post_count {
        stat.post_count += posts;
    }
    if let Some(comments) = update.comment_count {
        stat.comment_count += comments;
    }
    if let Some(sentiment) = update.sentiment {
        let increment = update.post_count.unwrap_or(1);
        stat.avg_sentiment_score =
            weighted_average(stat.avg_sentiment_score, old_weight, sentiment.score, increment);
        stat.record_label(sentiment.label);
    }
    if let Some(keywords) = update.keywords.as_deref().filter(|k| !k.is_empty()) {
        stat.top_keywords = merge_top_keywords(&stat.top_keywords, keywords);
    }
}

struct ApplyHourlyUpdate<'a> {
    update: &'a HourlyUpdate,
}

#[async_trait]
impl<'a> UnitOfWork for ApplyHourlyUpdate<'a> {
    type Output = HourlyStat;

    async fn run(
        &self,
        tx: &mut dyn StoreTransaction,
        ctx: &TransactionContext,
    ) -> std::result::Result<HourlyStat, TransactionError> {
        let hour = truncate_to_hour(self.update.timestamp);
        let mut stat = tx.lock_hourly(&self.update.keyword, hour).await?;
        apply_update(&mut stat, self.update);
        tx.save_hourly(&stat).await?;

        let data = json!({
            "keyword": stat.keyword,
            "hour": hour.format("%Y%m%d%H").to_string(),
            "sentiment": self.update.sentiment.map(|s| s.score),
        });
        ctx.schedule_invalidation(HOURLY_STATS_UPDATE, &data);
        ctx.schedule_invalidation(SENTIMENT_UPDATE, &data);
        Ok(stat)
    }
}

#[derive(Clone)]
pub struct HourlyAggregator {
    engine: Arc<TransactionEngine>,
    cache: CacheService,
    options: TransactionOptions,
}

impl HourlyAggregator {
    pub fn new(engine: Arc<TransactionEngine>, cache: CacheService) -> Self {
        Self {
            engine,
            cache,
            options: TransactionOptions::critical(),
        }
    }

    pub fn with_options(mut self, options: TransactionOptions) -> Self {
        self.options = options;
        self
    }

    /// Apply `update` to its hourly row, retrying on contention
    #[instrument(skip(self, update), fields(keyword = %update.keyword))]
    pub async fn update_hourly_stats(&self, update: HourlyUpdate) -> Result<HourlyStat> {
        update.check()?;

        let unit = ApplyHourlyUpdate { update: &update };
        let result = self
            .engine
            .execute_in_transaction("update_hourly_stats", &self.options, &unit)
            .await;

        let attempts = result.attempts;
        let stat = result
            .outcome
            .map_err(|source| AggregationError::Transaction { attempts, source })?;
        debug!(
            hour = %stat.hour_timestamp,
            post_count = stat.post_count,
            attempts,
            "Hourly stats updated"
        );
        Ok(stat)
    }

    /// Rows with `start <= hour < end`, ascending. Always read from the store.
    pub async fn get_hourly_stats(
        &self,
        keyword: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HourlyStat>> {
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(self
            .engine
            .store()
            .hourly_range(Some(keyword), start, end)
            .await?)
    }

    /// Single row, served from the hourly cache layer when possible
    pub async fn get_hourly_stat(
        &self,
        keyword: &str,
        hour: DateTime<Utc>,
    ) -> Result<Option<HourlyStat>> {
        let hour = truncate_to_hour(hour);
        let key = self.cache.keys().hourly_key(keyword, hour);
        if let Some(cached) = self.cache.get::<HourlyStat>(&key).await {
            return Ok(Some(cached));
        }

        let stat = self.engine.store().get_hourly(keyword, hour).await?;
        if let Some(stat) = &stat {
            self.cache
                .set(&key, stat, CacheLayer::Hourly, Some(READ_FILL_TTL))
                .await;
        }
        Ok(stat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use trendpulse_cache::{CacheEntry, CacheStore, KeyBuilder, MemoryCacheStore};
    use trendpulse_core::SentimentLabel;
    use trendpulse_store::{MemoryStatsStore, StatsStore};

    use crate::consistency::CacheConsistencyManager;
    use crate::transaction::EngineConfig;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, 0).unwrap()
    }

    fn positive(score: f64) -> Sentiment {
        Sentiment {
            score,
            label: SentimentLabel::Positive,
        }
    }

    fn setup() -> (HourlyAggregator, MemoryStatsStore, CacheService) {
        let store = MemoryStatsStore::new();
        let cache = CacheService::new(Arc::new(MemoryCacheStore::new()), KeyBuilder::new("tp"));
        let consistency = CacheConsistencyManager::new(cache.clone());
        let engine = TransactionEngine::new(Arc::new(store.clone()), EngineConfig::default())
            .with_hook(consistency.create_transaction_hook());
        let options = TransactionOptions::critical()
            .with_retry_delay_base(std::time::Duration::from_millis(1));
        let hourly = HourlyAggregator::new(Arc::new(engine), cache.clone()).with_options(options);
        (hourly, store, cache)
    }

    #[test]
    fn test_weighted_average_cold_start() {
        assert_eq!(weighted_average(0.0, 0, 0.8, 5), 0.8);
        assert!((weighted_average(0.8, 5, 0.0, 5) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_apply_update_without_post_delta_uses_unit_increment() {
        let mut stat = HourlyStat::empty("rust", at(1, 0));
        stat.post_count = 3;
        stat.avg_sentiment_score = 0.5;

        apply_update(&mut stat, &HourlyUpdate::new("rust", at(1, 0)).sentiment(positive(0.9)));
        assert_eq!(stat.post_count, 3);
        assert!((stat.avg_sentiment_score - 0.6).abs() < 1e-12);
        assert_eq!(stat.positive_count, 1);
    }

    #[tokio::test]
    async fn test_running_average_across_updates() {
        let (hourly, _, _) = setup();

        let first = hourly
            .update_hourly_stats(HourlyUpdate::new("rust", at(9, 5)).posts(5).sentiment(positive(0.8)))
            .await
            .unwrap();
        assert_eq!(first.avg_sentiment_score, 0.8);
        assert_eq!(first.hour_timestamp, at(9, 0));

        let second = hourly
            .update_hourly_stats(HourlyUpdate::new("rust", at(9, 40)).posts(5).sentiment(positive(0.0)))
            .await
            .unwrap();
        assert_eq!(second.post_count, 10);
        assert!((second.avg_sentiment_score - 0.4).abs() < 1e-12);
        assert_eq!(second.positive_count, 2);
    }

    #[tokio::test]
    async fn test_keywords_merged_by_frequency() {
        let (hourly, _, _) = setup();
        let kws = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        hourly
            .update_hourly_stats(HourlyUpdate::new("rust", at(2, 0)).keywords(kws(&["a", "b"])))
            .await
            .unwrap();
        let stat = hourly
            .update_hourly_stats(HourlyUpdate::new("rust", at(2, 1)).keywords(kws(&["b", "b", "c"])))
            .await
            .unwrap();
        assert_eq!(stat.top_keywords, kws(&["b", "a", "c"]));
    }

    #[tokio::test]
    async fn test_commit_invalidates_cached_row() {
        let (hourly, _, cache) = setup();
        hourly
            .update_hourly_stats(HourlyUpdate::new("rust", at(3, 0)).posts(1))
            .await
            .unwrap();

        let cached = hourly.get_hourly_stat("rust", at(3, 30)).await.unwrap().unwrap();
        assert_eq!(cached.post_count, 1);
        let key = cache.keys().hourly_key("rust", at(3, 0));
        assert!(cache.exists(&key).await);

        hourly
            .update_hourly_stats(HourlyUpdate::new("rust", at(3, 10)).posts(2))
            .await
            .unwrap();
        assert!(!cache.exists(&key).await);
        let fresh = hourly.get_hourly_stat("rust", at(3, 0)).await.unwrap().unwrap();
        assert_eq!(fresh.post_count, 3);
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_cache_and_row() {
        let (hourly, store, cache) = setup();
        hourly
            .update_hourly_stats(HourlyUpdate::new("rust", at(4, 0)).posts(1))
            .await
            .unwrap();
        hourly.get_hourly_stat("rust", at(4, 0)).await.unwrap();

        store.fail_next_commits(1, "disk full");
        let err = hourly
            .update_hourly_stats(HourlyUpdate::new("rust", at(4, 0)).posts(7))
            .await
            .unwrap_err();
        assert!(matches!(err, AggregationError::Transaction { attempts: 1, .. }));

        let key = cache.keys().hourly_key("rust", at(4, 0));
        assert!(cache.exists(&key).await);
        let row = store.get_hourly("rust", at(4, 0)).await.unwrap().unwrap();
        assert_eq!(row.post_count, 1);
    }

    #[tokio::test]
    async fn test_read_fill_uses_short_ttl() {
        let store = MemoryStatsStore::new();
        let cache_store = MemoryCacheStore::new();
        let cache = CacheService::new(Arc::new(cache_store.clone()), KeyBuilder::new("tp"));
        let engine = TransactionEngine::new(Arc::new(store.clone()), EngineConfig::default());
        let hourly = HourlyAggregator::new(Arc::new(engine), cache.clone());

        let mut stat = HourlyStat::empty("rust", at(5, 0));
        stat.post_count = 2;
        store.seed_hourly(stat);
        hourly.get_hourly_stat("rust", at(5, 20)).await.unwrap();

        let raw = cache_store
            .get(&cache.keys().hourly_key("rust", at(5, 0)))
            .await
            .unwrap()
            .unwrap();
        let entry: CacheEntry<HourlyStat> = serde_json::from_str(&raw).unwrap();
        assert_eq!(entry.value.post_count, 2);
        assert_eq!(entry.ttl_secs, READ_FILL_TTL.as_secs());
    }

    #[tokio::test]
    async fn test_inverted_range_is_empty() {
        let (hourly, store, _) = setup();
        store.seed_hourly(HourlyStat::empty("rust", at(6, 0)));
        assert!(hourly.get_hourly_stats("rust", at(7, 0), at(5, 0)).await.unwrap().is_empty());
        assert_eq!(hourly.get_hourly_stats("rust", at(5, 0), at(7, 0)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_contended_commit_retried() {
        let (hourly, store, _) = setup();
        store.fail_next_commits(2, "deadlock detected");

        let stat = hourly
            .update_hourly_stats(HourlyUpdate::new("rust", at(5, 0)).posts(1))
            .await
            .unwrap();
        assert_eq!(stat.post_count, 1);
        assert_eq!(store.stats().commits, 1);
    }

    #[tokio::test]
    async fn test_concurrent_updates_all_counted() {
        let (hourly, store, _) = setup();
        let updates = (0..20).map(|i| {
            hourly.update_hourly_stats(HourlyUpdate::new("rust", at(6, i)).posts(1).comments(2))
        });
        let results = futures_util::future::join_all(updates).await;
        assert!(results.iter().all(|r| r.is_ok()));

        let row = store.get_hourly("rust", at(6, 0)).await.unwrap().unwrap();
        assert_eq!(row.post_count, 20);
        assert_eq!(row.comment_count, 40);
    }

    #[tokio::test]
    async fn test_invalid_updates_rejected() {
        let (hourly, store, _) = setup();
        let blank = hourly
            .update_hourly_stats(HourlyUpdate::new("  ", at(7, 0)).posts(1))
            .await;
        assert!(matches!(blank, Err(AggregationError::Validation(_))));

        let negative = hourly
            .update_hourly_stats(HourlyUpdate::new("rust", at(7, 0)).posts(-1))
            .await;
        assert!(matches!(negative, Err(AggregationError::Validation(_))));

        let nan = hourly
            .update_hourly_stats(HourlyUpdate::new("rust", at(7, 0)).sentiment(positive(f64::NAN)))
            .await;
        assert!(matches!(nan, Err(AggregationError::Validation(_))));
        assert_eq!(store.stats().begins, 0);
    }

    #[tokio::test]
    async fn test_range_reads_bypass_cache() {
        let (hourly, _, _) = setup();
        for h in [1, 2, 3] {
            hourly
                .update_hourly_stats(HourlyUpdate::new("rust", at(h, 0)).posts(h as i64))
                .await
                .unwrap();
        }
        let rows = hourly.get_hourly_stats("rust", at(1, 0), at(3, 0)).await.unwrap();
        let posts: Vec<i64> = rows.iter().map(|r| r.post_count).collect();
        assert_eq!(posts, vec![1, 2]);
        assert!(hourly.get_hourly_stats("rust", at(3, 0), at(1, 0)).await.unwrap().is_empty());
    }
}
