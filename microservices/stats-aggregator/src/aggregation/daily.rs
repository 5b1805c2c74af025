//! Daily rollup
//!
//! Rebuilds each keyword's daily row from that day's hourly rows. Every
//! keyword is rolled up on its own: a group that fails validation is
//! skipped and a group whose write fails is counted as failed, and
//! neither stops the remaining keywords.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use trendpulse_cache::{CacheLayer, CacheService};
use trendpulse_core::time::{day_bounds, hour_of_day};
use trendpulse_core::{DailyStat, HourlyStat, HOURS_PER_DAY};
use trendpulse_store::StatsStore;

use super::topk::recount_top_keywords;
use super::READ_FILL_TTL;
use crate::consistency::{CacheConsistencyManager, DAILY_STATS_UPDATE};
use crate::error::Result;

/// Outcome of one rollup run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollupReport {
    pub date: NaiveDate,
    pub keywords_total: usize,
    pub keywords_succeeded: usize,
    pub keywords_failed: usize,
    /// Keywords whose hourly rows failed validation
    pub skipped: Vec<String>,
}

/// Reject a keyword group that cannot produce a sound daily row
pub fn validate_group(
    keyword: &str,
    rows: &[HourlyStat],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> std::result::Result<(), String> {
    if keyword.trim().is_empty() {
        return Err("blank keyword".to_string());
    }
    if rows.is_empty() {
        return Err("no hourly rows".to_string());
    }
    for row in rows {
        if row.hour_timestamp < start || row.hour_timestamp >= end {
            return Err(format!("hour {} outside the day", row.hour_timestamp));
        }
        if row.post_count < 0 {
            return Err(format!("negative post count at {}", row.hour_timestamp));
        }
        if !row.avg_sentiment_score.is_finite() {
            return Err(format!("non-finite average at {}", row.hour_timestamp));
        }
    }
    Ok(())
}

/// Fold one keyword's hourly rows into its daily row
pub fn build_daily(keyword: &str, date: NaiveDate, rows: &[HourlyStat]) -> DailyStat {
    let mut daily = DailyStat {
        keyword: keyword.to_string(),
        date,
        total_post_count: 0,
        total_comment_count: 0,
        positive_count: 0,
        neutral_count: 0,
        negative_count: 0,
        avg_sentiment_score: 0.0,
        top_keywords: Vec::new(),
        hourly_breakdown: vec![0; HOURS_PER_DAY],
    };

    let mut weighted_sum = 0.0;
    for row in rows {
        daily.total_post_count += row.post_count;
        daily.total_comment_count += row.comment_count;
        daily.positive_count += row.positive_count;
        daily.neutral_count += row.neutral_count;
        daily.negative_count += row.negative_count;
        daily.hourly_breakdown[hour_of_day(row.hour_timestamp)] += row.post_count;
        weighted_sum += row.avg_sentiment_score * row.post_count as f64;
    }
    if daily.total_post_count > 0 {
        daily.avg_sentiment_score = weighted_sum / daily.total_post_count as f64;
    }
    daily.top_keywords = recount_top_keywords(rows.iter().map(|r| r.top_keywords.as_slice()));
    daily
}

#[derive(Clone)]
pub struct DailyAggregator {
    store: Arc<dyn StatsStore>,
    cache: CacheService,
    consistency: CacheConsistencyManager,
}

impl DailyAggregator {
    pub fn new(
        store: Arc<dyn StatsStore>,
        cache: CacheService,
        consistency: CacheConsistencyManager,
    ) -> Self {
        Self {
            store,
            cache,
            consistency,
        }
    }

    /// Recompute every keyword's daily row for `date`. Only a failure to
    /// fetch the hourly rows is returned as an error.
    #[instrument(skip(self))]
    pub async fn rollup_from_hourly(&self, date: NaiveDate) -> Result<RollupReport> {
        let (start, end) = day_bounds(date);
        let rows = self.store.hourly_range(None, start, end).await?;

        let mut groups: BTreeMap<String, Vec<HourlyStat>> = BTreeMap::new();
        for row in rows {
            groups.entry(row.keyword.clone()).or_default().push(row);
        }

        let mut report = RollupReport {
            date,
            keywords_total: groups.len(),
            keywords_succeeded: 0,
            keywords_failed: 0,
            skipped: Vec::new(),
        };

        for (keyword, rows) in &groups {
            if let Err(reason) = validate_group(keyword, rows, start, end) {
                warn!(keyword = %keyword, %date, reason = %reason, "Skipping keyword rollup");
                report.skipped.push(keyword.clone());
                continue;
            }

            match self.write_daily(keyword, date, rows).await {
                Ok(()) => report.keywords_succeeded += 1,
                Err(e) => {
                    error!(keyword = %keyword, %date, error = %e, "Keyword rollup failed");
                    report.keywords_failed += 1;
                }
            }
        }

        info!(
            %date,
            total = report.keywords_total,
            succeeded = report.keywords_succeeded,
            failed = report.keywords_failed,
            skipped = report.skipped.len(),
            "Daily rollup finished"
        );
        Ok(report)
    }

    /// Roll up the previous UTC day
    pub async fn rollup_yesterday(&self) -> Result<RollupReport> {
        let yesterday = Utc::now().date_naive() - Duration::days(1);
        self.rollup_from_hourly(yesterday).await
    }

    async fn write_daily(&self, keyword: &str, date: NaiveDate, rows: &[HourlyStat]) -> Result<()> {
        let daily = build_daily(keyword, date, rows);
        self.store.save_daily(&daily).await?;

        let sweep_id = format!("rollup:{}:{}", date, keyword);
        let data = json!({
            "keyword": keyword,
            "date": date.format("%Y%m%d").to_string(),
        });
        if self
            .consistency
            .schedule_invalidation(&sweep_id, DAILY_STATS_UPDATE, &data)
        {
            self.consistency.execute_invalidations(&sweep_id).await;
        }
        Ok(())
    }

    /// Daily rows with `start <= date <= end`, ascending; empty when the
    /// bounds are inverted
    pub async fn get_daily_stats(
        &self,
        keyword: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyStat>> {
        if start > end {
            return Ok(Vec::new());
        }
        Ok(self.store.daily_range(keyword, start, end).await?)
    }

    /// Single row, served from the daily cache layer when possible
    pub async fn get_daily_stat(&self, keyword: &str, date: NaiveDate) -> Result<Option<DailyStat>> {
        let key = self.cache.keys().daily_key(keyword, date);
        if let Some(cached) = self.cache.get::<DailyStat>(&key).await {
            return Ok(Some(cached));
        }

        let stat = self.store.get_daily(keyword, date).await?;
        if let Some(stat) = &stat {
            self.cache
                .set(&key, stat, CacheLayer::Daily, Some(READ_FILL_TTL))
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
    use trendpulse_store::MemoryStatsStore;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn row(keyword: &str, hour: u32, posts: i64, avg: f64, keywords: &[&str]) -> HourlyStat {
        let mut stat = HourlyStat::empty(keyword, Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap());
        stat.post_count = posts;
        stat.comment_count = posts * 2;
        stat.positive_count = posts;
        stat.avg_sentiment_score = avg;
        stat.top_keywords = keywords.iter().map(|s| s.to_string()).collect();
        stat
    }

    fn setup() -> (DailyAggregator, MemoryStatsStore, CacheService) {
        let store = MemoryStatsStore::new();
        let cache = CacheService::new(Arc::new(MemoryCacheStore::new()), KeyBuilder::new("tp"));
        let consistency = CacheConsistencyManager::new(cache.clone());
        let daily = DailyAggregator::new(Arc::new(store.clone()), cache.clone(), consistency);
        (daily, store, cache)
    }

    #[test]
    fn test_build_daily_totals_and_breakdown() {
        let rows = vec![
            row("rust", 1, 3, 0.2, &["tokio", "serde"]),
            row("rust", 13, 1, 0.6, &["serde"]),
        ];
        let daily = build_daily("rust", day(), &rows);

        assert_eq!(daily.total_post_count, 4);
        assert_eq!(daily.total_comment_count, 8);
        assert_eq!(daily.positive_count, 4);
        assert_eq!(daily.hourly_breakdown.len(), 24);
        assert_eq!(daily.hourly_breakdown[1], 3);
        assert_eq!(daily.hourly_breakdown[13], 1);
        assert!((daily.avg_sentiment_score - 0.3).abs() < 1e-12);
        assert_eq!(daily.top_keywords, vec!["serde".to_string(), "tokio".to_string()]);
    }

    #[test]
    fn test_validate_group_rejects_bad_rows() {
        let (start, end) = day_bounds(day());
        assert!(validate_group("rust", &[], start, end).is_err());

        let mut negative = row("rust", 2, 1, 0.0, &[]);
        negative.post_count = -1;
        assert!(validate_group("rust", &[negative], start, end).is_err());

        let mut nan = row("rust", 2, 1, 0.0, &[]);
        nan.avg_sentiment_score = f64::NAN;
        assert!(validate_group("rust", &[nan], start, end).is_err());

        assert!(validate_group("rust", &[row("rust", 2, 1, 0.0, &[])], start, end).is_ok());
    }

    #[tokio::test]
    async fn test_rollup_is_idempotent() {
        let (daily, store, _) = setup();
        store.seed_hourly(row("rust", 0, 2, 0.5, &["a", "b"]));
        store.seed_hourly(row("rust", 23, 4, -0.25, &["b", "c"]));
        store.seed_hourly(row("go", 12, 1, 0.1, &["gc"]));

        let first_report = daily.rollup_from_hourly(day()).await.unwrap();
        let first = store.get_daily("rust", day()).await.unwrap().unwrap();
        let first_bytes = serde_json::to_vec(&first).unwrap();

        let second_report = daily.rollup_from_hourly(day()).await.unwrap();
        let second = store.get_daily("rust", day()).await.unwrap().unwrap();
        assert_eq!(first_bytes, serde_json::to_vec(&second).unwrap());
        assert_eq!(first_report, second_report);
        assert_eq!(first_report.keywords_succeeded, 2);
        assert_eq!(second.hourly_breakdown[23], 4);
    }

    #[tokio::test]
    async fn test_one_keyword_failure_does_not_stop_others() {
        let (daily, store, _) = setup();
        store.seed_hourly(row("rust", 1, 1, 0.1, &[]));
        store.seed_hourly(row("go", 1, 1, 0.1, &[]));
        let mut broken = row("zig", 1, 1, 0.1, &[]);
        broken.post_count = -5;
        store.seed_hourly(broken);
        store.fail_daily_writes_for("go", "disk full");

        let report = daily.rollup_from_hourly(day()).await.unwrap();
        assert_eq!(report.keywords_total, 3);
        assert_eq!(report.keywords_succeeded, 1);
        assert_eq!(report.keywords_failed, 1);
        assert_eq!(report.skipped, vec!["zig".to_string()]);
        assert!(store.get_daily("rust", day()).await.unwrap().is_some());
        assert!(store.get_daily("go", day()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_failure_is_raised() {
        let (daily, store, _) = setup();
        store.fail_next_range_reads(1, "connection reset");
        assert!(daily.rollup_from_hourly(day()).await.is_err());
    }

    #[tokio::test]
    async fn test_rollup_refreshes_cached_daily_row() {
        let (daily, store, cache) = setup();
        store.seed_hourly(row("rust", 5, 2, 0.0, &[]));
        daily.rollup_from_hourly(day()).await.unwrap();

        let cached = daily.get_daily_stat("rust", day()).await.unwrap().unwrap();
        assert_eq!(cached.total_post_count, 2);
        assert!(cache.exists(&cache.keys().daily_key("rust", day())).await);

        store.seed_hourly(row("rust", 6, 3, 0.0, &[]));
        daily.rollup_from_hourly(day()).await.unwrap();
        assert!(!cache.exists(&cache.keys().daily_key("rust", day())).await);
        let fresh = daily.get_daily_stat("rust", day()).await.unwrap().unwrap();
        assert_eq!(fresh.total_post_count, 5);
    }

    #[tokio::test]
    async fn test_daily_range_with_inverted_bounds_is_empty() {
        let (daily, store, _) = setup();
        store.seed_hourly(row("rust", 5, 2, 0.0, &[]));
        daily.rollup_from_hourly(day()).await.unwrap();

        let later = NaiveDate::from_ymd_opt(2024, 6, 5).unwrap();
        assert!(daily.get_daily_stats("rust", later, day()).await.unwrap().is_empty());
        assert_eq!(daily.get_daily_stats("rust", day(), later).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_read_fill_uses_short_ttl() {
        let store = MemoryStatsStore::new();
        let cache_store = MemoryCacheStore::new();
        let cache = CacheService::new(Arc::new(cache_store.clone()), KeyBuilder::new("tp"));
        let consistency = CacheConsistencyManager::new(cache.clone());
        let daily = DailyAggregator::new(Arc::new(store.clone()), cache.clone(), consistency);

        store.seed_hourly(row("rust", 5, 2, 0.0, &[]));
        daily.rollup_from_hourly(day()).await.unwrap();
        daily.get_daily_stat("rust", day()).await.unwrap();

        let key = cache.keys().daily_key("rust", day());
        let raw = cache_store.get(&key).await.unwrap().unwrap();
        let entry: CacheEntry<DailyStat> = serde_json::from_str(&raw).unwrap();
        assert_eq!(entry.ttl_secs, READ_FILL_TTL.as_secs());
    }
}
