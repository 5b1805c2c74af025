//! Sliding window and realtime views
//!
//! Both are recomputed on read from the hourly/daily tables and cached
//! under their own layers; neither is ever persisted.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::debug;

use trendpulse_cache::{CacheLayer, CacheService};
use trendpulse_core::time::{day_bounds, truncate_to_hour};
use trendpulse_core::{
    DailyStat, HourlyStat, RealtimeMetrics, SentimentDistribution, TimeWindow, Trend,
    WindowMetrics,
};
use trendpulse_store::StatsStore;

use super::topk::recount_top_keywords;
use crate::error::Result;

/// Last-hour posts must differ from the trailing hourly mean by this
/// fraction before the trend leaves `Stable`
const TREND_BAND: f64 = 0.2;

/// One time bucket's contribution to a window
struct Bucket<'a> {
    posts: i64,
    comments: i64,
    avg: f64,
    sentiment: SentimentDistribution,
    keywords: &'a [String],
}

impl<'a> From<&'a HourlyStat> for Bucket<'a> {
    fn from(stat: &'a HourlyStat) -> Self {
        Self {
            posts: stat.post_count,
            comments: stat.comment_count,
            avg: stat.avg_sentiment_score,
            sentiment: stat.sentiment_distribution(),
            keywords: &stat.top_keywords,
        }
    }
}

impl<'a> From<&'a DailyStat> for Bucket<'a> {
    fn from(stat: &'a DailyStat) -> Self {
        Self {
            posts: stat.total_post_count,
            comments: stat.total_comment_count,
            avg: stat.avg_sentiment_score,
            sentiment: stat.sentiment_distribution(),
            keywords: &stat.top_keywords,
        }
    }
}

struct Totals {
    posts: i64,
    comments: i64,
    avg: f64,
    sentiment: SentimentDistribution,
    top_keywords: Vec<String>,
    buckets: usize,
}

fn merge_buckets(buckets: &[Bucket<'_>]) -> Totals {
    let mut totals = Totals {
        posts: 0,
        comments: 0,
        avg: 0.0,
        sentiment: SentimentDistribution::default(),
        top_keywords: Vec::new(),
        buckets: buckets.len(),
    };
    let mut weighted = 0.0;
    for bucket in buckets {
        totals.posts += bucket.posts;
        totals.comments += bucket.comments;
        totals.sentiment.merge(&bucket.sentiment);
        weighted += bucket.avg * bucket.posts as f64;
    }
    if totals.posts > 0 {
        totals.avg = weighted / totals.posts as f64;
    }
    totals.top_keywords = recount_top_keywords(buckets.iter().map(|b| b.keywords));
    totals
}

/// Compare the last hour with the mean hour of the trailing day
pub fn classify_trend(posts_last_hour: i64, posts_last_24h: i64) -> Trend {
    let hourly_mean = posts_last_24h as f64 / 24.0;
    let current = posts_last_hour as f64;
    if current > hourly_mean * (1.0 + TREND_BAND) {
        Trend::Rising
    } else if current < hourly_mean * (1.0 - TREND_BAND) {
        Trend::Falling
    } else {
        Trend::Stable
    }
}

#[derive(Clone)]
pub struct WindowAggregator {
    store: Arc<dyn StatsStore>,
    cache: CacheService,
}

impl WindowAggregator {
    pub fn new(store: Arc<dyn StatsStore>, cache: CacheService) -> Self {
        Self { store, cache }
    }

    pub async fn aggregate_window(&self, keyword: &str, window: TimeWindow) -> Result<WindowMetrics> {
        self.aggregate_window_at(keyword, window, Utc::now()).await
    }

    /// Window ending at `now`: the 24 hours up to and including the
    /// current hour, or the 7 completed days before today
    pub async fn aggregate_window_at(
        &self,
        keyword: &str,
        window: TimeWindow,
        now: DateTime<Utc>,
    ) -> Result<WindowMetrics> {
        let key = self.cache.keys().window_key(keyword, window.as_str());
        self.cache
            .get_or_compute(&key, CacheLayer::Window, || {
                self.compute_window(keyword, window, now)
            })
            .await
    }

    async fn compute_window(
        &self,
        keyword: &str,
        window: TimeWindow,
        now: DateTime<Utc>,
    ) -> Result<WindowMetrics> {
        let (start, end, totals) = match window {
            TimeWindow::Last24Hours => {
                let end = truncate_to_hour(now) + Duration::hours(1);
                let start = end - Duration::hours(24);
                let rows = self.store.hourly_range(Some(keyword), start, end).await?;
                let buckets: Vec<Bucket<'_>> = rows.iter().map(Bucket::from).collect();
                (start, end, merge_buckets(&buckets))
            }
            TimeWindow::Last7Days => {
                // Today has no daily row until tomorrow's rollup
                let last = now.date_naive() - Duration::days(1);
                let first = last - Duration::days(6);
                let rows = self.store.daily_range(keyword, first, last).await?;
                let buckets: Vec<Bucket<'_>> = rows.iter().map(Bucket::from).collect();
                (day_bounds(first).0, day_bounds(last).1, merge_buckets(&buckets))
            }
        };

        debug!(keyword, window = %window, buckets = totals.buckets, "Computed window");
        Ok(WindowMetrics {
            keyword: keyword.to_string(),
            window,
            start,
            end,
            total_posts: totals.posts,
            total_comments: totals.comments,
            sentiment: totals.sentiment,
            avg_sentiment_score: totals.avg,
            top_keywords: totals.top_keywords,
            bucket_count: totals.buckets,
            computed_at: now,
        })
    }

    pub async fn get_realtime_metrics(&self, keyword: &str) -> Result<RealtimeMetrics> {
        self.get_realtime_metrics_at(keyword, Utc::now()).await
    }

    pub async fn get_realtime_metrics_at(
        &self,
        keyword: &str,
        now: DateTime<Utc>,
    ) -> Result<RealtimeMetrics> {
        let key = self.cache.keys().realtime_key(keyword);
        self.cache
            .get_or_compute(&key, CacheLayer::Realtime, || self.compute_realtime(keyword, now))
            .await
    }

    async fn compute_realtime(&self, keyword: &str, now: DateTime<Utc>) -> Result<RealtimeMetrics> {
        let current_hour = truncate_to_hour(now);
        let end = current_hour + Duration::hours(1);

        let last_hour = self
            .store
            .hourly_range(Some(keyword), current_hour, end)
            .await?;
        let last_day = self
            .store
            .hourly_range(Some(keyword), end - Duration::hours(24), end)
            .await?;

        let hour_buckets: Vec<Bucket<'_>> = last_hour.iter().map(Bucket::from).collect();
        let day_buckets: Vec<Bucket<'_>> = last_day.iter().map(Bucket::from).collect();
        let hour = merge_buckets(&hour_buckets);
        let day = merge_buckets(&day_buckets);

        Ok(RealtimeMetrics {
            keyword: keyword.to_string(),
            posts_last_hour: hour.posts,
            posts_last_24h: day.posts,
            comments_last_24h: day.comments,
            avg_sentiment_last_hour: hour.avg,
            avg_sentiment_last_24h: day.avg,
            sentiment_last_24h: day.sentiment,
            top_keywords: day.top_keywords,
            trend: classify_trend(hour.posts, day.posts),
            computed_at: now,
        })
    }
}
