//! Core domain types shared by the store, cache and aggregation layers

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TrendPulseError;
use crate::time::truncate_to_hour;

/// Maximum number of keywords retained in any top-keyword list
pub const TOP_KEYWORDS_LIMIT: usize = 10;

/// Number of hourly slots in a daily breakdown
pub const HOURS_PER_DAY: usize = 24;

/// Sentiment classification attached to a post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

impl SentimentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SentimentLabel {
    type Err = TrendPulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "positive" => Ok(Self::Positive),
            "neutral" => Ok(Self::Neutral),
            "negative" => Ok(Self::Negative),
            other => Err(TrendPulseError::Validation(format!(
                "unknown sentiment label: {}",
                other
            ))),
        }
    }
}

/// Sentiment analysis result for a single post
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub score: f64,
    pub label: SentimentLabel,
}

/// Decoded analysis event delivered by the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentimentEvent {
    /// Broker message id, used for deduplication
    pub id: String,
    pub keyword: String,
    pub post_id: String,
    pub content: String,
    pub sentiment: Sentiment,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_count: Option<i64>,
}

/// Counts of posts per sentiment label
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentimentDistribution {
    pub positive: i64,
    pub neutral: i64,
    pub negative: i64,
}

impl SentimentDistribution {
    pub fn total(&self) -> i64 {
        self.positive + self.neutral + self.negative
    }

    pub fn record(&mut self, label: SentimentLabel) {
        match label {
            SentimentLabel::Positive => self.positive += 1,
            SentimentLabel::Neutral => self.neutral += 1,
            SentimentLabel::Negative => self.negative += 1,
        }
    }

    pub fn merge(&mut self, other: &SentimentDistribution) {
        self.positive += other.positive;
        self.neutral += other.neutral;
        self.negative += other.negative;
    }
}

/// Aggregate row for one keyword within one hour
///
/// `post_count` only ever increases. The sentiment counters may lag behind
/// it since labels are not required on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyStat {
    pub keyword: String,
    pub hour_timestamp: DateTime<Utc>,
    pub post_count: i64,
    pub comment_count: i64,
    pub positive_count: i64,
    pub neutral_count: i64,
    pub negative_count: i64,
    pub avg_sentiment_score: f64,
    /// Most frequent first, at most [`TOP_KEYWORDS_LIMIT`] entries
    pub top_keywords: Vec<String>,
}

impl HourlyStat {
    /// Empty row for a (keyword, hour) pair seen for the first time
    pub fn empty(keyword: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            keyword: keyword.to_string(),
            hour_timestamp: truncate_to_hour(timestamp),
            post_count: 0,
            comment_count: 0,
            positive_count: 0,
            neutral_count: 0,
            negative_count: 0,
            avg_sentiment_score: 0.0,
            top_keywords: Vec::new(),
        }
    }

    pub fn sentiment_distribution(&self) -> SentimentDistribution {
        SentimentDistribution {
            positive: self.positive_count,
            neutral: self.neutral_count,
            negative: self.negative_count,
        }
    }

    pub fn record_label(&mut self, label: SentimentLabel) {
        match label {
            SentimentLabel::Positive => self.positive_count += 1,
            SentimentLabel::Neutral => self.neutral_count += 1,
            SentimentLabel::Negative => self.negative_count += 1,
        }
    }
}

/// Aggregate row for one keyword within one calendar day, rebuilt from
/// that day's hourly rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStat {
    pub keyword: String,
    pub date: NaiveDate,
    pub total_post_count: i64,
    pub total_comment_count: i64,
    pub positive_count: i64,
    pub neutral_count: i64,
    pub negative_count: i64,
    pub avg_sentiment_score: f64,
    pub top_keywords: Vec<String>,
    /// Post count per hour of day, always [`HOURS_PER_DAY`] slots
    pub hourly_breakdown: Vec<i64>,
}

impl DailyStat {
    pub fn sentiment_distribution(&self) -> SentimentDistribution {
        SentimentDistribution {
            positive: self.positive_count,
            neutral: self.neutral_count,
            negative: self.negative_count,
        }
    }
}

/// Sliding ranges served by window aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeWindow {
    #[serde(rename = "last_24h")]
    Last24Hours,
    #[serde(rename = "last_7d")]
    Last7Days,
}

impl TimeWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Last24Hours => "last_24h",
            Self::Last7Days => "last_7d",
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeWindow {
    type Err = TrendPulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last_24h" => Ok(Self::Last24Hours),
            "last_7d" => Ok(Self::Last7Days),
            other => Err(TrendPulseError::Validation(format!(
                "unsupported window: {}",
                other
            ))),
        }
    }
}

/// Window aggregate computed on read; cached, never persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowMetrics {
    pub keyword: String,
    pub window: TimeWindow,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_posts: i64,
    pub total_comments: i64,
    pub sentiment: SentimentDistribution,
    pub avg_sentiment_score: f64,
    pub top_keywords: Vec<String>,
    /// Number of source buckets (hours or days) that contributed
    pub bucket_count: usize,
    pub computed_at: DateTime<Utc>,
}

/// Direction of the last hour relative to the trailing day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Rising,
    Falling,
    Stable,
}

/// Compact last-hour / last-day summary for live dashboards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeMetrics {
    pub keyword: String,
    pub posts_last_hour: i64,
    pub posts_last_24h: i64,
    pub comments_last_24h: i64,
    pub avg_sentiment_last_hour: f64,
    pub avg_sentiment_last_24h: f64,
    pub sentiment_last_24h: SentimentDistribution,
    pub top_keywords: Vec<String>,
    pub trend: Trend,
    pub computed_at: DateTime<Utc>,
}
