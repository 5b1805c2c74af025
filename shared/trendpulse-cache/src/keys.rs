//! Cache layers and key construction
//!
//! Keys look like `{prefix}:{layer}:{segment}:...:{digest}`. Segments are
//! stripped to `[A-Za-z0-9_-]` so user input can neither add separators
//! nor smuggle glob characters into invalidation patterns. The trailing
//! digest is taken over the raw, unsanitized segments, so two inputs that
//! sanitize to the same text still land on different keys.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

/// Named cache tier with its own default TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLayer {
    Realtime,
    Hourly,
    Daily,
    Window,
    Archive,
}

impl CacheLayer {
    pub const ALL: [CacheLayer; 5] = [
        CacheLayer::Realtime,
        CacheLayer::Hourly,
        CacheLayer::Daily,
        CacheLayer::Window,
        CacheLayer::Archive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Window => "window",
            Self::Archive => "archive",
        }
    }

    pub fn default_ttl(&self) -> Duration {
        let secs = match self {
            Self::Realtime => 300,
            Self::Hourly => 7_200,
            Self::Daily => 86_400,
            Self::Window => 3_600,
            Self::Archive => 2_592_000,
        };
        Duration::from_secs(secs)
    }
}

impl fmt::Display for CacheLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strip everything outside `[A-Za-z0-9_-]`; an empty result becomes `_`
pub fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

fn digest8(input: &str) -> String {
    let hash = Sha256::digest(input.as_bytes());
    hex::encode(&hash[..4])
}

/// Builds every key and invalidation pattern the services use
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new("tp")
    }
}

impl KeyBuilder {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: sanitize_segment(prefix),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Generic key for a layer and ordered segment tuple
    pub fn build(&self, layer: CacheLayer, segments: &[&str]) -> String {
        let sanitized: Vec<String> = segments.iter().map(|s| sanitize_segment(s)).collect();
        let raw = format!("{}:{}:{}", self.prefix, layer.as_str(), segments.join(":"));
        format!(
            "{}:{}:{}:{}",
            self.prefix,
            layer.as_str(),
            sanitized.join(":"),
            digest8(&raw)
        )
    }

    pub fn hourly_key(&self, keyword: &str, hour: DateTime<Utc>) -> String {
        let hour = hour.format("%Y%m%d%H").to_string();
        self.build(CacheLayer::Hourly, &[keyword, &hour])
    }

    pub fn daily_key(&self, keyword: &str, date: NaiveDate) -> String {
        let date = date.format("%Y%m%d").to_string();
        self.build(CacheLayer::Daily, &[keyword, &date])
    }

    pub fn window_key(&self, keyword: &str, window: &str) -> String {
        self.build(CacheLayer::Window, &[keyword, window])
    }

    pub fn realtime_key(&self, keyword: &str) -> String {
        self.build(CacheLayer::Realtime, &[keyword])
    }

    /// Marker proving a broker message was already processed
    pub fn processed_key(&self, message_id: &str) -> String {
        let raw = format!("{}:processed:{}", self.prefix, message_id);
        format!(
            "{}:processed:{}:{}",
            self.prefix,
            sanitize_segment(message_id),
            digest8(&raw)
        )
    }

    /// Pattern matching every key of `layer` whose first segment is `keyword`
    pub fn keyword_pattern(&self, layer: CacheLayer, keyword: &str) -> String {
        format!(
            "{}:{}:{}:*",
            self.prefix,
            layer.as_str(),
            sanitize_segment(keyword)
        )
    }

    /// Pattern matching every key of `layer`
    pub fn layer_pattern(&self, layer: CacheLayer) -> String {
        format!("{}:{}:*", self.prefix, layer.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use glob::Pattern;

    fn matches(pattern: &str, key: &str) -> bool {
        Pattern::new(pattern).unwrap().matches(key)
    }

    #[test]
    fn test_layer_default_ttls() {
        assert_eq!(CacheLayer::Realtime.default_ttl(), Duration::from_secs(300));
        assert_eq!(CacheLayer::Hourly.default_ttl(), Duration::from_secs(7200));
        assert_eq!(CacheLayer::Daily.default_ttl(), Duration::from_secs(86400));
        assert_eq!(CacheLayer::Window.default_ttl(), Duration::from_secs(3600));
        assert_eq!(CacheLayer::Archive.default_ttl(), Duration::from_secs(2_592_000));
    }

    #[test]
    fn test_sanitize_strips_separators_and_globs() {
        assert_eq!(sanitize_segment("rust-lang_2024"), "rust-lang_2024");
        assert_eq!(sanitize_segment("a:b*c?d [e]"), "abcde");
        assert_eq!(sanitize_segment("!!!"), "_");
    }

    #[test]
    fn test_keys_are_deterministic_with_digest_suffix() {
        let keys = KeyBuilder::new("tp");
        let hour = Utc.with_ymd_and_hms(2024, 6, 1, 13, 0, 0).unwrap();
        let a = keys.hourly_key("rust", hour);
        let b = keys.hourly_key("rust", hour);
        assert_eq!(a, b);
        assert!(a.starts_with("tp:hourly:rust:2024060113:"));

        let digest = a.rsplit(':').next().unwrap();
        assert_eq!(digest.len(), 8);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sanitized_collisions_get_distinct_digests() {
        let keys = KeyBuilder::default();
        let a = keys.realtime_key("c++");
        let b = keys.realtime_key("c");
        assert_ne!(a, b);
        assert!(a.starts_with("tp:realtime:c:"));
    }

    #[test]
    fn test_injection_cannot_widen_patterns() {
        let keys = KeyBuilder::default();
        let pattern = keys.keyword_pattern(CacheLayer::Hourly, "*");
        assert_eq!(pattern, "tp:hourly:_:*");
        assert!(!matches(&pattern, &keys.hourly_key("rust", Utc::now())));
    }

    #[test]
    fn test_keyword_pattern_matches_only_that_keyword() {
        let keys = KeyBuilder::default();
        let hour = Utc.with_ymd_and_hms(2024, 6, 1, 13, 0, 0).unwrap();
        let pattern = keys.keyword_pattern(CacheLayer::Hourly, "rust");
        assert!(matches(&pattern, &keys.hourly_key("rust", hour)));
        assert!(!matches(&pattern, &keys.hourly_key("rust-lang", hour)));
        assert!(!matches(&pattern, &keys.daily_key("rust", hour.date_naive())));
    }

    #[test]
    fn test_layer_pattern_spans_keywords() {
        let keys = KeyBuilder::default();
        let pattern = keys.layer_pattern(CacheLayer::Window);
        assert!(matches(&pattern, &keys.window_key("rust", "last_24h")));
        assert!(matches(&pattern, &keys.window_key("go", "last_7d")));
        assert!(!matches(&pattern, &keys.realtime_key("rust")));
    }
}
