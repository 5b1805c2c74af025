//! Invalidation rules
//!
//! A rule names a kind of write and lists the cache key patterns that
//! write makes stale. Patterns may carry `{field}` placeholders filled in
//! from the event data at scheduling time.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use trendpulse_cache::{sanitize_segment, CacheLayer};

pub const HOURLY_STATS_UPDATE: &str = "hourly-stats-update";
pub const DAILY_STATS_UPDATE: &str = "daily-stats-update";
pub const SENTIMENT_UPDATE: &str = "sentiment-update";
pub const KEYWORD_PURGE: &str = "keyword-purge";

pub type RuleCondition = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct InvalidationRule {
    pub key: String,
    pub patterns: Vec<String>,
    /// The rule only fires when this returns true for the event data
    pub condition: Option<RuleCondition>,
    pub description: String,
}

impl fmt::Debug for InvalidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationRule")
            .field("key", &self.key)
            .field("patterns", &self.patterns)
            .field("conditional", &self.condition.is_some())
            .finish()
    }
}

impl InvalidationRule {
    pub fn new(key: &str, patterns: Vec<String>, description: &str) -> Self {
        Self {
            key: key.to_string(),
            patterns,
            condition: None,
            description: description.to_string(),
        }
    }

    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn applies_to(&self, data: &Value) -> bool {
        self.condition.as_ref().map_or(true, |condition| condition(data))
    }

    /// Substitute placeholders in every pattern. Patterns whose fields are
    /// missing from `data` are skipped and logged.
    pub fn resolve(&self, data: &Value) -> Vec<String> {
        self.patterns
            .iter()
            .filter_map(|pattern| match substitute(pattern, data) {
                Ok(resolved) => Some(resolved),
                Err(field) => {
                    warn!(rule = %self.key, pattern = %pattern, field = %field, "Missing placeholder value");
                    None
                }
            })
            .collect()
    }
}

fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Fill `{field}` placeholders from `data`. Values are sanitized like key
/// segments so they cannot widen the pattern. Returns the first missing
/// field on failure.
pub fn substitute(pattern: &str, data: &Value) -> Result<String, String> {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return Ok(out);
        };
        let field = &after[..close];
        let value = data
            .get(field)
            .and_then(field_text)
            .ok_or_else(|| field.to_string())?;
        out.push_str(&sanitize_segment(&value));
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Rules every aggregator instance starts with
pub fn default_rules(prefix: &str) -> Vec<InvalidationRule> {
    let layer = |layer: CacheLayer, tail: &str| format!("{}:{}:{}", prefix, layer.as_str(), tail);

    vec![
        InvalidationRule::new(
            HOURLY_STATS_UPDATE,
            vec![
                layer(CacheLayer::Hourly, "{keyword}:{hour}:*"),
                layer(CacheLayer::Window, "{keyword}:*"),
                layer(CacheLayer::Realtime, "{keyword}:*"),
            ],
            "Hourly row changed",
        ),
        InvalidationRule::new(
            DAILY_STATS_UPDATE,
            vec![
                layer(CacheLayer::Daily, "{keyword}:{date}:*"),
                layer(CacheLayer::Window, "{keyword}:*"),
            ],
            "Daily rollup rewrote a row",
        ),
        InvalidationRule::new(
            SENTIMENT_UPDATE,
            vec![
                layer(CacheLayer::Realtime, "{keyword}:*"),
                layer(CacheLayer::Window, "{keyword}:*"),
            ],
            "Sentiment counters moved",
        )
        .when(|data| data.get("sentiment").map_or(false, |s| !s.is_null())),
        InvalidationRule::new(
            KEYWORD_PURGE,
            CacheLayer::ALL
                .iter()
                .map(|l| layer(*l, "{keyword}:*"))
                .collect(),
            "Every cached view of a keyword",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_substitute_sanitizes_values() {
        let data = json!({"keyword": "rust*lang", "hour": "2024060113"});
        assert_eq!(
            substitute("tp:hourly:{keyword}:{hour}:*", &data).unwrap(),
            "tp:hourly:rustlang:2024060113:*"
        );
    }

    #[test]
    fn test_substitute_reports_missing_field() {
        let data = json!({"keyword": "rust"});
        assert_eq!(
            substitute("tp:daily:{keyword}:{date}:*", &data).unwrap_err(),
            "date"
        );
    }

    #[test]
    fn test_numbers_substituted() {
        let data = json!({"keyword": "rust", "date": 20240601});
        assert_eq!(
            substitute("tp:daily:{keyword}:{date}:*", &data).unwrap(),
            "tp:daily:rust:20240601:*"
        );
    }

    #[test]
    fn test_sentiment_rule_gated() {
        let rules = default_rules("tp");
        let sentiment = rules.iter().find(|r| r.key == SENTIMENT_UPDATE).unwrap();
        assert!(!sentiment.applies_to(&json!({"keyword": "rust"})));
        assert!(!sentiment.applies_to(&json!({"keyword": "rust", "sentiment": null})));
        assert!(sentiment.applies_to(&json!({"keyword": "rust", "sentiment": 0.4})));
    }

    #[test]
    fn test_purge_covers_every_layer() {
        let rules = default_rules("tp");
        let purge = rules.iter().find(|r| r.key == KEYWORD_PURGE).unwrap();
        let patterns = purge.resolve(&json!({"keyword": "rust"}));
        assert_eq!(patterns.len(), CacheLayer::ALL.len());
        assert!(patterns.contains(&"tp:archive:rust:*".to_string()));
    }
}
