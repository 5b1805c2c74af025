//! Rule-driven cache consistency

mod manager;
mod rules;

pub use manager::{CacheConsistencyManager, ConsistencyStats};
pub use rules::{
    default_rules, substitute, InvalidationRule, RuleCondition, DAILY_STATS_UPDATE,
    HOURLY_STATS_UPDATE, KEYWORD_PURGE, SENTIMENT_UPDATE,
};
