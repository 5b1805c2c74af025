//! Aggregator configuration

use anyhow::Context;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use trendpulse_cache::MAX_TTL;
use trendpulse_store::IsolationLevel;

use crate::idempotency::IdempotencyConfig;
use crate::transaction::{EngineConfig, TransactionOptions};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub transaction: TransactionOptions,
    pub engine: EngineConfig,
    pub batch_size: usize,
    pub idempotency: IdempotencyConfig,
    /// How often the previous day's rollup is (re)run
    pub rollup_interval: Duration,
    /// Invalidation plans older than this are dropped
    pub stale_plan_age: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            transaction: TransactionOptions::default(),
            engine: EngineConfig::default(),
            batch_size: 100,
            idempotency: IdempotencyConfig::default(),
            rollup_interval: Duration::from_secs(3600),
            stale_plan_age: Duration::from_secs(300),
        }
    }
}

impl AggregatorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source; unset names take their defaults
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let transaction = TransactionOptions::new(
            IsolationLevel::ReadCommitted,
            parse_or(&lookup, "TX_RETRY_ON_DEADLOCK", true)?,
            parse_or(&lookup, "TX_MAX_RETRIES", 3)?,
            parse_or(&lookup, "TX_RETRY_DELAY_BASE_MS", 100)?,
        )
        .context("Invalid transaction options")?;

        let engine = EngineConfig {
            metrics_capacity: parse_or(&lookup, "TX_METRICS_CAPACITY", 1000)?,
            slow_threshold: Duration::from_millis(parse_or(&lookup, "TX_SLOW_THRESHOLD_MS", 1000)?),
        };

        let batch_size: usize = parse_or(&lookup, "TX_BATCH_SIZE", 100)?;
        if batch_size == 0 {
            anyhow::bail!("TX_BATCH_SIZE must be at least 1");
        }

        let idempotency = IdempotencyConfig {
            max_attempts: parse_or(&lookup, "IDEMPOTENCY_MAX_ATTEMPTS", 3)?,
            retry_delay: Duration::from_millis(parse_or(&lookup, "IDEMPOTENCY_RETRY_DELAY_MS", 1000)?),
            window: Duration::from_secs(parse_or(&lookup, "IDEMPOTENCY_WINDOW_SECS", 86400)?),
        };
        if idempotency.max_attempts == 0 {
            anyhow::bail!("IDEMPOTENCY_MAX_ATTEMPTS must be at least 1");
        }
        if idempotency.window.is_zero() || idempotency.window > MAX_TTL {
            anyhow::bail!(
                "IDEMPOTENCY_WINDOW_SECS must be between 1 and {}",
                MAX_TTL.as_secs()
            );
        }
        if idempotency.retry_delay > MAX_RETRY_DELAY {
            anyhow::bail!(
                "IDEMPOTENCY_RETRY_DELAY_MS must be at most {}",
                MAX_RETRY_DELAY.as_millis()
            );
        }

        let rollup_interval = Duration::from_secs(parse_or(&lookup, "ROLLUP_INTERVAL_SECS", 3600)?);
        let stale_plan_age = Duration::from_secs(parse_or(&lookup, "CONSISTENCY_STALE_SECS", 300)?);
        if rollup_interval.is_zero() || stale_plan_age.is_zero() {
            anyhow::bail!("ROLLUP_INTERVAL_SECS and CONSISTENCY_STALE_SECS must be positive");
        }

        Ok(Self {
            transaction,
            engine,
            batch_size,
            idempotency,
            rollup_interval,
            stale_plan_age,
        })
    }
}

fn parse_or<T, F>(lookup: &F, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", name, raw)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = assert_ok!(AggregatorConfig::from_lookup(lookup(&[])));
        assert_eq!(config.transaction, TransactionOptions::default());
        assert_eq!(config.engine.metrics_capacity, 1000);
        assert_eq!(config.engine.slow_threshold, Duration::from_secs(1));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.idempotency.max_attempts, 3);
        assert_eq!(config.idempotency.retry_delay, Duration::from_secs(1));
        assert_eq!(config.idempotency.window, Duration::from_secs(86400));
    }

    #[test]
    fn test_overrides() {
        let config = assert_ok!(AggregatorConfig::from_lookup(lookup(&[
            ("TX_MAX_RETRIES", "5"),
            ("TX_RETRY_DELAY_BASE_MS", "20"),
            ("TX_BATCH_SIZE", "25"),
            ("IDEMPOTENCY_WINDOW_SECS", "60"),
        ])));
        assert_eq!(config.transaction.max_retries, 5);
        assert_eq!(config.transaction.retry_delay_base(), Duration::from_millis(20));
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.idempotency.window, Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert_err!(AggregatorConfig::from_lookup(lookup(&[("TX_MAX_RETRIES", "lots")])));
        assert_err!(AggregatorConfig::from_lookup(lookup(&[("TX_MAX_RETRIES", "50")])));
        assert_err!(AggregatorConfig::from_lookup(lookup(&[("TX_RETRY_DELAY_BASE_MS", "0")])));
        assert_err!(AggregatorConfig::from_lookup(lookup(&[("TX_BATCH_SIZE", "0")])));
    }

    #[test]
    fn test_rejects_unbounded_idempotency_timing() {
        assert_err!(AggregatorConfig::from_lookup(lookup(&[("IDEMPOTENCY_WINDOW_SECS", "0")])));
        assert_err!(AggregatorConfig::from_lookup(lookup(&[(
            "IDEMPOTENCY_WINDOW_SECS",
            "30000000000000"
        )])));
        assert_err!(AggregatorConfig::from_lookup(lookup(&[(
            "IDEMPOTENCY_RETRY_DELAY_MS",
            "18446744073709551615"
        )])));
        assert_ok!(AggregatorConfig::from_lookup(lookup(&[(
            "IDEMPOTENCY_WINDOW_SECS",
            "31536000"
        )])));
    }
}
