//! Stats Aggregator - sentiment statistics for TrendPulse
//!
//! Consumes analysed posts and maintains per-keyword hourly and daily
//! aggregates plus rolling windows:
//! - Transactional writes with deadlock retry and backoff
//! - Hourly counters, daily rollups and 24h/7d window views
//! - Cache invalidation tied to transaction commit/rollback
//! - Duplicate-safe message processing

pub mod aggregation;
pub mod config;
pub mod consistency;
pub mod consumer;
pub mod error;
pub mod idempotency;
pub mod transaction;

pub use aggregation::{DailyAggregator, HourlyAggregator, HourlyUpdate, RollupReport, WindowAggregator};
pub use config::AggregatorConfig;
pub use consistency::CacheConsistencyManager;
pub use consumer::{EventConsumer, EventSource, JsonLinesSource, MemoryEventSource, PollReport};
pub use error::{AggregationError, Result, TransactionError};
pub use idempotency::{
    BatchOutcome, IdempotencyConfig, IdempotencyGuard, IdempotencyOutcome, ProcessingContext,
};
pub use transaction::{EngineConfig, TransactionEngine, TransactionOptions};
