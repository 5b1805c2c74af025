//! TrendPulse relational store
//!
//! Durable home of the hourly and daily aggregate tables. The
//! [`StatsStore`] trait is the seam the aggregation engine programs
//! against; [`PgStatsStore`] talks to PostgreSQL through a deadpool
//! connection pool and [`MemoryStatsStore`] keeps everything in process.

mod error;
mod memory;
mod pool;
mod postgres;
mod store;

pub use error::{is_contention_message, Result, StoreError};
pub use memory::{MemoryStatsStore, MemoryStoreStats};
pub use pool::{PoolConfig, StatsPool};
pub use postgres::PgStatsStore;
pub use store::{IsolationLevel, StatsStore, StoreTransaction};

/// Re-export tokio-postgres types for convenience
pub use tokio_postgres::{types::ToSql, Row};
