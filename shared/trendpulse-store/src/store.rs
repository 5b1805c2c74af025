//! Store traits

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use trendpulse_core::{DailyStat, HourlyStat};

use crate::Result;

/// Transaction isolation levels understood by every backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// An open transaction holding one pooled session.
///
/// `commit` and `rollback` consume the session. Dropping an unfinished
/// transaction must never hand a half-open session back to the pool.
#[async_trait]
pub trait StoreTransaction: Send {
    fn isolation(&self) -> IsolationLevel;

    /// Load the hourly row for update, creating an empty one when absent
    async fn lock_hourly(&mut self, keyword: &str, hour: DateTime<Utc>) -> Result<HourlyStat>;

    async fn save_hourly(&mut self, stat: &HourlyStat) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Relational store holding the hourly and daily aggregate tables
#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn StoreTransaction>>;

    async fn get_hourly(&self, keyword: &str, hour: DateTime<Utc>) -> Result<Option<HourlyStat>>;

    /// Hourly rows with `start <= hour_timestamp < end`, ascending by hour.
    /// `None` returns every keyword.
    async fn hourly_range(
        &self,
        keyword: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HourlyStat>>;

    async fn get_daily(&self, keyword: &str, date: NaiveDate) -> Result<Option<DailyStat>>;

    /// Daily rows with `start <= date <= end`, ascending by date
    async fn daily_range(
        &self,
        keyword: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyStat>>;

    /// Insert or overwrite the daily row for (keyword, date)
    async fn save_daily(&self, stat: &DailyStat) -> Result<()>;

    async fn is_healthy(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_sql() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
        assert_eq!(
            format!("BEGIN ISOLATION LEVEL {}", IsolationLevel::RepeatableRead),
            "BEGIN ISOLATION LEVEL REPEATABLE READ"
        );
    }
}
