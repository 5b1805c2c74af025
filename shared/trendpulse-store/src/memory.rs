//! In-process stats store
//!
//! Used by tests and single-node development runs. Transactions are
//! serialized through one writer lock, which gives the same outcome as
//! row-level locking for the single-row updates the aggregator issues.
//! Writes are buffered per transaction and applied only on commit.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

use trendpulse_core::{DailyStat, HourlyStat};

use crate::store::{IsolationLevel, StatsStore, StoreTransaction};
use crate::{Result, StoreError};

type HourlyKey = (String, DateTime<Utc>);
type DailyKey = (String, NaiveDate);

#[derive(Default)]
struct Tables {
    hourly: BTreeMap<HourlyKey, HourlyStat>,
    daily: BTreeMap<DailyKey, DailyStat>,
}

#[derive(Default)]
struct FaultPlan {
    begin: VecDeque<String>,
    commit: VecDeque<String>,
    range_reads: VecDeque<String>,
    daily_writes: BTreeMap<String, String>,
}

#[derive(Default)]
struct Counters {
    begins: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// Snapshot of transaction activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub begins: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub hourly_rows: usize,
    pub daily_rows: usize,
}

#[derive(Clone, Default)]
pub struct MemoryStatsStore {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Mutex<FaultPlan>>,
    counters: Arc<Counters>,
    writer: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `begin` fail with `message`
    pub fn fail_next_begins(&self, n: usize, message: &str) {
        let mut faults = self.faults.lock();
        faults.begin.extend(std::iter::repeat(message.to_string()).take(n));
    }

    /// Make the next `n` commits fail with `message`
    pub fn fail_next_commits(&self, n: usize, message: &str) {
        let mut faults = self.faults.lock();
        faults.commit.extend(std::iter::repeat(message.to_string()).take(n));
    }

    /// Make the next `n` hourly range reads fail with `message`
    pub fn fail_next_range_reads(&self, n: usize, message: &str) {
        let mut faults = self.faults.lock();
        faults
            .range_reads
            .extend(std::iter::repeat(message.to_string()).take(n));
    }

    /// Make every daily write for `keyword` fail with `message`
    pub fn fail_daily_writes_for(&self, keyword: &str, message: &str) {
        self.faults
            .lock()
            .daily_writes
            .insert(keyword.to_string(), message.to_string());
    }

    /// Write an hourly row directly, bypassing transactions
    pub fn seed_hourly(&self, stat: HourlyStat) {
        self.tables
            .lock()
            .hourly
            .insert((stat.keyword.clone(), stat.hour_timestamp), stat);
    }

    /// Write a daily row directly, bypassing the rollup
    pub fn seed_daily(&self, stat: DailyStat) {
        self.tables
            .lock()
            .daily
            .insert((stat.keyword.clone(), stat.date), stat);
    }

    pub fn stats(&self) -> MemoryStoreStats {
        let tables = self.tables.lock();
        MemoryStoreStats {
            begins: self.counters.begins.load(Ordering::Relaxed),
            commits: self.counters.commits.load(Ordering::Relaxed),
            rollbacks: self.counters.rollbacks.load(Ordering::Relaxed),
            hourly_rows: tables.hourly.len(),
            daily_rows: tables.daily.len(),
        }
    }
}

#[async_trait]
impl StatsStore for MemoryStatsStore {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn StoreTransaction>> {
        self.counters.begins.fetch_add(1, Ordering::Relaxed);
        let fault = self.faults.lock().begin.pop_front();
        if let Some(message) = fault {
            return Err(StoreError::Conflict(message));
        }

        let guard = self.writer.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            isolation,
            writes: BTreeMap::new(),
            _guard: guard,
        }))
    }

    async fn get_hourly(&self, keyword: &str, hour: DateTime<Utc>) -> Result<Option<HourlyStat>> {
        Ok(self
            .tables
            .lock()
            .hourly
            .get(&(keyword.to_string(), hour))
            .cloned())
    }

    async fn hourly_range(
        &self,
        keyword: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HourlyStat>> {
        let fault = self.faults.lock().range_reads.pop_front();
        if let Some(message) = fault {
            return Err(StoreError::Conflict(message));
        }

        let tables = self.tables.lock();
        let mut rows: Vec<HourlyStat> = tables
            .hourly
            .values()
            .filter(|s| keyword.map_or(true, |k| s.keyword == k))
            .filter(|s| s.hour_timestamp >= start && s.hour_timestamp < end)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.hour_timestamp
                .cmp(&b.hour_timestamp)
                .then_with(|| a.keyword.cmp(&b.keyword))
        });
        Ok(rows)
    }

    async fn get_daily(&self, keyword: &str, date: NaiveDate) -> Result<Option<DailyStat>> {
        Ok(self
            .tables
            .lock()
            .daily
            .get(&(keyword.to_string(), date))
            .cloned())
    }

    async fn daily_range(
        &self,
        keyword: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyStat>> {
        if start > end {
            return Ok(Vec::new());
        }
        let tables = self.tables.lock();
        Ok(tables
            .daily
            .range((keyword.to_string(), start)..=(keyword.to_string(), end))
            .map(|(_, stat)| stat.clone())
            .collect())
    }

    async fn save_daily(&self, stat: &DailyStat) -> Result<()> {
        let fault = self.faults.lock().daily_writes.get(&stat.keyword).cloned();
        if let Some(message) = fault {
            return Err(StoreError::Conflict(message));
        }
        self.tables
            .lock()
            .daily
            .insert((stat.keyword.clone(), stat.date), stat.clone());
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

struct MemoryTransaction {
    store: MemoryStatsStore,
    isolation: IsolationLevel,
    writes: BTreeMap<HourlyKey, HourlyStat>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    async fn lock_hourly(&mut self, keyword: &str, hour: DateTime<Utc>) -> Result<HourlyStat> {
        let key = (keyword.to_string(), hour);
        if let Some(pending) = self.writes.get(&key) {
            return Ok(pending.clone());
        }
        let committed = self.store.tables.lock().hourly.get(&key).cloned();
        Ok(committed.unwrap_or_else(|| HourlyStat::empty(keyword, hour)))
    }

    async fn save_hourly(&mut self, stat: &HourlyStat) -> Result<()> {
        self.writes
            .insert((stat.keyword.clone(), stat.hour_timestamp), stat.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { store, writes, .. } = *self;

        let fault = store.faults.lock().commit.pop_front();
        if let Some(message) = fault {
            store.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::Conflict(message));
        }

        let mut tables = store.tables.lock();
        tables.hourly.extend(writes);
        store.counters.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.store.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
