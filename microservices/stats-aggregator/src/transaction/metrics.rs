//! Per-attempt transaction log and the statistics derived from it

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use trendpulse_store::IsolationLevel;

/// One transaction attempt
#[derive(Debug, Clone, Serialize)]
pub struct TransactionMetric {
    pub operation: String,
    pub transaction_id: String,
    pub duration_ms: f64,
    /// Attempt number this entry describes, starting at 1
    pub attempts: u32,
    pub success: bool,
    pub isolation: IsolationLevel,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationStats {
    pub count: usize,
    pub failures: usize,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransactionStatistics {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub avg_attempts: f64,
    pub contention_retries: u64,
    pub slow_transactions: u64,
    pub by_operation: BTreeMap<String, OperationStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionHealth {
    pub healthy: bool,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub sample_size: usize,
}

/// Bounded log; once over capacity the oldest fifth is dropped in one go
pub struct MetricsLog {
    entries: Mutex<VecDeque<TransactionMetric>>,
    capacity: usize,
}

impl MetricsLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
        }
    }

    pub fn push(&self, metric: TransactionMetric) {
        let mut entries = self.entries.lock();
        entries.push_back(metric);
        if entries.len() > self.capacity {
            let trim = (self.capacity / 5).max(1);
            entries.drain(..trim);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn recent(&self, limit: usize) -> Vec<TransactionMetric> {
        let entries = self.entries.lock();
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn statistics(&self, contention_retries: u64, slow_transactions: u64) -> TransactionStatistics {
        let entries = self.entries.lock();
        let total = entries.len();
        let successful = entries.iter().filter(|m| m.success).count();

        let mut by_operation: BTreeMap<String, OperationStats> = BTreeMap::new();
        let mut duration_sum = 0.0;
        let mut attempt_sum = 0u64;
        for metric in entries.iter() {
            duration_sum += metric.duration_ms;
            attempt_sum += u64::from(metric.attempts);

            let op = by_operation.entry(metric.operation.clone()).or_default();
            op.avg_duration_ms =
                (op.avg_duration_ms * op.count as f64 + metric.duration_ms) / (op.count + 1) as f64;
            op.count += 1;
            if !metric.success {
                op.failures += 1;
            }
        }

        let ratio = |n: f64| if total > 0 { n / total as f64 } else { 0.0 };
        TransactionStatistics {
            total,
            successful,
            failed: total - successful,
            success_rate: if total > 0 { successful as f64 / total as f64 } else { 1.0 },
            avg_duration_ms: ratio(duration_sum),
            avg_attempts: ratio(attempt_sum as f64),
            contention_retries,
            slow_transactions,
            by_operation,
        }
    }

    /// Healthy while at least `min_success_rate` of retained attempts
    /// succeeded and the mean duration stays under `slow_threshold`
    pub fn health(&self, min_success_rate: f64, slow_threshold: Duration) -> TransactionHealth {
        let stats = self.statistics(0, 0);
        let slow_ms = slow_threshold.as_secs_f64() * 1000.0;
        TransactionHealth {
            healthy: stats.success_rate >= min_success_rate && stats.avg_duration_ms < slow_ms,
            success_rate: stats.success_rate,
            avg_duration_ms: stats.avg_duration_ms,
            sample_size: stats.total,
        }
    }
}
