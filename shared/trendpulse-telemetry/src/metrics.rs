//! Metrics primitives
//!
//! Lock-free counters and gauges plus a bounded sample histogram. These
//! are owned by the components that update them; nothing here is global.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonic counter
#[derive(Clone, Default)]
pub struct Counter {
    value: Arc<AtomicU64>,
    name: String,
}

impl Counter {
    pub fn new(name: &str) -> Self {
        Self {
            value: Arc::new(AtomicU64::new(0)),
            name: name.to_string(),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Gauge that can move in both directions
#[derive(Clone, Default)]
pub struct Gauge {
    value: Arc<AtomicI64>,
    name: String,
}

impl Gauge {
    pub fn new(name: &str) -> Self {
        Self {
            value: Arc::new(AtomicI64::new(0)),
            name: name.to_string(),
        }
    }

    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Summary of the samples currently held by a [`Histogram`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

/// Histogram over the most recent `max_samples` observations
#[derive(Clone)]
pub struct Histogram {
    samples: Arc<Mutex<VecDeque<f64>>>,
    name: String,
    max_samples: usize,
}

impl Histogram {
    pub fn new(name: &str) -> Self {
        Self::with_capacity(name, 10_000)
    }

    pub fn with_capacity(name: &str, max_samples: usize) -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(max_samples.min(1024)))),
            name: name.to_string(),
            max_samples: max_samples.max(1),
        }
    }

    pub fn record(&self, value: f64) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.max_samples {
            samples.pop_front();
        }
        samples.push_back(value);
    }

    pub fn percentile(&self, p: f64) -> f64 {
        let sorted = self.sorted_samples();
        percentile_of(&sorted, p)
    }

    pub fn mean(&self) -> f64 {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<f64>() / samples.len() as f64
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let sorted = self.sorted_samples();
        if sorted.is_empty() {
            return HistogramSnapshot::default();
        }
        HistogramSnapshot {
            count: sorted.len(),
            mean: sorted.iter().sum::<f64>() / sorted.len() as f64,
            p50: percentile_of(&sorted, 50.0),
            p95: percentile_of(&sorted, 95.0),
            p99: percentile_of(&sorted, 99.0),
            max: sorted[sorted.len() - 1],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn sorted_samples(&self) -> Vec<f64> {
        let mut sorted: Vec<f64> = self.samples.lock().iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        sorted
    }
}

fn percentile_of(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("cache_hits");
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge_goes_negative_safely() {
        let gauge = Gauge::new("in_flight");
        gauge.inc();
        gauge.dec();
        gauge.dec();
        assert_eq!(gauge.get(), -1);
        gauge.set(3);
        assert_eq!(gauge.get(), 3);
    }

    #[test]
    fn test_histogram_percentiles() {
        let hist = Histogram::new("tx_duration_ms");
        for v in [5.0, 1.0, 4.0, 2.0, 3.0] {
            hist.record(v);
        }
        assert!((hist.mean() - 3.0).abs() < 0.001);
        assert!((hist.percentile(50.0) - 3.0).abs() < 0.001);

        let snap = hist.snapshot();
        assert_eq!(snap.count, 5);
        assert_eq!(snap.max, 5.0);
    }

    #[test]
    fn test_histogram_is_bounded() {
        let hist = Histogram::with_capacity("bounded", 3);
        for v in 0..10 {
            hist.record(v as f64);
        }
        let snap = hist.snapshot();
        assert_eq!(snap.count, 3);
        assert!((snap.mean - 8.0).abs() < 0.001);
    }
}
