//! Hand-off point to the external metrics/alerting system
//!
//! Components report through a [`MetricsSink`] passed into their
//! constructors. Sinks are observational only: nothing they do can feed
//! back into aggregation or transaction control flow.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

/// A metric crossed a configured threshold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdBreach {
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub context: String,
}

pub trait MetricsSink: Send + Sync {
    fn increment(&self, _name: &str, _value: u64) {}

    fn observe(&self, _name: &str, _value: f64) {}

    fn gauge(&self, _name: &str, _value: f64) {}

    fn threshold_breached(&self, _breach: ThresholdBreach) {}
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {}

/// Writes metrics to the log stream
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn increment(&self, name: &str, value: u64) {
        tracing::trace!(metric = name, value, "counter");
    }

    fn observe(&self, name: &str, value: f64) {
        tracing::trace!(metric = name, value, "observation");
    }

    fn gauge(&self, name: &str, value: f64) {
        tracing::trace!(metric = name, value, "gauge");
    }

    fn threshold_breached(&self, breach: ThresholdBreach) {
        tracing::warn!(
            metric = %breach.metric,
            value = breach.value,
            threshold = breach.threshold,
            context = %breach.context,
            "Threshold breached"
        );
    }
}

/// Keeps everything in memory, for assertions in tests
#[derive(Default)]
pub struct RecordingSink {
    counters: Mutex<HashMap<String, u64>>,
    observations: Mutex<HashMap<String, Vec<f64>>>,
    breaches: Mutex<Vec<ThresholdBreach>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn observations(&self, name: &str) -> Vec<f64> {
        self.observations.lock().get(name).cloned().unwrap_or_default()
    }

    pub fn breaches(&self) -> Vec<ThresholdBreach> {
        self.breaches.lock().clone()
    }
}

impl MetricsSink for RecordingSink {
    fn increment(&self, name: &str, value: u64) {
        *self.counters.lock().entry(name.to_string()).or_insert(0) += value;
    }

    fn observe(&self, name: &str, value: f64) {
        self.observations
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    fn gauge(&self, name: &str, value: f64) {
        self.observe(name, value);
    }

    fn threshold_breached(&self, breach: ThresholdBreach) {
        self.breaches.lock().push(breach);
    }
}
