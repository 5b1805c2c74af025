//! TrendPulse Telemetry
//!
//! Structured logging setup, in-process metric primitives and the sink
//! interface used to hand metrics and threshold breaches to an external
//! metrics/alerting system.

mod config;
mod metrics;
mod sink;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use metrics::{Counter, Gauge, Histogram, HistogramSnapshot};
pub use sink::{MetricsSink, NoopSink, RecordingSink, ThresholdBreach, TracingSink};
pub use tracing_setup::init_tracing;

/// Initialize all telemetry for a service
pub fn init(service_name: &str) -> Result<TelemetryGuard, TelemetryError> {
    let config = TelemetryConfig::from_env();
    init_tracing(service_name, &config)?;
    Ok(TelemetryGuard { _private: () })
}

/// Guard that flushes telemetry on drop
pub struct TelemetryGuard {
    _private: (),
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),
}
