//! TrendPulse Core - Shared domain types and service infrastructure
//!
//! This crate provides:
//! - Sentiment events and the hourly/daily/window aggregate shapes
//! - Hour and day bucketing helpers
//! - Error handling utilities
//! - Configuration management
//! - Service lifecycle and signal handling

pub mod config;
pub mod domain;
pub mod error;
pub mod service;
pub mod time;

pub use config::ServiceConfig;
pub use domain::*;
pub use error::{Result, TrendPulseError};
pub use service::{
    DependencyStatus, HealthStatus, ReadinessStatus, ServiceRuntime, TrendPulseService,
};
