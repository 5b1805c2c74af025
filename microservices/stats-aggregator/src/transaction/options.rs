//! Transaction retry policy

use serde::{Deserialize, Serialize};
use std::time::Duration;
use trendpulse_store::IsolationLevel;
use validator::Validate;

use crate::error::TransactionError;

/// Isolation and retry settings for one `execute_in_transaction` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct TransactionOptions {
    pub isolation: IsolationLevel,
    /// Retry when the store reports a deadlock or serialization failure
    pub retry_on_deadlock: bool,
    /// Retries after the first attempt
    #[validate(range(max = 10))]
    pub max_retries: u32,
    /// First backoff step; doubles on each further retry
    #[validate(range(min = 1, max = 60000))]
    pub retry_delay_base_ms: u64,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::ReadCommitted,
            retry_on_deadlock: true,
            max_retries: 3,
            retry_delay_base_ms: 100,
        }
    }
}

impl TransactionOptions {
    pub fn new(
        isolation: IsolationLevel,
        retry_on_deadlock: bool,
        max_retries: u32,
        retry_delay_base_ms: u64,
    ) -> Result<Self, TransactionError> {
        let options = Self {
            isolation,
            retry_on_deadlock,
            max_retries,
            retry_delay_base_ms,
        };
        options.check()?;
        Ok(options)
    }

    /// Hot single-row writes such as hourly counter updates
    pub fn critical() -> Self {
        Self {
            isolation: IsolationLevel::ReadCommitted,
            retry_on_deadlock: true,
            max_retries: 3,
            retry_delay_base_ms: 50,
        }
    }

    /// Consistent multi-row reads; never retried
    pub fn read_only() -> Self {
        Self {
            isolation: IsolationLevel::RepeatableRead,
            retry_on_deadlock: false,
            max_retries: 0,
            retry_delay_base_ms: 100,
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay_base(mut self, base: Duration) -> Self {
        self.retry_delay_base_ms = base.as_millis() as u64;
        self
    }

    pub fn retry_delay_base(&self) -> Duration {
        Duration::from_millis(self.retry_delay_base_ms)
    }

    pub fn check(&self) -> Result<(), TransactionError> {
        self.validate()
            .map_err(|e| TransactionError::InvalidOptions(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = TransactionOptions::default();
        assert_eq!(options.isolation, IsolationLevel::ReadCommitted);
        assert!(options.retry_on_deadlock);
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.retry_delay_base(), Duration::from_millis(100));
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(TransactionOptions::critical().check().is_ok());
        assert!(TransactionOptions::read_only().check().is_ok());
        assert!(!TransactionOptions::read_only().retry_on_deadlock);
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        assert!(TransactionOptions::new(IsolationLevel::Serializable, true, 11, 100).is_err());
        assert!(TransactionOptions::new(IsolationLevel::Serializable, true, 3, 0).is_err());
        assert!(TransactionOptions::default().with_max_retries(20).check().is_err());
    }
}
