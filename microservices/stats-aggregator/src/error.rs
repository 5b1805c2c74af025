//! Error types for the stats aggregator

use thiserror::Error;
use trendpulse_core::TrendPulseError;
use trendpulse_store::{is_contention_message, StoreError};

/// Result type alias
pub type Result<T> = std::result::Result<T, AggregationError>;

/// Failure of one transaction attempt or of the whole execution
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid transaction options: {0}")]
    InvalidOptions(String),

    /// Failure raised by the unit of work itself
    #[error("{0}")]
    Operation(String),
}

impl TransactionError {
    /// Deadlock or serialization failure worth retrying
    pub fn is_contention(&self) -> bool {
        match self {
            Self::Store(e) => e.is_contention(),
            Self::Operation(message) => is_contention_message(message),
            Self::InvalidOptions(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transaction failed after {attempts} attempt(s): {source}")]
    Transaction {
        attempts: u32,
        #[source]
        source: TransactionError,
    },

    #[error("Invalid input: {0}")]
    Validation(String),
}

impl AggregationError {
    pub fn is_contention(&self) -> bool {
        match self {
            Self::Store(e) => e.is_contention(),
            Self::Transaction { source, .. } => source.is_contention(),
            Self::Validation(_) => false,
        }
    }
}

impl From<AggregationError> for TrendPulseError {
    fn from(err: AggregationError) -> Self {
        if err.is_contention() {
            return TrendPulseError::Contention(err.to_string());
        }
        match err {
            AggregationError::Validation(message) => TrendPulseError::Validation(message),
            AggregationError::Store(StoreError::NotFound) => {
                TrendPulseError::NotFound("aggregate row".to_string())
            }
            other => TrendPulseError::Database(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_errors_classified_by_message() {
        assert!(TransactionError::Operation("Deadlock found when trying to get lock".into())
            .is_contention());
        assert!(!TransactionError::Operation("constraint violated".into()).is_contention());
        assert!(!TransactionError::InvalidOptions("max_retries".into()).is_contention());
    }

    #[test]
    fn test_contention_maps_to_retryable_status() {
        let err = AggregationError::Transaction {
            attempts: 4,
            source: TransactionError::Store(StoreError::Conflict(
                "could not serialize access due to concurrent update".into(),
            )),
        };
        let api: TrendPulseError = err.into();
        assert_eq!(api.status_code(), 503);
        assert_eq!(api.error_code(), "RETRYABLE");

        let api: TrendPulseError = AggregationError::Validation("empty keyword".into()).into();
        assert_eq!(api.status_code(), 400);
    }
}
