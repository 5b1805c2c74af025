//! Store Error Types

use thiserror::Error;
use tokio_postgres::error::SqlState;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(#[from] tokio_postgres::Error),

    #[error("Query error: {0}")]
    Query(tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Conflict reported by a backend without a SQLSTATE (in-memory store)
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transaction already finished")]
    TransactionClosed,

    #[error("Row not found")]
    NotFound,
}

impl StoreError {
    /// Deadlock or serialization failure: the unit of work may be retried
    pub fn is_contention(&self) -> bool {
        if let Self::Connection(e) | Self::Query(e) = self {
            if let Some(code) = e.code() {
                if *code == SqlState::T_R_DEADLOCK_DETECTED
                    || *code == SqlState::T_R_SERIALIZATION_FAILURE
                {
                    return true;
                }
            }
            if let Some(db) = e.as_db_error() {
                if is_contention_message(db.message()) {
                    return true;
                }
            }
        }
        is_contention_message(&self.to_string())
    }
}

/// Message-based contention check, shared with callers that only see text
pub fn is_contention_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("deadlock")
        || lower.contains("lock wait timeout")
        || lower.contains("could not serialize access")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contention_messages() {
        assert!(is_contention_message("ERROR: deadlock detected"));
        assert!(is_contention_message("Lock wait timeout exceeded; try restarting"));
        assert!(is_contention_message(
            "could not serialize access due to concurrent update"
        ));
        assert!(!is_contention_message("relation \"hourly_stats\" does not exist"));
    }

    #[test]
    fn test_conflict_classification() {
        assert!(StoreError::Conflict("deadlock detected".into()).is_contention());
        assert!(!StoreError::Conflict("unique violation".into()).is_contention());
        assert!(!StoreError::Pool("timed out".into()).is_contention());
    }
}
