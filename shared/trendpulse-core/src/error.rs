//! Error types for TrendPulse services

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrendPulseError>;

#[derive(Error, Debug)]
pub enum TrendPulseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transaction contention: {0}")]
    Contention(String),

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TrendPulseError {
    /// Whether a caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Contention(_) | Self::Processing(_) | Self::Unavailable(_)
        )
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Contention(_) | Self::Processing(_) | Self::Unavailable(_) => 503,
            _ => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Cache(_) => "CACHE_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Contention(_) | Self::Processing(_) => "RETRYABLE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for TrendPulseError {
    fn from(err: serde_json::Error) -> Self {
        TrendPulseError::Internal(format!("serialization: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors_map_to_503() {
        let err = TrendPulseError::Contention("deadlock detected".into());
        assert!(err.is_retryable());
        assert_eq!(err.status_code(), 503);
        assert_eq!(err.error_code(), "RETRYABLE");
    }

    #[test]
    fn test_validation_is_not_retryable() {
        let err = TrendPulseError::Validation("missing keyword".into());
        assert!(!err.is_retryable());
        assert_eq!(err.status_code(), 400);
    }
}
