//! Error types for cache backends

/// Result type alias
pub type Result<T> = std::result::Result<T, CacheError>;

/// Cache backend errors. These never leave [`crate::CacheService`].
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}
