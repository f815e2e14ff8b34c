//! Cache-specific error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Redis unavailable, pool exhausted, network issues.
    #[error("cache connection error: {0}")]
    ConnectionError(String),

    #[error("cache serialization error: {0}")]
    SerializationError(String),

    #[error("cache operation error: {0}")]
    OperationError(String),
}

impl CacheError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CacheError::ConnectionError(_))
    }
}

#[cfg(feature = "cache")]
impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::ConnectionError(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

#[cfg(feature = "cache")]
impl From<bb8::RunError<redis::RedisError>> for CacheError {
    fn from(err: bb8::RunError<redis::RedisError>) -> Self {
        CacheError::ConnectionError(format!("pool error: {}", err))
    }
}

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
