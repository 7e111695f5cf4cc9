//! Cache error types

use redis::RedisError;

/// Cache-related errors
///
/// Backend-side errors (`BackendUnavailable`, `BackendDegraded`, `Redis`,
/// `Serialization`) are recovered inside the cache layers and never reach
/// callers of `get_or_fetch`/`load`; only `Fetcher` propagates, since it means
/// the source of truth itself could not produce the data.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("cache backend degraded: {0}")]
    BackendDegraded(String),

    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("fetcher error: {0}")]
    Fetcher(String),

    #[error("Backend error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Whether this error counts toward opening the circuit breaker.
    ///
    /// A degraded (slow but responsive) backend and unreadable stored values
    /// do not open the breaker; only failures to reach the backend do.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            CacheError::BackendUnavailable(_) | CacheError::Redis(_) | CacheError::Backend(_)
        )
    }
}
