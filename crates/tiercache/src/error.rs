//! Error types for the cache layer.
//!
//! Shared-tier failures ([`BackendError`]) never reach callers of the
//! [`CacheLayer`](crate::cache::CacheLayer) façade: they are logged, counted
//! and the operation degrades to local-only behavior. [`CacheError`] covers
//! the conditions that *are* surfaced.

/// Failure talking to the shared (Redis) tier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("shared tier unavailable: {0}")]
    Unavailable(String),

    #[error("shared tier timed out: {0}")]
    Timeout(String),

    #[error("unexpected shared tier reply: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Unavailable(_) => "unavailable",
            BackendError::Timeout(_) => "timeout",
            BackendError::Protocol(_) => "protocol",
        }
    }
}

impl From<deadpool_redis::PoolError> for BackendError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        match e {
            deadpool_redis::PoolError::Timeout(_) => BackendError::Timeout(e.to_string()),
            other => BackendError::Unavailable(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for BackendError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout() {
            BackendError::Timeout(e.to_string())
        } else if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            BackendError::Unavailable(e.to_string())
        } else {
            BackendError::Protocol(e.to_string())
        }
    }
}

/// Pattern delete that stopped part-way through the scan.
#[derive(Debug, thiserror::Error)]
#[error("pattern delete aborted after {deleted} keys: {source}")]
pub struct ScanDeleteError {
    /// Keys deleted before the failure.
    pub deleted: u64,
    #[source]
    pub source: BackendError,
}

/// Errors returned to callers of the cache layer.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The value handed to the cache cannot be encoded for the shared tier.
    #[error("failed to serialize cache value: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid settings or connection string. Fatal at startup.
    #[error("cache misconfiguration: {0}")]
    Config(String),

    /// The caller-supplied loader failed.
    #[error("loader failed: {0}")]
    Loader(#[source] anyhow::Error),
}
