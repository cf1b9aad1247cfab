//! Pool lifecycle errors.

use thiserror::Error;

/// Error raised while bringing up or using the storage pool.
///
/// `InvalidConfig` and `Unreachable` are kept apart so callers can tell
/// "fix your configuration" from "retry, the store may recover".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The connection string is missing or malformed. Not retryable.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// The store did not answer the liveness check in time.
    #[error("store unreachable: {0}")]
    Unreachable(String),

    /// The pool has not been initialized, or has been closed.
    #[error("connection pool is not ready")]
    NotReady,
}

impl PoolError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable(msg.into())
    }

    /// Whether retrying initialization later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::NotReady)
    }
}
