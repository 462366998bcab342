//! Broker-wide error types.
//!
//! Every fallible operation in this crate returns [`MarqsError`]. Transient
//! store failures are propagated to the caller without internal retries;
//! conditions with a defined no-op semantics (unknown message id, lost
//! ack/nack race, concurrency ceiling reached) are not errors at all and are
//! expressed as `Ok(None)` or plain `Ok(())` returns instead.

use thiserror::Error;

/// Result alias used across the crate.
pub type MarqsResult<T> = Result<T, MarqsError>;

/// Errors that can occur while talking to the queue store or assembling
/// messages.
#[derive(Error, Debug)]
pub enum MarqsError {
    /// Store is unreachable (pool exhausted, connection refused, DNS).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Error reported by the Redis client or server.
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Message payloads are JSON; this covers both directions.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or missing configuration (bad env var, zero-sized pool).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A reply from the store did not have the expected shape.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MarqsError {
    /// Whether retrying the operation later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MarqsError::Unavailable(_) | MarqsError::Store(_))
    }
}
