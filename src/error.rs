//! Error types for the flexmem storage engine.

use std::time::Duration;

use crate::codec::CodecError;

/// Top-level error type for memory storage, encoding, and migrations.
///
/// Each variant is a distinct kind so callers can branch: retry
/// [`MemoryError::Timeout`], surface [`MemoryError::Validation`] to the
/// user, and treat [`MemoryError::Configuration`] as fatal for the process.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Bad credentials, missing backend location, or a location that is
    /// not ready. Raised at construction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Out-of-range numeric field, malformed identity, or unknown enum
    /// value. Raised before any I/O.
    #[error("validation error: {0}")]
    Validation(String),

    /// The operation exceeded its allotted time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// A forward or backward migration script failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// Malformed wire payload.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Any other datastore or I/O failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl MemoryError {
    /// Whether the caller may safely retry the same operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Validation(format!("rejected by datastore constraint: {err}"))
            }
            other => Self::Backend(format!("SQLite: {other}")),
        }
    }
}

impl From<redis::RedisError> for MemoryError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(format!("redis: {err}"))
    }
}

impl From<std::io::Error> for MemoryError {
    fn from(err: std::io::Error) -> Self {
        Self::Backend(format!("I/O: {err}"))
    }
}

/// Convenience result type.
pub type Result<T, E = MemoryError> = std::result::Result<T, E>;
