//! Common error types for Outbox.

use thiserror::Error;

/// Top-level error type for sync engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Network failure, 5xx response or dropped connection.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// A request exceeded its per-request timeout.
    #[error("Request timed out")]
    Timeout,

    /// The server rejected the payload (4xx). Not retried.
    #[error("Validation error ({status}): {detail}")]
    Validation { status: u16, detail: String },

    /// The server reported a version mismatch.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Dependency cycle, missing parent or reassigned server id.
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    /// Mutation attempted on a record with a queued delete.
    #[error("Stale record: {0} has a pending delete")]
    StaleRecord(String),

    /// Durable storage failed (e.g. disk full).
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No connectivity to the server.
    #[error("Offline")]
    Offline,

    /// The operation was cancelled before completing.
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Returns true if the operation may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransientNetwork(_) | Error::Timeout | Error::Offline
        )
    }

    /// Returns true if the error affects the whole engine rather than one op.
    pub fn is_global(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Io(_) | Error::Serialization(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::TransientNetwork("reset".into()).is_retryable());
        assert!(Error::Timeout.is_retryable());
        assert!(!Error::Validation {
            status: 422,
            detail: "title required".into()
        }
        .is_retryable());
        assert!(!Error::IntegrityViolation("cycle".into()).is_retryable());
        assert!(!Error::StaleRecord("p1".into()).is_retryable());
    }

    #[test]
    fn test_global_classification() {
        assert!(Error::Storage("disk full".into()).is_global());
        assert!(!Error::Conflict("v3 != v4".into()).is_global());
    }
}
