//! Error types for the GCS client
//!
//! Covers connection, backend protocol, entry invariant, and caller
//! argument/state errors. Expected domain outcomes (a lookup miss, a
//! test-and-update mismatch) are not errors and never appear here.

use thiserror::Error;

/// Primary error type for all GCS client operations
#[derive(Debug, Clone, Error)]
pub enum GcsError {
    // ========== Connection Errors ==========

    /// Could not reach the backing store
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The client released its connection before or while the operation ran
    #[error("Connection closed")]
    Disconnected,

    /// The link to the backing store failed underneath the client
    #[error("Connection to {endpoint} lost: {reason}")]
    ConnectionLost { endpoint: String, reason: String },

    /// The operation did not complete within the configured command timeout
    #[error("Command {command} timed out after {millis}ms")]
    Timeout { command: &'static str, millis: u64 },

    // ========== Backend Errors ==========

    /// The backing store rejected or failed a command
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// A reply from the backing store could not be parsed
    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    // ========== Entry Invariant Errors ==========

    /// A stored or published entry could not be decoded
    #[error("Malformed {table} entry: {reason}")]
    MalformedEntry { table: &'static str, reason: String },

    /// Heartbeat label and capacity sequences differ in length
    #[error("Misaligned resources: {labels} labels, {capacities} capacities")]
    MisalignedResources { labels: usize, capacities: usize },

    // ========== Argument / State Errors ==========

    /// A binary identifier had the wrong width
    #[error("Invalid id length: expected {expected} bytes, got {actual}")]
    InvalidIdLength { expected: usize, actual: usize },

    /// A caller-supplied argument is unusable
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// The local client already published its join record
    #[error("Client {client_id} already connected")]
    AlreadyConnected { client_id: String },

    /// The local client has not published its join record
    #[error("Client {client_id} not connected")]
    NotConnected { client_id: String },

    // ========== Runtime Errors ==========

    /// The event loop could not be created or driven
    #[error("Runtime error: {message}")]
    Runtime { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GcsError {
    /// Returns true if re-issuing the same operation may succeed.
    ///
    /// The client itself never retries; this is a hint for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GcsError::ConnectionFailed { .. }
                | GcsError::ConnectionLost { .. }
                | GcsError::Timeout { .. }
                | GcsError::Backend { .. }
        )
    }

    /// Returns true if this error indicates a contract violation between
    /// cluster components rather than a transient condition
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            GcsError::MalformedEntry { .. } | GcsError::MisalignedResources { .. }
        )
    }

    pub(crate) fn malformed(table: &'static str, err: impl std::fmt::Display) -> Self {
        GcsError::MalformedEntry {
            table,
            reason: err.to_string(),
        }
    }
}

/// Result type alias for GCS client operations
pub type Result<T> = std::result::Result<T, GcsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let err = GcsError::ConnectionFailed {
            endpoint: "127.0.0.1:6379".into(),
            reason: "refused".into(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_invariant_violation());

        let err = GcsError::MisalignedResources { labels: 2, capacities: 1 };
        assert!(err.is_invariant_violation());
        assert!(!err.is_retryable());

        assert!(!GcsError::Disconnected.is_retryable());

        let err = GcsError::ConnectionLost {
            endpoint: "127.0.0.1:6379".into(),
            reason: "connection reset".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Connection to 127.0.0.1:6379 lost: connection reset");
    }

    #[test]
    fn test_display() {
        let err = GcsError::malformed("object", "eof while parsing");
        assert_eq!(err.to_string(), "Malformed object entry: eof while parsing");
    }
}
