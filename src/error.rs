//! Error types for the registry.

use thiserror::Error;

/// Errors surfaced by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The request/reply round trip did not complete in time.
    #[error("request to {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },

    /// The registry server answered with `success: false`.
    #[error("registry error: {0}")]
    Server(String),

    /// The circuit breaker is rejecting attempts toward this target.
    #[error("circuit open for {target}")]
    CircuitOpen { target: String },

    /// The retry interval since the last attempt has not elapsed.
    #[error("retry toward {target} due in {retry_secs}s")]
    RetryPending { target: String, retry_secs: u64 },

    /// Storage backend failure (I/O, corruption, poisoned database).
    #[error("backend error: {0}")]
    Backend(String),

    /// ZMQ socket error.
    #[error("zmq error: {0}")]
    Zmq(#[from] zmq::Error),

    /// Wire payload could not be parsed.
    #[error("Invalid JSON format")]
    InvalidPayload(#[source] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl From<tmq::TmqError> for RegistryError {
    fn from(err: tmq::TmqError) -> Self {
        RegistryError::Other(err.to_string())
    }
}

impl From<redb::Error> for RegistryError {
    fn from(err: redb::Error) -> Self {
        RegistryError::Backend(err.to_string())
    }
}

impl From<redb::DatabaseError> for RegistryError {
    fn from(err: redb::DatabaseError) -> Self {
        RegistryError::Backend(err.to_string())
    }
}

impl From<redb::TransactionError> for RegistryError {
    fn from(err: redb::TransactionError) -> Self {
        RegistryError::Backend(err.to_string())
    }
}

impl From<redb::TableError> for RegistryError {
    fn from(err: redb::TableError) -> Self {
        RegistryError::Backend(err.to_string())
    }
}

impl From<redb::StorageError> for RegistryError {
    fn from(err: redb::StorageError) -> Self {
        RegistryError::Backend(err.to_string())
    }
}

impl From<redb::CommitError> for RegistryError {
    fn from(err: redb::CommitError) -> Self {
        RegistryError::Backend(err.to_string())
    }
}

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RegistryError::RetryPending {
            target: "tcp://daq:6000".to_owned(),
            retry_secs: 4,
        };
        assert_eq!(err.to_string(), "retry toward tcp://daq:6000 due in 4s");

        let err = RegistryError::Timeout {
            endpoint: "tcp://localhost:4242".to_owned(),
            timeout_ms: 5000,
        };
        assert!(err.to_string().contains("4242"));
        assert!(err.to_string().contains("5000"));
    }
}
