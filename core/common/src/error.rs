//! Common error types for offsync.

use thiserror::Error;

/// Top-level error type for offsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage backend operation failed.
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

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Network reachability could not be determined.
    #[error("Network error: {0}")]
    Network(String),

    /// A durable write did not reach the backend.
    ///
    /// The in-memory state is still authoritative when this is returned.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// An item processor reported a failure.
    #[error("Processor error: {0}")]
    Processor(String),

    /// The engine has been shut down.
    #[error("Engine is shut down")]
    Shutdown,
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
    fn test_serde_error_conversion() {
        let err: Error = serde_json::from_str::<u32>("not a number").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_display() {
        let err = Error::Persistence("disk full".to_string());
        assert_eq!(err.to_string(), "Persistence error: disk full");
        assert_eq!(Error::Shutdown.to_string(), "Engine is shut down");
    }
}
