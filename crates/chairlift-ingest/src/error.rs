//! Error types for the ingestion pipeline.

use thiserror::Error;

use crate::gateway::PublishError;
use crate::pool::PoolError;
use crate::storage::StorageError;
use crate::transport::TransportError;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while starting or running the pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Channel pool error.
    #[error("channel pool error: {0}")]
    Pool(#[from] PoolError),

    /// Publish error.
    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Event encoding or validation error.
    #[error("event error: {0}")]
    Event(#[from] chairlift_core::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::from(TransportError::ConnectionClosed);
        assert_eq!(err.to_string(), "transport error: connection closed");

        let err = Error::Config("flush_workers must be positive".into());
        assert!(err.to_string().contains("flush_workers"));
    }

    #[test]
    fn test_from_conversions() {
        let err: Error = PoolError::Closed.into();
        assert!(matches!(err, Error::Pool(PoolError::Closed)));

        let err: Error = std::io::Error::other("spawn failed").into();
        assert!(matches!(err, Error::Io(_)));
    }
}
