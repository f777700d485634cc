//! Connector error types.

use thiserror::Error;

/// Errors from connector plumbing.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Cursor file could not be read or written.
    #[error("cursor: {0}")]
    Cursor(#[from] std::io::Error),

    /// The provider rejected or dropped the connection.
    #[error("provider: {0}")]
    Provider(String),

    /// Switchboard rejected the submission.
    #[error("ingest rejected: {0}")]
    IngestRejected(String),
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;
