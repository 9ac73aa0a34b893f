//! Connect-time and pool-level error types.

use std::time::Duration;

use caseline_secrets::SecretsError;
use thiserror::Error;

/// Result type alias for pool operations.
pub type DbResult<T> = Result<T, DbError>;

/// Classified failure of a database session operation.
///
/// Classification happens in the connector from structured server error
/// codes, never from message text. Only [`ConnectError::Authentication`]
/// is treated as a credential-rotation signal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// The server rejected the supplied username/password.
    #[error("authentication rejected ({code}): {message}")]
    Authentication { code: u16, message: String },

    /// The server refused the operation for any other reason.
    #[error("server error ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The peer sent something this client does not understand or support.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ConnectError {
    /// Whether this failure means the credential is no longer valid.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

impl From<std::io::Error> for ConnectError {
    fn from(e: std::io::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Errors surfaced to callers of the pool.
#[derive(Debug, Error)]
pub enum DbError {
    /// The credential could not be fetched and no cached copy exists.
    #[error("credential lookup failed: {0}")]
    Secret(#[from] SecretsError),

    #[error("connect failed: {0}")]
    Connect(#[from] ConnectError),

    /// No pooled connection and no spare capacity within the timeout.
    #[error("timed out after {0:?} waiting for a database connection")]
    PoolTimeout(Duration),

    /// The pool has been shut down.
    #[error("connection pool is closed")]
    Closed,

    /// A checked-out session failed while in use.
    #[error("session error: {0}")]
    Session(String),
}

impl DbError {
    pub fn is_pool_timeout(&self) -> bool {
        matches!(self, Self::PoolTimeout(_))
    }

    /// Whether the failure came from a rejected credential.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Connect(e) if e.is_authentication())
    }
}
