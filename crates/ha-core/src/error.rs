//! Errors crossing the remote-source boundary

use std::time::Duration;

use thiserror::Error;

/// Result type for operations against the remote source
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors raised by the transport session
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    /// Network failure, socket close, or a session torn down mid-request
    #[error("connection error: {0}")]
    Connection(String),

    /// The remote source rejected our credentials
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A request was attempted with no live session
    #[error("not connected")]
    NotConnected,

    /// No correlated response arrived in time
    #[error("request {id} timed out after {timeout:?}")]
    RequestTimeout { id: u64, timeout: Duration },

    /// The remote source answered with `success: false`
    #[error("remote error: {code} - {message}")]
    Remote { code: String, message: String },

    /// Frame could not be parsed or arrived out of protocol order
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RemoteError {
    /// Whether retrying after a reconnect can fix this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Connection(_) | RemoteError::NotConnected | RemoteError::RequestTimeout { .. }
        )
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(e: serde_json::Error) -> Self {
        RemoteError::Serialization(e.to_string())
    }
}
