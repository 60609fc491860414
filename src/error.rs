//! Client Error Types
//!
//! Every dispatched command resolves to a value or exactly one of these errors.
//! Errors are `Clone` because a single event (a close, an aborted transaction)
//! fans out to every affected handle.

use crate::protocol::ParseError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using [`ClientError`].
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the client driver.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    // -------------------------------------------------------------------------
    // Connection-level errors
    // -------------------------------------------------------------------------
    /// The byte stream violated the RESP grammar. Fatal to the transport.
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),

    /// The connection was closed explicitly or gave up reconnecting.
    #[error("connection closed")]
    ConnectionClosed,

    /// Dispatch was rejected because the connection is reconnecting.
    #[error("not connected (reconnect in progress)")]
    NotConnected,

    /// Establishing the transport failed.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    // -------------------------------------------------------------------------
    // Per-command errors
    // -------------------------------------------------------------------------
    /// The server answered with an error reply.
    #[error("server error: {0}")]
    Server(String),

    /// The caller stopped waiting for the reply.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The command was part of a transaction that was discarded or aborted.
    #[error("transaction aborted")]
    TransactionAborted,

    /// A programming or protocol-contract violation.
    #[error("usage fault: {0}")]
    UsageFault(String),
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(Arc::new(err))
    }
}

impl ClientError {
    /// Builds a usage fault from any message.
    pub fn usage(message: impl Into<String>) -> Self {
        ClientError::UsageFault(message.into())
    }

    /// Returns true if this error came from the server rather than the driver.
    pub fn is_server_error(&self) -> bool {
        matches!(self, ClientError::Server(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let err: ClientError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(err, ClientError::Io(_)));
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_server_error_display() {
        let err = ClientError::Server("ERR wrong type".to_string());
        assert!(err.is_server_error());
        assert_eq!(err.to_string(), "server error: ERR wrong type");
    }

    #[test]
    fn test_errors_clone_for_fan_out() {
        let err = ClientError::usage("nested MULTI");
        let copies: Vec<ClientError> = (0..3).map(|_| err.clone()).collect();
        assert!(copies
            .iter()
            .all(|e| matches!(e, ClientError::UsageFault(m) if m == "nested MULTI")));
    }
}
