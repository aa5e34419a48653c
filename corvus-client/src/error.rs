//! Client error types.

use corvus_protocol::{ProtocolError, RequestError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(String),

    /// The server rejected one request. Carries the server's exception
    /// chain; only the request that triggered it fails.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// The byte stream violated the protocol. Systemic: every pending
    /// operation fails and the connection must be re-established.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A local precondition failed; nothing was sent to the server.
    #[error("operation error: {0}")]
    Operation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,
}

impl ClientError {
    /// Whether the connection survives this error. Recoverable errors
    /// fail exactly one request; everything else cancels all pending
    /// operations.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ClientError::Request(_) | ClientError::Operation(_) | ClientError::Config(_)
        )
    }

    /// A copy for fan-out cancellation. `io::Error` is not `Clone`, so
    /// its kind and message are carried into the copy.
    pub(crate) fn replicate(&self) -> ClientError {
        match self {
            ClientError::Config(s) => ClientError::Config(s.clone()),
            ClientError::Request(e) => ClientError::Request(e.clone()),
            ClientError::Protocol(e) => ClientError::Protocol(e.clone()),
            ClientError::Operation(s) => ClientError::Operation(s.clone()),
            ClientError::Io(e) => ClientError::Io(std::io::Error::new(e.kind(), e.to_string())),
            ClientError::NotConnected => ClientError::NotConnected,
            ClientError::ConnectionClosed => ClientError::ConnectionClosed,
            ClientError::Timeout => ClientError::Timeout,
        }
    }
}
