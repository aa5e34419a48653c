//! Protocol error types.

use thiserror::Error;

/// Unrecoverable protocol-level failures.
///
/// Any of these means the byte stream can no longer be trusted: because
/// correlation is positional, a single misparsed response poisons every
/// subsequent offset. The operation queue reacts by failing all pending
/// operations and forcing the connection down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown response status byte: {0:#04x}")]
    UnknownStatus(u8),

    #[error("unknown push code: {0:#04x}")]
    UnknownPush(u8),

    #[error("unsupported server protocol version: {0}")]
    UnsupportedVersion(i16),

    #[error("invalid UTF-8 in wire string")]
    InvalidUtf8,

    #[error("invalid length prefix: {0}")]
    InvalidLength(i32),

    #[error("invalid record kind byte: {0:#04x}")]
    InvalidRecordKind(u8),

    #[error("invalid payload status byte: {0:#04x}")]
    InvalidPayloadStatus(u8),

    #[error("invalid command result kind: {0:#04x}")]
    InvalidResultKind(u8),

    #[error("not a record id: {0:?}")]
    InvalidRid(String),

    #[error("malformed record content at byte {position}: {reason}")]
    MalformedRecord { position: usize, reason: String },

    #[error("unexpected response payload for {0}")]
    UnexpectedPayload(&'static str),
}

/// One entry of a server-reported exception chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub class: String,
    pub message: String,
}

/// A request-level failure reported by the server.
///
/// Recoverable: fails exactly one operation's handle, the stream stays
/// aligned and sibling operations are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class}: {message}")]
pub struct RequestError {
    /// Exception class of the outermost server exception.
    pub class: String,
    /// Message of the outermost server exception.
    pub message: String,
    /// Chained causes, outermost first, excluding the primary entry.
    pub causes: Vec<ExceptionEntry>,
}

impl RequestError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            causes: Vec::new(),
        }
    }
}
