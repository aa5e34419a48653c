//! # corvus-protocol
//!
//! Wire protocol implementation for CorvusDB.
//!
//! This crate provides:
//! - Big-endian wire primitives with incremental (partial-read tolerant) decoding
//! - Record locators (`RecordId`), typed wire values and documents
//! - The textual record codec (serialize + deserialize)
//! - Graph reference resolution for fetch-plan result sets
//! - The operation state machine and the concrete operation set
//!
//! Everything here is pure and I/O-free; sockets live in `corvus-client`.

pub mod deserialize;
pub mod error;
pub mod operation;
pub mod operations;
pub mod resolver;
pub mod rid;
pub mod serialize;
pub mod value;
pub mod wire;

pub use error::{ExceptionEntry, ProtocolError, RequestError};
pub use operation::{
    Cluster, CommandResponse, CommandResult, Decode, OpenResponse, Operation, Payload, PushEvent,
    PushKind, RecordSet,
};
pub use operations::DbType;
pub use rid::RecordId;
pub use value::{Document, SharedRecord, Value};

/// Highest binary protocol version this client speaks.
pub const PROTOCOL_VERSION: i16 = 28;

/// Oldest server protocol version the client accepts.
pub const MIN_PROTOCOL_VERSION: i16 = 21;

/// Default port for a CorvusDB server.
pub const DEFAULT_PORT: u16 = 2424;

/// Session id used before `db-open` has assigned one.
pub const NO_SESSION: i32 = -1;

/// Driver identification sent during `db-open`.
pub const DRIVER_NAME: &str = "corvusdb-rs";

/// Driver version sent during `db-open`.
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Request opcodes.
///
/// These byte values are protocol constants and must never change.
pub mod opcode {
    pub const DB_OPEN: u8 = 3;
    pub const DB_CLOSE: u8 = 5;
    pub const RECORD_LOAD: u8 = 30;
    pub const RECORD_CREATE: u8 = 31;
    pub const RECORD_UPDATE: u8 = 32;
    pub const RECORD_DELETE: u8 = 33;
    pub const COMMAND: u8 = 41;
    pub const DB_RELOAD: u8 = 73;
}

/// Response status bytes.
pub mod status {
    /// Request succeeded; operation payload follows.
    pub const OK: u8 = 0;
    /// Server rejected the request; exception chain follows.
    pub const ERROR: u8 = 1;
    /// Out-of-band push; push code and payload follow.
    pub const PUSH: u8 = 3;
}

/// Push codes carried after a [`status::PUSH`] byte.
pub mod push {
    /// Cluster topology changed; payload is a serialized config document.
    pub const CLUSTER_CONFIG: u8 = 80;
}
