//! # corvus-client
//!
//! Async client library for CorvusDB.
//!
//! This crate provides:
//! - A pipelined TCP connection with positional response correlation
//! - The FIFO operation queue with cross-chunk reassembly
//! - A high-level `Database` API (load, create, update, delete,
//!   command/query, reload)
//! - Server push subscription (cluster topology updates)

pub mod client;
pub mod connection;
pub mod error;
pub mod queue;

pub use client::{CommandOutcome, Database, DatabaseConfig};
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
pub use queue::{OperationHandle, OperationQueue};

pub use corvus_protocol as protocol;
