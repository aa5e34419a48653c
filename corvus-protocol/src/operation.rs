//! The operation abstraction and its decode state machine.
//!
//! An operation encodes exactly one request and decodes exactly one
//! response. Decoding is restartable: a pass over the buffer either
//! produces a terminal outcome or reports [`Decode::Reading`] without
//! consuming anything, and the caller re-runs the pass from the same
//! offset once more bytes arrive. Operations therefore keep no decode
//! state between passes.

use crate::error::{ProtocolError, RequestError};
use crate::value::Document;
use crate::wire::{read_header, Header, Reader, WireError};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};

/// One request/response exchange on the wire.
pub trait Operation: Send {
    /// Request opcode, from [`crate::opcode`].
    fn op_code(&self) -> u8;

    /// Stable operation name, for logging.
    fn name(&self) -> &'static str;

    /// Appends the full request (opcode and session included) to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Runs one decode pass over `buf` starting at `offset`.
    ///
    /// `Err` means the stream itself is broken; no further decoding on
    /// this connection can succeed.
    fn decode(&mut self, buf: &[u8], offset: usize) -> Result<Decode, ProtocolError>;

    /// Whether the server answers this request at all. `db-close` is
    /// the one fire-and-forget operation.
    fn expects_response(&self) -> bool {
        true
    }
}

/// Outcome of one decode pass.
#[derive(Debug)]
pub enum Decode {
    /// The response is not fully buffered yet; retry later from the
    /// same offset.
    Reading,
    /// The response decoded; `consumed` bytes starting at the pass
    /// offset belong to it.
    Complete { consumed: usize, payload: Payload },
    /// The server rejected this request. Consumes like `Complete`;
    /// the connection stays healthy.
    Error { consumed: usize, error: RequestError },
    /// An out-of-band push arrived at the response boundary. The
    /// operation stays in flight; decoding resumes past the push.
    Push { consumed: usize, event: PushEvent },
}

/// Successful operation payloads.
#[derive(Debug, PartialEq)]
pub enum Payload {
    /// No payload beyond the header.
    Unit,
    Open(OpenResponse),
    Clusters(Vec<Cluster>),
    Records(RecordSet),
    Created { position: i64, version: i32 },
    Updated { version: i32 },
    Deleted { success: bool },
    Command(CommandResponse),
}

/// `db-open` response: the session to use from now on plus the
/// cluster topology.
#[derive(Debug, PartialEq)]
pub struct OpenResponse {
    pub session: i32,
    pub clusters: Vec<Cluster>,
    pub server_version: Option<String>,
}

/// One storage cluster as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub id: i16,
}

/// A record-bearing response: at most one primary record plus the
/// companion records a fetch plan preloaded alongside it.
#[derive(Debug, Default, PartialEq)]
pub struct RecordSet {
    pub primary: Option<Document>,
    pub companions: Vec<Document>,
}

/// Result of a `command` request.
#[derive(Debug, PartialEq)]
pub struct CommandResponse {
    pub result: CommandResult,
    /// Companion records preloaded by the command's fetch plan.
    pub preloaded: Vec<Document>,
}

#[derive(Debug, PartialEq)]
pub enum CommandResult {
    None,
    Record(Document),
    Collection(Vec<Document>),
    Scalar(String),
}

/// An out-of-band server push. Cloneable so it can fan out to every
/// subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub kind: PushKind,
    pub data: Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    /// Cluster topology changed; `data` is the new configuration.
    ClusterConfig,
}

/// Drives one decode pass: reads the shared header, then hands the
/// cursor to the operation-specific payload body on the `OK` path.
///
/// `Incomplete` from either stage becomes [`Decode::Reading`]; error
/// and push headers terminate the pass before the body runs.
pub fn run_decode<F>(buf: &[u8], offset: usize, body: F) -> Result<Decode, ProtocolError>
where
    F: FnOnce(&mut Reader<'_>) -> Result<Payload, WireError>,
{
    let mut r = Reader::new(buf, offset);
    let header = match read_header(&mut r) {
        Ok(header) => header,
        Err(WireError::Incomplete) => return Ok(Decode::Reading),
        Err(WireError::Protocol(e)) => return Err(e),
    };

    match header {
        Header::Ok { .. } => match body(&mut r) {
            Ok(payload) => Ok(Decode::Complete {
                consumed: r.position() - offset,
                payload,
            }),
            Err(WireError::Incomplete) => Ok(Decode::Reading),
            Err(WireError::Protocol(e)) => Err(e),
        },
        Header::Error(error) => Ok(Decode::Error {
            consumed: r.position() - offset,
            error,
        }),
        Header::Push(event) => Ok(Decode::Push {
            consumed: r.position() - offset,
            event,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::WireWrite;
    use crate::{push, status};
    use bytes::BufMut;

    fn ok_response(payload_int: i32) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(status::OK);
        buf.put_i32(7);
        buf.put_i32(payload_int);
        buf
    }

    #[test]
    fn test_complete_reports_consumed() {
        let buf = ok_response(99);
        let outcome = run_decode(&buf, 0, |r| {
            assert_eq!(r.int().unwrap(), 99);
            Ok(Payload::Unit)
        })
        .unwrap();

        match outcome {
            Decode::Complete { consumed, payload } => {
                assert_eq!(consumed, buf.len());
                assert_eq!(payload, Payload::Unit);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_offset_is_respected() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"junk");
        let junk = buf.len();
        buf.extend_from_slice(&ok_response(5));

        let outcome = run_decode(&buf, junk, |r| {
            r.int()?;
            Ok(Payload::Unit)
        })
        .unwrap();
        match outcome {
            Decode::Complete { consumed, .. } => assert_eq!(consumed, buf.len() - junk),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_incomplete_header_is_reading() {
        let outcome = run_decode(&[], 0, |_| Ok(Payload::Unit)).unwrap();
        assert!(matches!(outcome, Decode::Reading));
    }

    #[test]
    fn test_incomplete_body_is_reading() {
        let mut buf = BytesMut::new();
        buf.put_u8(status::OK);
        buf.put_i32(7);
        // Body wants an int that is not there yet.
        let outcome = run_decode(&buf, 0, |r| {
            r.int()?;
            Ok(Payload::Unit)
        })
        .unwrap();
        assert!(matches!(outcome, Decode::Reading));
    }

    #[test]
    fn test_error_header_skips_body() {
        let mut buf = BytesMut::new();
        buf.put_u8(status::ERROR);
        buf.put_i32(7);
        buf.put_u8(1);
        buf.put_wire_string("E");
        buf.put_wire_string("boom");
        buf.put_u8(0);

        let outcome = run_decode(&buf, 0, |_| panic!("body must not run")).unwrap();
        match outcome {
            Decode::Error { consumed, error } => {
                assert_eq!(consumed, buf.len());
                assert_eq!(error.class, "E");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_push_keeps_operation_in_flight() {
        let mut buf = BytesMut::new();
        buf.put_u8(status::PUSH);
        buf.put_u8(push::CLUSTER_CONFIG);
        buf.put_wire_string("generation:2");
        let push_len = buf.len();
        buf.extend_from_slice(&ok_response(0));

        let outcome = run_decode(&buf, 0, |_| panic!("body must not run")).unwrap();
        let consumed = match outcome {
            Decode::Push { consumed, event } => {
                assert_eq!(event.kind, PushKind::ClusterConfig);
                consumed
            }
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(consumed, push_len);

        // The real response decodes on the next pass.
        let outcome = run_decode(&buf, consumed, |r| {
            r.int()?;
            Ok(Payload::Unit)
        })
        .unwrap();
        assert!(matches!(outcome, Decode::Complete { .. }));
    }

    #[test]
    fn test_broken_stream_is_fatal() {
        let buf = [9u8];
        assert!(matches!(
            run_decode(&buf, 0, |_| Ok(Payload::Unit)),
            Err(ProtocolError::UnknownStatus(9))
        ));
    }
}
