//! Wire primitives: big-endian writer helpers and an incremental reader.
//!
//! Every reader method reports [`WireError::Incomplete`] when the
//! buffer runs short, which is how a decode pass declares `READING`
//! instead of guessing: the number of bytes still needed is always
//! derivable from the opcode and the fields already read. An
//! incomplete pass consumes nothing; the caller retains the buffer and
//! retries when more bytes arrive.

use crate::deserialize::parse_record;
use crate::error::{ExceptionEntry, ProtocolError, RequestError};
use crate::operation::{PushEvent, PushKind};
use crate::rid::RecordId;
use crate::value::Document;
use crate::{push, status};
use bytes::{BufMut, BytesMut};

/// Failure modes of an incremental decode pass.
#[derive(Debug)]
pub enum WireError {
    /// Not enough bytes yet; retry with more data. Never fatal.
    Incomplete,
    /// The stream violated the protocol; fatal for the connection.
    Protocol(ProtocolError),
}

impl From<ProtocolError> for WireError {
    fn from(e: ProtocolError) -> Self {
        WireError::Protocol(e)
    }
}

/// Length-prefixed write helpers on top of `BufMut`.
pub trait WireWrite {
    /// i32 length prefix followed by UTF-8 bytes.
    fn put_wire_string(&mut self, s: &str);
    /// i32 length prefix followed by raw bytes.
    fn put_wire_blob(&mut self, data: &[u8]);
}

impl WireWrite for BytesMut {
    fn put_wire_string(&mut self, s: &str) {
        self.put_i32(s.len() as i32);
        self.put_slice(s.as_bytes());
    }

    fn put_wire_blob(&mut self, data: &[u8]) {
        self.put_i32(data.len() as i32);
        self.put_slice(data);
    }
}

/// Non-consuming cursor over a response buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8], offset: usize) -> Self {
        Self { buf, pos: offset }
    }

    /// Bytes consumed so far, as an offset into the original buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() - self.pos < n {
            return Err(WireError::Incomplete);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn byte(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn short(&mut self) -> Result<i16, WireError> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn int(&mut self) -> Result<i32, WireError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn long(&mut self) -> Result<i64, WireError> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Length-prefixed string; length `-1` is the null string.
    pub fn string(&mut self) -> Result<Option<String>, WireError> {
        match self.blob()? {
            None => Ok(None),
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|_| ProtocolError::InvalidUtf8.into()),
        }
    }

    /// Length-prefixed byte blob; length `-1` is the null blob.
    pub fn blob(&mut self) -> Result<Option<&'a [u8]>, WireError> {
        let len = self.int()?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(ProtocolError::InvalidLength(len).into());
        }
        Ok(Some(self.take(len as usize)?))
    }
}

/// The three response-header shapes shared by every operation.
#[derive(Debug)]
pub enum Header {
    /// Request succeeded; the operation payload follows.
    Ok { session: i32 },
    /// The server rejected this one request (recoverable).
    Error(RequestError),
    /// Out-of-band push; the waiting operation stays in flight.
    Push(PushEvent),
}

/// Reads the response header at the cursor.
pub fn read_header(r: &mut Reader<'_>) -> Result<Header, WireError> {
    match r.byte()? {
        status::OK => Ok(Header::Ok { session: r.int()? }),
        status::ERROR => {
            let _session = r.int()?;
            Ok(Header::Error(read_exception_chain(r)?))
        }
        status::PUSH => Ok(Header::Push(read_push(r)?)),
        other => Err(ProtocolError::UnknownStatus(other).into()),
    }
}

/// `(follow=1, class, message)*` terminated by `follow=0`.
fn read_exception_chain(r: &mut Reader<'_>) -> Result<RequestError, WireError> {
    let mut entries = Vec::new();
    loop {
        match r.byte()? {
            0 => break,
            1 => {
                let class = r.string()?.unwrap_or_default();
                let message = r.string()?.unwrap_or_default();
                entries.push(ExceptionEntry { class, message });
            }
            other => return Err(ProtocolError::InvalidPayloadStatus(other).into()),
        }
    }

    let mut entries = entries.into_iter();
    let primary = entries.next().unwrap_or_else(|| ExceptionEntry {
        class: "ServerError".to_string(),
        message: "server reported an error without details".to_string(),
    });
    Ok(RequestError {
        class: primary.class,
        message: primary.message,
        causes: entries.collect(),
    })
}

fn read_push(r: &mut Reader<'_>) -> Result<PushEvent, WireError> {
    let code = r.byte()?;
    let kind = match code {
        push::CLUSTER_CONFIG => PushKind::ClusterConfig,
        other => return Err(ProtocolError::UnknownPush(other).into()),
    };
    let content = r.string()?.unwrap_or_default();
    let data = parse_record(&content)?;
    Ok(PushEvent { kind, data })
}

/// Record kind byte for documents, the only kind this client handles.
pub const RECORD_KIND_DOCUMENT: u8 = b'd';

/// Reads one wire record: kind byte, i16 cluster, i64 position,
/// i32 version, string content. The parsed document carries the
/// locator and version as metadata.
pub fn read_record(r: &mut Reader<'_>) -> Result<Document, WireError> {
    let kind = r.byte()?;
    if kind != RECORD_KIND_DOCUMENT {
        return Err(ProtocolError::InvalidRecordKind(kind).into());
    }
    let cluster = r.short()?;
    let position = r.long()?;
    let version = r.int()?;
    let content = r.string()?.unwrap_or_default();

    let mut doc = parse_record(&content)?;
    if cluster >= 0 {
        doc.set_rid(RecordId::new(cluster, position));
    }
    doc.set_version(version);
    Ok(doc)
}

/// Writes one wire record in the layout [`read_record`] expects.
/// Exists for the scripted test servers; the client itself only writes
/// record *content* inside create/update requests.
pub fn write_record(buf: &mut BytesMut, doc: &Document) {
    let rid = doc.rid().unwrap_or(RecordId::new(-1, -1));
    buf.put_u8(RECORD_KIND_DOCUMENT);
    buf.put_i16(rid.cluster);
    buf.put_i64(rid.position);
    buf.put_i32(doc.version().unwrap_or(0));
    buf.put_wire_string(&crate::serialize::serialize_document(doc));
}
