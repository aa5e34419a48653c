//! The concrete operation set.
//!
//! Request layouts are documented at each struct; every request starts
//! with the opcode byte and the i32 session id. Record-bearing
//! responses share one grammar: a sequence of payload-status bytes
//! (`1` primary record, `2` fetch-plan companion, `0` end), each
//! non-zero status followed by the shared record layout of
//! [`crate::wire::read_record`].

use crate::error::ProtocolError;
use crate::operation::{
    Cluster, CommandResponse, CommandResult, Decode, OpenResponse, Operation, Payload, RecordSet,
};
use crate::rid::RecordId;
use crate::wire::{read_record, Reader, WireError, WireWrite, RECORD_KIND_DOCUMENT};
use crate::{opcode, DRIVER_NAME, DRIVER_VERSION, NO_SESSION, PROTOCOL_VERSION};
use bytes::{BufMut, Bytes, BytesMut};

/// Database access mode requested at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DbType {
    #[default]
    Document,
    Graph,
}

impl DbType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::Document => "document",
            DbType::Graph => "graph",
        }
    }
}

fn read_clusters(r: &mut Reader<'_>) -> Result<Vec<Cluster>, WireError> {
    let count = r.short()?;
    let mut clusters = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let name = r.string()?.unwrap_or_default();
        let id = r.short()?;
        clusters.push(Cluster { name, id });
    }
    Ok(clusters)
}

fn read_record_set(r: &mut Reader<'_>) -> Result<RecordSet, WireError> {
    let mut set = RecordSet::default();
    loop {
        match r.byte()? {
            0 => break,
            1 => {
                let doc = read_record(r)?;
                // A second "primary" entry joins the companions; the
                // first one is the requested record.
                match set.primary {
                    None => set.primary = Some(doc),
                    Some(_) => set.companions.push(doc),
                }
            }
            2 => set.companions.push(read_record(r)?),
            other => return Err(ProtocolError::InvalidPayloadStatus(other).into()),
        }
    }
    Ok(set)
}

// ---------------------------------------------------------------------------
// db-open
// ---------------------------------------------------------------------------

/// Opens a named database, negotiating protocol version and identity.
///
/// Request: driver name, driver version, i16 protocol version, client
/// id (null), database name, database type, username, password.
/// Response: i32 session id, cluster list (i16 count, then name + i16
/// id each), nullable config blob, nullable server version string.
#[derive(Debug)]
pub struct DbOpen {
    pub database: String,
    pub username: String,
    pub password: String,
    pub db_type: DbType,
}

impl Operation for DbOpen {
    fn op_code(&self) -> u8 {
        opcode::DB_OPEN
    }

    fn name(&self) -> &'static str {
        "db-open"
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.op_code());
        buf.put_i32(NO_SESSION);
        buf.put_wire_string(DRIVER_NAME);
        buf.put_wire_string(DRIVER_VERSION);
        buf.put_i16(PROTOCOL_VERSION);
        buf.put_i32(-1); // client id: null
        buf.put_wire_string(&self.database);
        buf.put_wire_string(self.db_type.as_str());
        buf.put_wire_string(&self.username);
        buf.put_wire_string(&self.password);
    }

    fn decode(&mut self, buf: &[u8], offset: usize) -> Result<Decode, ProtocolError> {
        crate::operation::run_decode(buf, offset, |r| {
            let session = r.int()?;
            let clusters = read_clusters(r)?;
            let _config = r.blob()?;
            let server_version = r.string()?;
            Ok(Payload::Open(OpenResponse {
                session,
                clusters,
                server_version,
            }))
        })
    }
}

// ---------------------------------------------------------------------------
// db-close
// ---------------------------------------------------------------------------

/// Ends the session. The server answers with nothing and drops the
/// connection, so this operation resolves the moment it is written.
#[derive(Debug)]
pub struct DbClose {
    pub session: i32,
}

impl Operation for DbClose {
    fn op_code(&self) -> u8 {
        opcode::DB_CLOSE
    }

    fn name(&self) -> &'static str {
        "db-close"
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.op_code());
        buf.put_i32(self.session);
    }

    fn decode(&mut self, _buf: &[u8], _offset: usize) -> Result<Decode, ProtocolError> {
        Ok(Decode::Complete {
            consumed: 0,
            payload: Payload::Unit,
        })
    }

    fn expects_response(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// db-reload
// ---------------------------------------------------------------------------

/// Re-fetches the cluster topology for the open database.
///
/// Request: header only. Response: cluster list as in `db-open`.
#[derive(Debug)]
pub struct DbReload {
    pub session: i32,
}

impl Operation for DbReload {
    fn op_code(&self) -> u8 {
        opcode::DB_RELOAD
    }

    fn name(&self) -> &'static str {
        "db-reload"
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.op_code());
        buf.put_i32(self.session);
    }

    fn decode(&mut self, buf: &[u8], offset: usize) -> Result<Decode, ProtocolError> {
        crate::operation::run_decode(buf, offset, |r| Ok(Payload::Clusters(read_clusters(r)?)))
    }
}

// ---------------------------------------------------------------------------
// record-load
// ---------------------------------------------------------------------------

/// Loads one record, optionally preloading linked records.
///
/// Request: i16 cluster, i64 position, fetch-plan string, ignore-cache
/// byte (0), tombstones byte (0). Response: record-set grammar.
#[derive(Debug)]
pub struct RecordLoad {
    pub session: i32,
    pub rid: RecordId,
    pub fetch_plan: String,
}

impl Operation for RecordLoad {
    fn op_code(&self) -> u8 {
        opcode::RECORD_LOAD
    }

    fn name(&self) -> &'static str {
        "record-load"
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.op_code());
        buf.put_i32(self.session);
        buf.put_i16(self.rid.cluster);
        buf.put_i64(self.rid.position);
        buf.put_wire_string(&self.fetch_plan);
        buf.put_u8(0); // ignore cache
        buf.put_u8(0); // load tombstones
    }

    fn decode(&mut self, buf: &[u8], offset: usize) -> Result<Decode, ProtocolError> {
        crate::operation::run_decode(buf, offset, |r| Ok(Payload::Records(read_record_set(r)?)))
    }
}

// ---------------------------------------------------------------------------
// record-create
// ---------------------------------------------------------------------------

/// Creates a record in a cluster; the server assigns the position.
///
/// Request: i16 cluster, content blob, record kind byte, mode byte
/// (0 = synchronous). Response: i64 position, i32 version.
#[derive(Debug)]
pub struct RecordCreate {
    pub session: i32,
    pub cluster: i16,
    pub content: Bytes,
}

impl Operation for RecordCreate {
    fn op_code(&self) -> u8 {
        opcode::RECORD_CREATE
    }

    fn name(&self) -> &'static str {
        "record-create"
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.op_code());
        buf.put_i32(self.session);
        buf.put_i16(self.cluster);
        buf.put_wire_blob(&self.content);
        buf.put_u8(RECORD_KIND_DOCUMENT);
        buf.put_u8(0); // mode: synchronous
    }

    fn decode(&mut self, buf: &[u8], offset: usize) -> Result<Decode, ProtocolError> {
        crate::operation::run_decode(buf, offset, |r| {
            let position = r.long()?;
            let version = r.int()?;
            Ok(Payload::Created { position, version })
        })
    }
}

// ---------------------------------------------------------------------------
// record-update
// ---------------------------------------------------------------------------

/// Replaces a record's content, optionally checking its version.
///
/// Request: i16 cluster, i64 position, content blob, i32 expected
/// version (`-1` skips the check), record kind byte, mode byte.
/// Response: i32 new version.
#[derive(Debug)]
pub struct RecordUpdate {
    pub session: i32,
    pub rid: RecordId,
    pub content: Bytes,
    pub version: i32,
}

impl Operation for RecordUpdate {
    fn op_code(&self) -> u8 {
        opcode::RECORD_UPDATE
    }

    fn name(&self) -> &'static str {
        "record-update"
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.op_code());
        buf.put_i32(self.session);
        buf.put_i16(self.rid.cluster);
        buf.put_i64(self.rid.position);
        buf.put_wire_blob(&self.content);
        buf.put_i32(self.version);
        buf.put_u8(RECORD_KIND_DOCUMENT);
        buf.put_u8(0); // mode: synchronous
    }

    fn decode(&mut self, buf: &[u8], offset: usize) -> Result<Decode, ProtocolError> {
        crate::operation::run_decode(buf, offset, |r| {
            let version = r.int()?;
            Ok(Payload::Updated { version })
        })
    }
}

// ---------------------------------------------------------------------------
// record-delete
// ---------------------------------------------------------------------------

/// Deletes a record, optionally checking its version.
///
/// Request: i16 cluster, i64 position, i32 expected version (`-1`
/// skips the check), mode byte. Response: success byte.
#[derive(Debug)]
pub struct RecordDelete {
    pub session: i32,
    pub rid: RecordId,
    pub version: i32,
}

impl Operation for RecordDelete {
    fn op_code(&self) -> u8 {
        opcode::RECORD_DELETE
    }

    fn name(&self) -> &'static str {
        "record-delete"
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.op_code());
        buf.put_i32(self.session);
        buf.put_i16(self.rid.cluster);
        buf.put_i64(self.rid.position);
        buf.put_i32(self.version);
        buf.put_u8(0); // mode: synchronous
    }

    fn decode(&mut self, buf: &[u8], offset: usize) -> Result<Decode, ProtocolError> {
        crate::operation::run_decode(buf, offset, |r| {
            let success = r.byte()? != 0;
            Ok(Payload::Deleted { success })
        })
    }
}

// ---------------------------------------------------------------------------
// command
// ---------------------------------------------------------------------------

/// Command class for idempotent queries.
pub const COMMAND_CLASS_QUERY: &str = "q";
/// Command class for arbitrary (mutating) statements.
pub const COMMAND_CLASS_COMMAND: &str = "c";

/// Executes a textual command or query on the server.
///
/// Request: mode byte (`s` = synchronous), then one blob holding the
/// command envelope: class string, command text, i32 row limit (`-1` =
/// unlimited), fetch-plan string, i32 `-1` (no serialized parameters).
/// Response: result-kind byte (`n` none, `r` record, `l` collection
/// with i32 count, `a` scalar string), then the companion grammar
/// (`2` preloaded record, `0` end).
#[derive(Debug)]
pub struct Command {
    pub session: i32,
    pub class: &'static str,
    pub text: String,
    pub limit: i32,
    pub fetch_plan: String,
}

impl Command {
    /// An idempotent query with a fetch plan.
    pub fn query(session: i32, text: impl Into<String>, fetch_plan: impl Into<String>) -> Self {
        Self {
            session,
            class: COMMAND_CLASS_QUERY,
            text: text.into(),
            limit: -1,
            fetch_plan: fetch_plan.into(),
        }
    }

    /// An arbitrary statement (may mutate).
    pub fn statement(session: i32, text: impl Into<String>) -> Self {
        Self {
            session,
            class: COMMAND_CLASS_COMMAND,
            text: text.into(),
            limit: -1,
            fetch_plan: String::new(),
        }
    }
}

impl Operation for Command {
    fn op_code(&self) -> u8 {
        opcode::COMMAND
    }

    fn name(&self) -> &'static str {
        "command"
    }

    fn encode(&self, buf: &mut BytesMut) {
        let mut envelope = BytesMut::new();
        envelope.put_wire_string(self.class);
        envelope.put_wire_string(&self.text);
        envelope.put_i32(self.limit);
        envelope.put_wire_string(&self.fetch_plan);
        envelope.put_i32(-1); // no serialized parameters

        buf.put_u8(self.op_code());
        buf.put_i32(self.session);
        buf.put_u8(b's');
        buf.put_wire_blob(&envelope);
    }

    fn decode(&mut self, buf: &[u8], offset: usize) -> Result<Decode, ProtocolError> {
        crate::operation::run_decode(buf, offset, |r| {
            let result = match r.byte()? {
                b'n' => CommandResult::None,
                b'r' => CommandResult::Record(read_record(r)?),
                b'l' => {
                    let count = r.int()?;
                    if count < 0 {
                        return Err(ProtocolError::InvalidLength(count).into());
                    }
                    let mut records = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        records.push(read_record(r)?);
                    }
                    CommandResult::Collection(records)
                }
                b'a' => CommandResult::Scalar(r.string()?.unwrap_or_default()),
                other => return Err(ProtocolError::InvalidResultKind(other).into()),
            };

            let mut preloaded = Vec::new();
            loop {
                match r.byte()? {
                    0 => break,
                    2 => preloaded.push(read_record(r)?),
                    other => return Err(ProtocolError::InvalidPayloadStatus(other).into()),
                }
            }

            Ok(Payload::Command(CommandResponse { result, preloaded }))
        })
    }
}
