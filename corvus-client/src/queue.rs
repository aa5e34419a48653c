//! The pipelined operation queue.
//!
//! Requests go out in order and responses come back in the same order;
//! correlation is purely positional, so the queue is strict FIFO. The
//! queue itself is synchronous and does no I/O: the connection owns
//! the socket and feeds received chunks in, and `enqueue` hands
//! encoded request bytes back out (immediately when bound, or buffered
//! for flush on bind).

use crate::error::ClientError;
use bytes::{Bytes, BytesMut};
use corvus_protocol::wire::{read_header, Header, Reader, WireError};
use corvus_protocol::{Decode, Operation, Payload, ProtocolError, PushEvent};
use std::collections::VecDeque;
use tokio::sync::{broadcast, oneshot};

/// Resolves with the operation's payload, or the error that failed it.
pub type OperationHandle = oneshot::Receiver<Result<Payload, ClientError>>;

type Resolver = oneshot::Sender<Result<Payload, ClientError>>;

const PUSH_CHANNEL_CAPACITY: usize = 64;

pub struct OperationQueue {
    /// In-flight operations, oldest first.
    items: VecDeque<(Box<dyn Operation>, Resolver)>,
    /// Bytes received but not yet consumed by a completed response.
    remaining: BytesMut,
    /// Requests encoded before the socket was bound, in send order.
    deferred: Vec<Bytes>,
    bound: bool,
    pushes: broadcast::Sender<PushEvent>,
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationQueue {
    pub fn new() -> Self {
        let (pushes, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        Self {
            items: VecDeque::new(),
            remaining: BytesMut::new(),
            deferred: Vec::new(),
            bound: false,
            pushes,
        }
    }

    /// Encodes the operation and queues it for its response.
    ///
    /// Returns the resolution handle and, when bound, the bytes to
    /// write; unbound requests are buffered and flushed by [`bind`].
    /// An operation that expects no response resolves immediately and
    /// never occupies a queue slot.
    ///
    /// [`bind`]: OperationQueue::bind
    pub fn enqueue(&mut self, op: Box<dyn Operation>) -> (OperationHandle, Option<Bytes>) {
        let mut buf = BytesMut::new();
        op.encode(&mut buf);
        let encoded = buf.freeze();

        let (tx, rx) = oneshot::channel();
        if op.expects_response() {
            tracing::debug!(op = op.name(), pending = self.items.len(), "enqueue");
            self.items.push_back((op, tx));
        } else {
            tracing::debug!(op = op.name(), "enqueue (no response expected)");
            let _ = tx.send(Ok(Payload::Unit));
        }

        if self.bound {
            (rx, Some(encoded))
        } else {
            self.deferred.push(encoded);
            (rx, None)
        }
    }

    /// Marks the socket as available and returns the buffered requests
    /// to write, in their original send order.
    pub fn bind(&mut self) -> Vec<Bytes> {
        self.bound = true;
        std::mem::take(&mut self.deferred)
    }

    pub fn unbind(&mut self) {
        self.bound = false;
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn pending_count(&self) -> usize {
        self.items.len()
    }

    pub fn subscribe_pushes(&self) -> broadcast::Receiver<PushEvent> {
        self.pushes.subscribe()
    }

    /// Feeds received bytes and drives the head operation.
    ///
    /// Responses may span chunks and one chunk may carry several
    /// responses; undecoded bytes are retained across calls. A
    /// `ProtocolError` is terminal: the head fails with it, every other
    /// pending handle fails in FIFO order, the retained buffer is
    /// dropped (the stream is no longer byte-aligned) and the error is
    /// returned to the connection.
    pub fn handle_chunk(&mut self, chunk: &[u8]) -> Result<(), ClientError> {
        self.remaining.extend_from_slice(chunk);

        let mut offset = 0;
        loop {
            let step = match self.items.front_mut() {
                Some((op, _)) => op.decode(&self.remaining, offset),
                // Nothing in flight: only a push is a legal frame here.
                None => match self.decode_idle(offset) {
                    Ok(Some(consumed)) => {
                        offset += consumed;
                        continue;
                    }
                    Ok(None) => break,
                    Err(e) => Err(e),
                },
            };

            match step {
                Ok(Decode::Reading) => break,
                Ok(Decode::Complete { consumed, payload }) => {
                    offset += consumed;
                    if let Some((op, tx)) = self.items.pop_front() {
                        tracing::debug!(op = op.name(), "complete");
                        let _ = tx.send(Ok(payload));
                    }
                }
                Ok(Decode::Error { consumed, error }) => {
                    offset += consumed;
                    if let Some((op, tx)) = self.items.pop_front() {
                        tracing::debug!(op = op.name(), class = %error.class, "rejected");
                        let _ = tx.send(Err(ClientError::Request(error)));
                    }
                }
                Ok(Decode::Push { consumed, event }) => {
                    offset += consumed;
                    tracing::debug!(kind = ?event.kind, "push");
                    let _ = self.pushes.send(event);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "protocol violation, cancelling all");
                    let err = ClientError::Protocol(e);
                    self.remaining.clear();
                    self.fail_all(&err);
                    return Err(err);
                }
            }
        }

        let _ = self.remaining.split_to(offset);
        Ok(())
    }

    /// Decodes at an idle boundary (no operation in flight). Returns
    /// the consumed length of a push, `None` when more bytes are
    /// needed, and an error for any non-push frame.
    fn decode_idle(&mut self, offset: usize) -> Result<Option<usize>, ProtocolError> {
        if self.remaining.len() <= offset {
            return Ok(None);
        }
        let mut r = Reader::new(&self.remaining, offset);
        match read_header(&mut r) {
            Ok(Header::Push(event)) => {
                tracing::debug!(kind = ?event.kind, "push (idle)");
                let _ = self.pushes.send(event);
                Ok(Some(r.position() - offset))
            }
            Ok(_) => Err(ProtocolError::UnexpectedPayload(
                "response without a pending operation",
            )),
            Err(WireError::Incomplete) => Ok(None),
            Err(WireError::Protocol(e)) => Err(e),
        }
    }

    /// Fails every pending handle in FIFO order and drops all state.
    pub fn cancel_all(&mut self, err: &ClientError) {
        self.remaining.clear();
        self.fail_all(err);
    }

    fn fail_all(&mut self, err: &ClientError) {
        self.deferred.clear();
        while let Some((op, tx)) = self.items.pop_front() {
            tracing::debug!(op = op.name(), error = %err, "cancelled");
            let _ = tx.send(Err(err.replicate()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use corvus_protocol::operations::{Command, DbClose, DbReload, RecordDelete, RecordLoad};
    use corvus_protocol::status;
    use corvus_protocol::wire::{write_record, WireWrite};
    use corvus_protocol::{Document, PushKind, RecordId, RequestError};

    fn bound_queue() -> OperationQueue {
        let mut queue = OperationQueue::new();
        assert!(queue.bind().is_empty());
        queue
    }

    fn delete_op(position: i64) -> Box<dyn Operation> {
        Box::new(RecordDelete {
            session: 1,
            rid: RecordId::new(9, position),
            version: -1,
        })
    }

    fn delete_response(success: bool) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(status::OK);
        buf.put_i32(1);
        buf.put_u8(success as u8);
        buf
    }

    fn reload_response() -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(status::OK);
        buf.put_i32(1);
        buf.put_i16(1);
        buf.put_wire_string("person");
        buf.put_i16(9);
        buf
    }

    fn request_error_response(class: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(status::ERROR);
        buf.put_i32(1);
        buf.put_u8(1);
        buf.put_wire_string(class);
        buf.put_wire_string("details");
        buf.put_u8(0);
        buf
    }

    fn push_frame() -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(status::PUSH);
        buf.put_u8(corvus_protocol::push::CLUSTER_CONFIG);
        buf.put_wire_string("generation:2");
        buf
    }

    fn resolved(rx: &mut OperationHandle) -> Result<Payload, ClientError> {
        rx.try_recv().expect("handle should be resolved")
    }

    #[test]
    fn test_fifo_correlation_across_one_chunk() {
        let mut queue = bound_queue();
        let (mut h1, b1) = queue.enqueue(delete_op(0));
        let (mut h2, b2) = queue.enqueue(Box::new(DbReload { session: 1 }));
        assert!(b1.is_some() && b2.is_some());
        assert_eq!(queue.pending_count(), 2);

        // Both responses arrive concatenated in one chunk.
        let mut chunk = delete_response(true);
        chunk.extend_from_slice(&reload_response());
        queue.handle_chunk(&chunk).unwrap();

        assert_eq!(resolved(&mut h1).unwrap(), Payload::Deleted { success: true });
        match resolved(&mut h2).unwrap() {
            Payload::Clusters(clusters) => assert_eq!(clusters[0].name, "person"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(queue.pending_count(), 0);
        assert!(queue.remaining.is_empty());
    }

    #[test]
    fn test_byte_by_byte_framing() {
        let mut queue = bound_queue();
        let (mut handle, _) = queue.enqueue(delete_op(0));

        let response = delete_response(false);
        for (i, byte) in response.iter().enumerate() {
            queue.handle_chunk(&[*byte]).unwrap();
            if i + 1 < response.len() {
                assert!(handle.try_recv().is_err(), "resolved early at byte {i}");
            }
        }
        assert_eq!(
            resolved(&mut handle).unwrap(),
            Payload::Deleted { success: false }
        );
    }

    #[test]
    fn test_request_error_fails_only_its_operation() {
        let mut queue = bound_queue();
        let (mut h1, _) = queue.enqueue(delete_op(0));
        let (mut h2, _) = queue.enqueue(delete_op(1));

        let mut chunk = request_error_response("RecordNotFound");
        chunk.extend_from_slice(&delete_response(true));
        queue.handle_chunk(&chunk).unwrap();

        match resolved(&mut h1) {
            Err(ClientError::Request(e)) => assert_eq!(e.class, "RecordNotFound"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(resolved(&mut h2).unwrap(), Payload::Deleted { success: true });
    }

    #[test]
    fn test_push_interleave_keeps_operation_in_flight() {
        let mut queue = bound_queue();
        let mut pushes = queue.subscribe_pushes();
        let (mut handle, _) = queue.enqueue(delete_op(0));

        let mut chunk = push_frame();
        chunk.extend_from_slice(&delete_response(true));
        queue.handle_chunk(&chunk).unwrap();

        let event = pushes.try_recv().unwrap();
        assert_eq!(event.kind, PushKind::ClusterConfig);
        assert_eq!(event.data.get("generation").and_then(|v| v.as_int()), Some(2));
        assert_eq!(resolved(&mut handle).unwrap(), Payload::Deleted { success: true });
    }

    #[test]
    fn test_push_while_idle() {
        let mut queue = bound_queue();
        let mut pushes = queue.subscribe_pushes();

        queue.handle_chunk(&push_frame()).unwrap();
        assert_eq!(pushes.try_recv().unwrap().kind, PushKind::ClusterConfig);
        assert!(queue.remaining.is_empty());
    }

    #[test]
    fn test_response_while_idle_is_fatal() {
        let mut queue = bound_queue();
        let err = queue.handle_chunk(&delete_response(true)).unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::UnexpectedPayload(_))
        ));
    }

    #[test]
    fn test_protocol_error_fails_all_in_order() {
        let mut queue = bound_queue();
        let (mut h1, _) = queue.enqueue(delete_op(0));
        let (mut h2, _) = queue.enqueue(delete_op(1));

        // Unknown status byte: the stream can never re-align.
        let err = queue.handle_chunk(&[9u8]).unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::UnknownStatus(9))
        ));

        for handle in [&mut h1, &mut h2] {
            match resolved(handle) {
                Err(ClientError::Protocol(ProtocolError::UnknownStatus(9))) => {}
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(queue.pending_count(), 0);
        assert!(queue.remaining.is_empty());
    }

    #[test]
    fn test_deferred_writes_flush_in_order() {
        let mut queue = OperationQueue::new();
        let (_h1, b1) = queue.enqueue(delete_op(0));
        let (_h2, b2) = queue.enqueue(Box::new(DbReload { session: 1 }));
        assert!(b1.is_none() && b2.is_none());

        let flushed = queue.bind();
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0][0], corvus_protocol::opcode::RECORD_DELETE);
        assert_eq!(flushed[1][0], corvus_protocol::opcode::DB_RELOAD);

        // Bound now: new requests go straight out.
        let (_h3, b3) = queue.enqueue(delete_op(2));
        assert!(b3.is_some());
        assert!(queue.bind().is_empty());
    }

    #[test]
    fn test_db_close_resolves_immediately() {
        let mut queue = bound_queue();
        let (mut handle, bytes) = queue.enqueue(Box::new(DbClose { session: 1 }));
        assert!(bytes.is_some());
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(resolved(&mut handle).unwrap(), Payload::Unit);
    }

    #[test]
    fn test_cancel_all_fifo() {
        let mut queue = bound_queue();
        let (mut h1, _) = queue.enqueue(delete_op(0));
        let (mut h2, _) = queue.enqueue(delete_op(1));
        queue.handle_chunk(&[status::OK]).unwrap(); // partial response retained

        queue.cancel_all(&ClientError::ConnectionClosed);
        for handle in [&mut h1, &mut h2] {
            assert!(matches!(resolved(handle), Err(ClientError::ConnectionClosed)));
        }
        assert!(queue.remaining.is_empty());
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_record_load_spanning_chunks_with_embedded_push() {
        let mut queue = bound_queue();
        let mut pushes = queue.subscribe_pushes();
        let (mut handle, _) = queue.enqueue(Box::new(RecordLoad {
            session: 1,
            rid: RecordId::new(9, 0),
            fetch_plan: "*:-1".to_string(),
        }));

        let mut doc = Document::new().with_field("name", "Ann");
        doc.set_rid(RecordId::new(9, 0));
        doc.set_version(1);

        let mut response = push_frame();
        response.put_u8(status::OK);
        response.put_i32(1);
        response.put_u8(1);
        write_record(&mut response, &doc);
        response.put_u8(0);

        // Arbitrary split across three chunks.
        let (a, rest) = response.split_at(3);
        let (b, c) = rest.split_at(rest.len() / 2);
        for chunk in [a, b, c] {
            queue.handle_chunk(chunk).unwrap();
        }

        assert_eq!(pushes.try_recv().unwrap().kind, PushKind::ClusterConfig);
        match resolved(&mut handle).unwrap() {
            Payload::Records(set) => {
                assert_eq!(set.primary.unwrap().rid(), Some(RecordId::new(9, 0)));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_command_response_over_queue() {
        let mut queue = bound_queue();
        let (mut handle, _) = queue.enqueue(Box::new(Command::query(1, "SELECT", "")));

        let mut buf = BytesMut::new();
        buf.put_u8(status::OK);
        buf.put_i32(1);
        buf.put_u8(b'n');
        buf.put_u8(0);
        queue.handle_chunk(&buf).unwrap();

        match resolved(&mut handle).unwrap() {
            Payload::Command(response) => {
                assert_eq!(response.result, corvus_protocol::CommandResult::None);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_replicated_request_error_matches() {
        // RequestError is comparable, so fan-out copies are observable.
        let err = ClientError::Request(RequestError::new("E", "boom"));
        match err.replicate() {
            ClientError::Request(e) => assert_eq!(e, RequestError::new("E", "boom")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
