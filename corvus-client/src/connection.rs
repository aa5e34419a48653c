//! Connection management.

use crate::error::ClientError;
use crate::queue::OperationQueue;
use corvus_protocol::{Operation, Payload, ProtocolError, PushEvent, MIN_PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Request timeout.
    pub request_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

/// A pipelined connection to a CorvusDB server.
///
/// Requests go out through [`send`] and are correlated positionally by
/// the operation queue; [`read_loop`] must run in a background task to
/// feed responses in.
///
/// [`send`]: Connection::send
/// [`read_loop`]: Connection::read_loop
pub struct Connection {
    config: ConnectionConfig,
    /// Write half of the stream (for sending requests).
    writer: Mutex<Option<WriteHalf<TcpStream>>>,
    /// Read half of the stream (for receiving responses).
    reader: Mutex<Option<ReadHalf<TcpStream>>>,
    /// FIFO queue correlating requests with responses.
    queue: parking_lot::Mutex<OperationQueue>,
    /// Serializes the queue append with the socket write. Correlation
    /// is positional, so request bytes must reach the wire in append
    /// order; the gate spans both steps.
    send_gate: Mutex<()>,
    /// Is the connection established?
    connected: AtomicBool,
    /// Protocol version announced by the server at accept.
    server_protocol: AtomicI32,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            queue: parking_lot::Mutex::new(OperationQueue::new()),
            send_gate: Mutex::new(()),
            connected: AtomicBool::new(false),
            server_protocol: AtomicI32::new(0),
        }
    }

    /// Subscribes to server pushes.
    pub fn subscribe_pushes(&self) -> broadcast::Receiver<PushEvent> {
        self.queue.lock().subscribe_pushes()
    }

    /// Connects to the server and performs the version handshake.
    ///
    /// The server opens by sending its i16 protocol version; anything
    /// older than [`MIN_PROTOCOL_VERSION`] is rejected before a single
    /// request is written.
    pub async fn connect(&self) -> Result<(), ClientError> {
        tracing::debug!("connecting to {}...", self.config.addr);

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| {
            tracing::debug!("connection timeout");
            ClientError::Timeout
        })?
        .map_err(ClientError::Io)?;

        stream.set_nodelay(true).ok();

        let (mut read_half, write_half) = tokio::io::split(stream);

        tracing::debug!("waiting for protocol version...");
        let mut version_bytes = [0u8; 2];
        tokio::time::timeout(
            self.config.request_timeout,
            read_half.read_exact(&mut version_bytes),
        )
        .await
        .map_err(|_| ClientError::Timeout)?
        .map_err(ClientError::Io)?;

        let version = i16::from_be_bytes(version_bytes);
        if version < MIN_PROTOCOL_VERSION {
            tracing::warn!(version, "server protocol too old");
            return Err(ClientError::Protocol(ProtocolError::UnsupportedVersion(
                version,
            )));
        }
        tracing::debug!(version, "handshake complete");
        self.server_protocol.store(version as i32, Ordering::SeqCst);

        *self.writer.lock().await = Some(write_half);
        *self.reader.lock().await = Some(read_half);
        self.connected.store(true, Ordering::SeqCst);

        let gate = self.send_gate.lock().await;
        let buffered = self.queue.lock().bind();
        for bytes in buffered {
            self.write(&bytes).await?;
        }
        drop(gate);

        Ok(())
    }

    /// Protocol version the server announced, once connected.
    pub fn server_protocol(&self) -> i16 {
        self.server_protocol.load(Ordering::SeqCst) as i16
    }

    /// Sends an operation and awaits its payload.
    ///
    /// Safe to call from several tasks at once: the append and the
    /// write share one critical section, so requests reach the wire
    /// in queue order.
    ///
    /// A request timeout is unrecoverable: responses are matched by
    /// position, so abandoning one reply would mis-correlate every
    /// reply after it. The connection shuts down and all pending
    /// operations are cancelled.
    pub async fn send(&self, op: impl Operation + 'static) -> Result<Payload, ClientError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }

        let handle = {
            let _gate = self.send_gate.lock().await;
            let (handle, bytes) = self.queue.lock().enqueue(Box::new(op));
            if let Some(bytes) = bytes {
                self.write(&bytes).await?;
            }
            handle
        };

        match tokio::time::timeout(self.config.request_timeout, handle).await {
            Err(_) => {
                tracing::warn!("request timeout, shutting down connection");
                self.shutdown(ClientError::Timeout).await;
                Err(ClientError::Timeout)
            }
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Ok(Ok(result)) => result,
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), ClientError> {
        let result = {
            let mut writer_guard = self.writer.lock().await;
            let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
            writer.write_all(bytes).await.map_err(ClientError::Io)
        };
        if let Err(e) = result {
            self.shutdown(e.replicate()).await;
            return Err(e);
        }
        Ok(())
    }

    /// Reads responses and feeds the queue (call this in a background
    /// task). Returns when the connection ends, with the reason.
    pub async fn read_loop(&self) -> Result<(), ClientError> {
        let mut buf = vec![0u8; self.config.read_buffer_size];

        loop {
            let n = {
                let mut reader_guard = self.reader.lock().await;
                let reader = reader_guard.as_mut().ok_or(ClientError::NotConnected)?;
                reader.read(&mut buf).await
            };

            let n = match n {
                Ok(n) => n,
                Err(e) => {
                    let err = ClientError::Io(e);
                    self.shutdown(err.replicate()).await;
                    return Err(err);
                }
            };

            if n == 0 {
                tracing::debug!("server closed the connection");
                self.shutdown(ClientError::ConnectionClosed).await;
                return Err(ClientError::ConnectionClosed);
            }

            let result = self.queue.lock().handle_chunk(&buf[..n]);
            if let Err(e) = result {
                // The queue already cancelled everything; just drop
                // the broken socket.
                self.teardown().await;
                return Err(e);
            }
        }
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns the number of in-flight operations.
    pub fn pending_count(&self) -> usize {
        self.queue.lock().pending_count()
    }

    /// Ends the session and closes the connection. `op` is the final
    /// fire-and-forget request (the server answers with nothing).
    pub async fn close(&self, op: impl Operation + 'static) -> Result<(), ClientError> {
        if self.connected.load(Ordering::SeqCst) {
            let _gate = self.send_gate.lock().await;
            let (_handle, bytes) = self.queue.lock().enqueue(Box::new(op));
            if let Some(bytes) = bytes {
                self.write(&bytes).await.ok();
            }
        }
        self.shutdown(ClientError::ConnectionClosed).await;
        Ok(())
    }

    /// Cancels all pending operations and drops the socket.
    async fn shutdown(&self, err: ClientError) {
        {
            let mut queue = self.queue.lock();
            queue.unbind();
            queue.cancel_all(&err);
        }
        self.teardown().await;
    }

    async fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await.ok();
        }
        let _ = self.reader.lock().await.take();
    }
}
