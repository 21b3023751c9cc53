//! Connection handling for chatwire
//!
//! A `Connection` pairs a frame reader and a frame writer with one stream
//! endpoint. The write side lives behind a shareable `PeerHandle`, which is
//! what the server registry keeps; the read side stays with the task that
//! services the connection.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

use super::reader::FrameReader;
use super::writer::FrameWriter;
use crate::protocol::{decode, CodecError, Command, MAX_FRAME_SIZE};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Connection timeout")]
    Timeout,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Identifier assigned to a connection at accept time
pub type ConnectionId = u64;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct PeerShared {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    name: RwLock<Option<String>>,
    writer: Mutex<FrameWriter<BoxedWriter>>,
    /// Set once on close; pending reads wait on it
    closed: watch::Sender<bool>,
}

/// A shareable handle to the write side of a connection
///
/// Cloning is cheap. All clones refer to the same peer and share its
/// writer, display name and closed state.
#[derive(Clone)]
pub struct PeerHandle {
    shared: Arc<PeerShared>,
}

impl PeerHandle {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote_addr
    }

    /// Current display name, if one was set
    pub fn name(&self) -> Option<String> {
        match self.shared.name.read() {
            Ok(name) => name.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        match self.shared.name.write() {
            Ok(mut slot) => *slot = Some(name),
            Err(poisoned) => *poisoned.into_inner() = Some(name),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Write one command to the peer
    pub async fn send(&self, command: &Command) -> ConnectionResult<()> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let mut writer = self.shared.writer.lock().await;
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        writer.write_command(command).await
    }

    /// Write one command, giving up after `timeout` if one is set
    pub async fn send_timeout(
        &self,
        command: &Command,
        timeout: Option<Duration>,
    ) -> ConnectionResult<()> {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.send(command)).await {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Timeout),
            },
            None => self.send(command).await,
        }
    }

    /// Close the write side of the stream
    ///
    /// Idempotent. A read waiting in `Connection::next` is woken, and later
    /// sends and reads fail with `ConnectionError::Closed`.
    pub async fn close(&self) -> ConnectionResult<()> {
        if self.shared.closed.send_replace(true) {
            return Ok(());
        }

        let mut writer = self.shared.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            // The peer may already be gone; the connection is closed either way.
            tracing::debug!(id = self.id(), error = %e, "shutdown after close failed");
        }
        Ok(())
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("remote_addr", &self.remote_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Represents one live stream endpoint
pub struct Connection {
    peer: PeerHandle,
    reader: FrameReader<BoxedReader>,
}

impl Connection {
    /// Create a connection over separate read and write halves
    pub fn new<R, W>(id: ConnectionId, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::build(id, None, Box::new(reader), Box::new(writer), MAX_FRAME_SIZE)
    }

    /// Create a connection with a frame ceiling other than the protocol's
    pub fn with_max_frame_size<R, W>(
        id: ConnectionId,
        reader: R,
        writer: W,
        max_frame_size: usize,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::build(id, None, Box::new(reader), Box::new(writer), max_frame_size)
    }

    /// Create a connection from an established TCP stream
    pub fn from_tcp(id: ConnectionId, stream: TcpStream, max_frame_size: usize) -> Self {
        let remote_addr = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(id, error = %e, "failed to set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        Self::build(
            id,
            remote_addr,
            Box::new(read_half),
            Box::new(write_half),
            max_frame_size,
        )
    }

    fn build(
        id: ConnectionId,
        remote_addr: Option<SocketAddr>,
        reader: BoxedReader,
        writer: BoxedWriter,
        max_frame_size: usize,
    ) -> Self {
        let shared = PeerShared {
            id,
            remote_addr,
            name: RwLock::new(None),
            writer: Mutex::new(FrameWriter::with_max_frame_size(writer, max_frame_size)),
            closed: watch::channel(false).0,
        };

        Self {
            peer: PeerHandle {
                shared: Arc::new(shared),
            },
            reader: FrameReader::with_max_frame_size(reader, max_frame_size),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.peer.id()
    }

    pub fn name(&self) -> Option<String> {
        self.peer.name()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.peer.set_name(name)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer.remote_addr()
    }

    /// A handle to this connection's write side
    pub fn handle(&self) -> PeerHandle {
        self.peer.clone()
    }

    /// Receive the next command
    ///
    /// Returns `Ok(None)` when the peer closed the stream between frames
    /// and `ConnectionError::Closed` once the connection is closed locally,
    /// including while this call is waiting for data.
    pub async fn next(&mut self) -> ConnectionResult<Option<Command>> {
        let mut closed = self.peer.shared.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(ConnectionError::Closed);
        }

        let frame = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => return Err(ConnectionError::Closed),
            result = self.reader.read_frame() => result?,
        };

        match frame {
            Some(frame) => Ok(Some(decode(&frame)?)),
            None => Ok(None),
        }
    }

    /// Receive the next command with a timeout
    pub async fn next_timeout(&mut self, timeout: Duration) -> ConnectionResult<Option<Command>> {
        match tokio::time::timeout(timeout, self.next()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    /// Send a command to the peer
    pub async fn send(&self, command: &Command) -> ConnectionResult<()> {
        self.peer.send(command).await
    }

    /// Close the connection
    pub async fn close(&self) -> ConnectionResult<()> {
        self.peer.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.peer.is_closed()
    }
}

/// Resolves once the close flag is set
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // The sender lives as long as the connection, so this only ends on close.
    let _ = closed.wait_for(|closed| *closed).await;
}
