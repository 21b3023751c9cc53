//! Chatwire broadcast server
//!
//! The server accepts connections, keeps them in the registry and pushes
//! every received command onto a bounded event queue for the application
//! layer to consume.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::connection::{Connection, ConnectionError, ConnectionId, ConnectionResult, PeerHandle};
use super::registry::{Broadcast, Registry};
use super::ServerConfig;
use crate::protocol::{CodecError, Command};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events delivered through the inbound queue
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A connection was registered and is about to be read from
    Connected { peer: PeerHandle },
    /// A command arrived from a peer
    Received { command: Command, peer: PeerHandle },
    /// A connection was unregistered and closed
    Disconnected { peer: PeerHandle, reason: String },
}

impl ServerEvent {
    pub fn peer(&self) -> &PeerHandle {
        match self {
            ServerEvent::Connected { peer }
            | ServerEvent::Received { peer, .. }
            | ServerEvent::Disconnected { peer, .. } => peer,
        }
    }
}

/// State shared by the accept loop and every service loop
struct ServiceContext {
    registry: Arc<Registry>,
    events: mpsc::Sender<ServerEvent>,
    next_id: AtomicU64,
    max_frame_size: usize,
    idle_timeout: Option<Duration>,
}

/// Chatwire Server
pub struct Server {
    /// Server configuration
    config: ServerConfig,
    /// Bound listener, handed to the accept loop on start
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    context: Arc<ServiceContext>,
    /// Event receiver (for consumers)
    events_rx: Option<mpsc::Receiver<ServerEvent>>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind the listening socket
    ///
    /// Failing to bind is fatal and reported to the caller.
    pub async fn bind(config: ServerConfig) -> ServerResult<Self> {
        let bind_addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;
        let local_addr = listener.local_addr()?;

        let (events_tx, events_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        let context = ServiceContext {
            registry: Arc::new(Registry::new(config.max_frame_size, config.write_timeout)),
            events: events_tx,
            next_id: AtomicU64::new(0),
            max_frame_size: config.max_frame_size,
            idle_timeout: config.idle_timeout,
        };

        Ok(Self {
            config,
            listener: Some(listener),
            local_addr,
            context: Arc::new(context),
            events_rx: Some(events_rx),
            shutdown_tx,
            accept_task: None,
        })
    }

    /// Take the inbound event receiver (can only be called once)
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.events_rx.take()
    }

    /// Start accepting connections
    pub fn start(&mut self) -> ServerResult<()> {
        if self.accept_task.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        let listener = self.listener.take().ok_or(ServerError::NotRunning)?;

        tracing::info!("Server listening on {}", self.local_addr);

        let context = self.context.clone();
        let shutdown = self.shutdown_tx.subscribe();
        self.accept_task = Some(tokio::spawn(accept_loop(listener, context, shutdown)));

        Ok(())
    }

    /// Stop accepting, then close every live connection
    pub async fn stop(&mut self) -> ServerResult<()> {
        let task = self.accept_task.take().ok_or(ServerError::NotRunning)?;

        self.shutdown_tx.send_replace(true);
        self.context.registry.close_all().await;

        if let Err(e) = task.await {
            tracing::error!("Accept loop ended abnormally: {}", e);
        }

        tracing::info!("Server stopped");
        Ok(())
    }

    /// Check if the server is accepting connections
    pub fn is_running(&self) -> bool {
        self.accept_task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared handle to the live connection registry
    pub fn registry(&self) -> Arc<Registry> {
        self.context.registry.clone()
    }

    /// Number of live connections
    pub async fn size(&self) -> usize {
        self.context.registry.len().await
    }

    /// Send a command to every live connection
    pub async fn send(&self, command: &Command) -> ServerResult<Broadcast> {
        Ok(self.context.registry.broadcast(command).await?)
    }

    /// Send a command to the given connections
    pub async fn send_to(
        &self,
        ids: &[ConnectionId],
        command: &Command,
    ) -> ServerResult<Broadcast> {
        Ok(self.context.registry.send_to(ids, command).await?)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ServiceContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let id = context.next_id.fetch_add(1, Ordering::SeqCst);
                        let conn = Connection::from_tcp(id, stream, context.max_frame_size);
                        context.registry.insert(conn.handle()).await;
                        tracing::info!(id, "New connection from {}", addr);

                        tokio::spawn(serve_connection(conn, context.clone(), shutdown.clone()));
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("Server shutdown requested");
                break;
            }
        }
    }
}

/// Service loop for one connection
async fn serve_connection(
    mut conn: Connection,
    context: Arc<ServiceContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = conn.handle();
    let id = peer.id();

    let connected = ServerEvent::Connected { peer: peer.clone() };
    let reason = if push(&context.events, connected, &mut shutdown).await {
        loop {
            let result = tokio::select! {
                result = read_next(&mut conn, context.idle_timeout) => result,
                _ = shutdown.changed() => break "Server shutting down".to_string(),
            };

            match result {
                Ok(Some(command)) => {
                    tracing::debug!(
                        id,
                        tag = command.tag,
                        len = command.data.len(),
                        "received command"
                    );
                    let event = ServerEvent::Received {
                        command,
                        peer: peer.clone(),
                    };
                    if !push(&context.events, event, &mut shutdown).await {
                        break "Event queue closed".to_string();
                    }
                }
                Ok(None) => {
                    tracing::debug!(id, "connection EOF");
                    break "Connection closed".to_string();
                }
                Err(ConnectionError::Closed) => {
                    break "Connection closed locally".to_string();
                }
                Err(e) => {
                    tracing::warn!(id, error = %e, "error reading from connection");
                    break format!("Error: {}", e);
                }
            }
        }
    } else {
        "Event queue closed".to_string()
    };

    context.registry.remove(id).await;
    let _ = peer.close().await;
    drop(conn);
    tracing::info!(id, "Connection removed: {}", reason);

    push(&context.events, ServerEvent::Disconnected { peer, reason }, &mut shutdown).await;
}

async fn read_next(
    conn: &mut Connection,
    idle_timeout: Option<Duration>,
) -> ConnectionResult<Option<Command>> {
    match idle_timeout {
        Some(limit) => conn.next_timeout(limit).await,
        None => conn.next().await,
    }
}

/// Push an event onto the inbound queue
///
/// Blocks while the queue is full. Once shutdown has begun the push no
/// longer waits for room. Returns false if the event was not queued.
async fn push(
    events: &mpsc::Sender<ServerEvent>,
    event: ServerEvent,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    if *shutdown.borrow() {
        return events.try_send(event).is_ok();
    }

    tokio::select! {
        result = events.send(event) => result.is_ok(),
        _ = shutdown.changed() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn wait_for_size(server: &Server, size: usize) {
        for _ in 0..200 {
            if server.size().await == size {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server never reached {} connections", size);
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let mut server = Server::bind(local_config()).await.unwrap();
        assert!(!server.is_running());
        assert!(matches!(server.stop().await, Err(ServerError::NotRunning)));

        server.start().unwrap();
        assert!(server.is_running());
        assert!(matches!(server.start(), Err(ServerError::AlreadyRunning)));

        server.stop().await.unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let first = Server::bind(local_config()).await.unwrap();
        let config = ServerConfig {
            port: first.local_addr().port(),
            ..local_config()
        };

        let err = Server::bind(config).await.err().unwrap();
        assert!(matches!(err, ServerError::BindFailed(_)));
    }

    #[tokio::test]
    async fn test_receive_and_broadcast_over_tcp() {
        let mut server = Server::bind(local_config()).await.unwrap();
        let mut events = server.take_events().unwrap();
        assert!(server.take_events().is_none());
        server.start().unwrap();

        let addr = server.local_addr();
        let mut alice = TcpStream::connect(addr).await.unwrap();
        let first = next_event(&mut events).await;
        assert!(matches!(first, ServerEvent::Connected { .. }));
        let alice_id = first.peer().id();

        let mut bob = TcpStream::connect(addr).await.unwrap();
        let second = next_event(&mut events).await;
        assert!(matches!(second, ServerEvent::Connected { .. }));
        assert_eq!(second.peer().id(), alice_id + 1);
        wait_for_size(&server, 2).await;

        let cmd = Command::new(b'm', "hello world");
        bob.write_all(&encode(&cmd).unwrap()).await.unwrap();
        match next_event(&mut events).await {
            ServerEvent::Received { command, peer } => {
                assert_eq!(command, cmd);
                assert_eq!(peer.id(), alice_id + 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let report = server.send(&cmd).await.unwrap();
        assert_eq!(report.delivered, 2);

        let expected = encode(&cmd).unwrap().to_vec();
        for stream in [&mut alice, &mut bob] {
            let mut buf = vec![0u8; expected.len()];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, expected);
        }

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let mut server = Server::bind(local_config()).await.unwrap();
        let mut events = server.take_events().unwrap();
        server.start().unwrap();

        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let connected = next_event(&mut events).await;
        wait_for_size(&server, 1).await;

        drop(stream);
        match next_event(&mut events).await {
            ServerEvent::Disconnected { peer, .. } => {
                assert_eq!(peer.id(), connected.peer().id());
                assert!(peer.is_closed());
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(server.size().await, 0);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_protocol_violation_closes_only_offender() {
        let mut server = Server::bind(local_config()).await.unwrap();
        let mut events = server.take_events().unwrap();
        server.start().unwrap();
        let addr = server.local_addr();

        let mut good = TcpStream::connect(addr).await.unwrap();
        next_event(&mut events).await;
        let mut bad = TcpStream::connect(addr).await.unwrap();
        let bad_id = next_event(&mut events).await.peer().id();
        wait_for_size(&server, 2).await;

        bad.write_all(&[7, b'm', 0, 0]).await.unwrap();
        match next_event(&mut events).await {
            ServerEvent::Disconnected { peer, reason } => {
                assert_eq!(peer.id(), bad_id);
                assert!(reason.contains("version"), "reason: {}", reason);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(server.size().await, 1);

        let cmd = Command::new(b'm', "survivor");
        good.write_all(&encode(&cmd).unwrap()).await.unwrap();
        match next_event(&mut events).await {
            ServerEvent::Received { command, .. } => assert_eq!(command, cmd),
            other => panic!("unexpected event: {:?}", other),
        }

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let config = ServerConfig {
            inbound_capacity: 1,
            ..local_config()
        };
        let mut server = Server::bind(config).await.unwrap();
        let mut events = server.take_events().unwrap();
        server.start().unwrap();

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        for i in 0..5u8 {
            client
                .write_all(&encode(&Command::new(b'm', vec![i])).unwrap())
                .await
                .unwrap();
        }

        // Nothing is lost while the consumer lags; it all arrives in order.
        assert!(matches!(next_event(&mut events).await, ServerEvent::Connected { .. }));
        for i in 0..5u8 {
            match next_event(&mut events).await {
                ServerEvent::Received { command, .. } => assert_eq!(command.data.as_ref(), &[i]),
                other => panic!("unexpected event: {:?}", other),
            }
        }

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_peer_service_loop_ends() {
        let mut server = Server::bind(local_config()).await.unwrap();
        let mut events = server.take_events().unwrap();
        server.start().unwrap();

        // The client stays connected and silent throughout.
        let _client = TcpStream::connect(server.local_addr()).await.unwrap();
        let peer = next_event(&mut events).await.peer().clone();
        wait_for_size(&server, 1).await;

        // Same effect as a prune after a failed write.
        server.registry().remove(peer.id()).await;
        peer.close().await.unwrap();

        match next_event(&mut events).await {
            ServerEvent::Disconnected { peer: gone, .. } => assert_eq!(gone.id(), peer.id()),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(server.size().await, 0);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_clients() {
        let mut server = Server::bind(local_config()).await.unwrap();
        let mut events = server.take_events().unwrap();
        server.start().unwrap();

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        next_event(&mut events).await;
        wait_for_size(&server, 1).await;

        server.stop().await.unwrap();
        assert_eq!(server.size().await, 0);

        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }
}
