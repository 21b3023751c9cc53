//! Client-side dialing

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

use super::connection::{Connection, ConnectionError, ConnectionResult};
use crate::protocol::MAX_FRAME_SIZE;

/// Connect to a chatwire server
///
/// The returned connection has id 0; ids are only meaningful server-side.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> ConnectionResult<Connection> {
    tracing::info!("Connecting to {}", addr);

    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ConnectionError::Io(e)),
        Err(_) => return Err(ConnectionError::Timeout),
    };

    Ok(Connection::from_tcp(0, stream, MAX_FRAME_SIZE))
}
