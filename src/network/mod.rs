//! Network module - Handles TCP communication between chat peers
//!
//! Provides:
//! - Frame reader and writer over any async byte stream
//! - Connections pairing the two with an identity
//! - A registry and broadcast server for accepted connections
//! - A small dial helper for clients

mod client;
mod connection;
mod reader;
mod registry;
mod server;
mod writer;

pub use client::*;
pub use connection::*;
pub use reader::*;
pub use registry::*;
pub use server::*;
pub use writer::*;

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::{DEFAULT_PORT, MAX_FRAME_SIZE};

/// Default capacity of the server's inbound event queue
pub const DEFAULT_INBOUND_CAPACITY: usize = 10;

/// Runtime configuration for the broadcast server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind to
    pub host: String,
    /// Port to listen on (0 picks a free port)
    pub port: u16,
    /// Capacity of the inbound event queue
    pub inbound_capacity: usize,
    /// Largest frame accepted or sent, header included
    pub max_frame_size: usize,
    /// Per-peer write deadline during fan-out
    pub write_timeout: Option<Duration>,
    /// Drop connections that stay silent this long
    pub idle_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            max_frame_size: MAX_FRAME_SIZE,
            write_timeout: None,
            idle_timeout: None,
        }
    }
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
