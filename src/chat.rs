//! Chat relay
//!
//! The application layer on top of the broadcast server: named users,
//! join/leave announcements and message relay. The transport knows nothing
//! about these tags.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::network::{PeerHandle, Registry, ServerEvent};
use crate::protocol::{CodecError, Command};

/// Command tags understood by the chat layer
pub mod tags {
    /// Chat line; server-relayed copies carry a `"<name>: "` prefix
    pub const MESSAGE: u8 = b'm';
    /// Sets the sender's display name
    pub const NAME: u8 = b'n';
    /// Join announcement
    pub const JOIN: u8 = b'j';
    /// Leave announcement
    pub const LEAVE: u8 = b'l';
}

/// Name used for peers that never picked one
pub const ANONYMOUS: &str = "Anonymous";

/// Consumes server events and relays chat traffic to every peer
pub struct ChatRelay {
    registry: Arc<Registry>,
}

impl ChatRelay {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Process events until the queue closes
    pub async fn run(&self, mut events: mpsc::Receiver<ServerEvent>) {
        while let Some(event) = events.recv().await {
            let id = event.peer().id();
            if let Err(e) = self.handle(event).await {
                tracing::warn!(id, error = %e, "dropping chat event");
            }
        }
        tracing::debug!("event queue closed, relay stopping");
    }

    /// Handle one server event
    pub async fn handle(&self, event: ServerEvent) -> Result<(), CodecError> {
        match event {
            ServerEvent::Connected { peer } => {
                tracing::debug!(id = peer.id(), addr = ?peer.remote_addr(), "peer connected");
                Ok(())
            }
            ServerEvent::Received { command, peer } => self.on_command(command, peer).await,
            ServerEvent::Disconnected { peer, reason } => {
                tracing::debug!(id = peer.id(), %reason, "peer disconnected");
                match peer.name() {
                    Some(name) => {
                        let notice = format!("{} has left the chat", name);
                        tracing::info!("{}", notice);
                        self.registry
                            .broadcast(&Command::new(tags::LEAVE, notice))
                            .await?;
                        Ok(())
                    }
                    None => Ok(()),
                }
            }
        }
    }

    async fn on_command(&self, command: Command, peer: PeerHandle) -> Result<(), CodecError> {
        match command.tag {
            tags::NAME => {
                let name = normalize_name(&command.text());
                peer.set_name(name.clone());

                let notice = format!("{} has joined the chat", name);
                tracing::info!(id = peer.id(), "{}", notice);
                self.registry
                    .broadcast(&Command::new(tags::JOIN, notice))
                    .await?;
            }
            tags::MESSAGE => {
                let name = peer.name().unwrap_or_else(|| ANONYMOUS.to_string());
                let line = format!("{}: {}", name, command.text().trim_end());
                tracing::debug!(id = peer.id(), "{}", line);
                self.registry
                    .broadcast(&Command::new(tags::MESSAGE, line))
                    .await?;
            }
            other => {
                tracing::debug!(id = peer.id(), tag = other, "ignoring unknown command");
            }
        }
        Ok(())
    }
}

fn normalize_name(raw: &str) -> String {
    let name = raw.trim();
    if name.is_empty() {
        ANONYMOUS.to_string()
    } else {
        name.to_string()
    }
}
