//! Live connection registry
//!
//! Tracks the write handles of every connection the server is servicing
//! and fans outbound commands out to them.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use super::connection::{ConnectionId, ConnectionResult, PeerHandle};
use crate::protocol::{CodecError, Command, MAX_FRAME_SIZE};

/// Outcome of one fan-out pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Broadcast {
    /// Peers the command was written to
    pub delivered: usize,
    /// Peers whose write failed and that were dropped from the registry
    pub pruned: Vec<ConnectionId>,
}

/// The server's set of live connections
///
/// Fan-out runs under the shared lock; register, unregister and pruning
/// take the exclusive lock.
pub struct Registry {
    peers: RwLock<HashMap<ConnectionId, PeerHandle>>,
    max_frame_size: usize,
    write_timeout: Option<Duration>,
}

impl Registry {
    pub fn new(max_frame_size: usize, write_timeout: Option<Duration>) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            max_frame_size,
            write_timeout,
        }
    }

    pub async fn insert(&self, peer: PeerHandle) {
        let mut peers = self.peers.write().await;
        peers.insert(peer.id(), peer);
    }

    /// Remove a peer. Removing an absent id is a no-op.
    pub async fn remove(&self, id: ConnectionId) -> Option<PeerHandle> {
        let mut peers = self.peers.write().await;
        peers.remove(&id)
    }

    pub async fn get(&self, id: ConnectionId) -> Option<PeerHandle> {
        let peers = self.peers.read().await;
        peers.get(&id).cloned()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.peers.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Ids of all live peers, in ascending order
    pub async fn ids(&self) -> Vec<ConnectionId> {
        let peers = self.peers.read().await;
        let mut ids: Vec<_> = peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Send a command to every live peer
    pub async fn broadcast(&self, command: &Command) -> Result<Broadcast, CodecError> {
        self.fan_out(command, |_| true).await
    }

    /// Send a command to the listed peers only. Unknown ids are skipped.
    pub async fn send_to(
        &self,
        ids: &[ConnectionId],
        command: &Command,
    ) -> Result<Broadcast, CodecError> {
        self.fan_out(command, |id| ids.contains(&id)).await
    }

    /// Send a command to every live peer except one
    pub async fn broadcast_except(
        &self,
        skip: ConnectionId,
        command: &Command,
    ) -> Result<Broadcast, CodecError> {
        self.fan_out(command, |id| id != skip).await
    }

    /// Unregister and close every peer
    pub async fn close_all(&self) {
        let drained: Vec<PeerHandle> = {
            let mut peers = self.peers.write().await;
            peers.drain().map(|(_, peer)| peer).collect()
        };

        for peer in drained {
            let _ = peer.close().await;
        }
    }

    async fn fan_out<F>(&self, command: &Command, include: F) -> Result<Broadcast, CodecError>
    where
        F: Fn(ConnectionId) -> bool,
    {
        // An unsendable command would otherwise fail every write and empty the registry.
        validate(command, self.max_frame_size)?;

        let mut report = Broadcast::default();
        let mut failed = Vec::new();

        {
            let peers = self.peers.read().await;
            tracing::debug!(
                tag = command.tag,
                len = command.data.len(),
                peers = peers.len(),
                "sending command"
            );

            for (id, peer) in peers.iter() {
                if !include(*id) {
                    continue;
                }

                match self.write_one(peer, command).await {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        tracing::debug!(id, error = %e, "write failed, removing connection");
                        failed.push(peer.clone());
                    }
                }
            }
        }

        if !failed.is_empty() {
            let mut peers = self.peers.write().await;
            for peer in &failed {
                peers.remove(&peer.id());
            }
        }

        for peer in failed {
            let _ = peer.close().await;
            report.pruned.push(peer.id());
        }
        report.pruned.sort_unstable();

        Ok(report)
    }

    async fn write_one(&self, peer: &PeerHandle, command: &Command) -> ConnectionResult<()> {
        peer.send_timeout(command, self.write_timeout).await
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE, None)
    }
}

fn validate(command: &Command, max_frame_size: usize) -> Result<(), CodecError> {
    let payload = command.data.len();
    if payload > crate::protocol::MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge {
            size: payload,
            max: crate::protocol::MAX_PAYLOAD_SIZE,
        });
    }
    if command.frame_len() > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            size: command.frame_len(),
            max: max_frame_size,
        });
    }
    Ok(())
}
