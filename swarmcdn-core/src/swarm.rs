//! Swarm tracker: which peers are currently connected.

use std::collections::HashSet;

use crate::identity::PeerId;

/// Connected peer set. Only its size gates the P2P attempt; requests go to every peer.
#[derive(Debug, Default, Clone)]
pub struct SwarmTracker {
    peers: HashSet<PeerId>,
}

impl SwarmTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a join. Returns true if the swarm grew (a repeated join is ignored).
    pub fn on_peer_join(&mut self, peer: PeerId) -> bool {
        self.peers.insert(peer)
    }

    /// Record a leave. Returns true if the swarm shrank; leaving without a join is a no-op,
    /// so the size never goes below zero.
    pub fn on_peer_leave(&mut self, peer: PeerId) -> bool {
        self.peers.remove(&peer)
    }

    pub fn size(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
