//! Peer identity: random 16-byte IDs exchanged in the transport handshake.

use std::fmt;

/// Peer ID: random UUID bytes. Used as the key for per-peer channels and the swarm set.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PeerId([u8; 16]);

impl PeerId {
    /// Generate a fresh random peer ID.
    pub fn generate() -> Self {
        PeerId(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}
