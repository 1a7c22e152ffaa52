//! swarmcdn wire protocol: message types and version.

use serde::{Deserialize, Serialize};

/// Current protocol version. Sent as the first byte of the transport handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Peer-to-peer messages. Encoding is bincode; framing is length-prefix (see wire module).
///
/// A request never carries a chunk and an offer always does; the enum shape enforces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Ask every connected peer for a resource. Peers that do not hold it stay silent.
    #[serde(rename = "req")]
    Request { resource: String },
    /// Chunk payload for a resource, either answering a request or pushed unsolicited.
    #[serde(rename = "offer")]
    Offer { resource: String, chunk: Vec<u8> },
}

impl Message {
    pub fn request(resource: impl Into<String>) -> Self {
        Message::Request {
            resource: resource.into(),
        }
    }

    pub fn offer(resource: impl Into<String>, chunk: Vec<u8>) -> Self {
        Message::Offer {
            resource: resource.into(),
            chunk,
        }
    }

    /// Resource identifier carried by either variant.
    pub fn resource(&self) -> &str {
        match self {
            Message::Request { resource } | Message::Offer { resource, .. } => resource,
        }
    }

    /// Short action name, as used in logs.
    pub fn action(&self) -> &'static str {
        match self {
            Message::Request { .. } => "req",
            Message::Offer { .. } => "offer",
        }
    }
}
