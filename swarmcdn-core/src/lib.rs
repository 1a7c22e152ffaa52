//! swarmcdn resolution engine.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod cache;
pub mod identity;
pub mod protocol;
pub mod resolver;
pub mod stats;
pub mod swarm;
pub mod wire;

pub use cache::{ChunkCache, MAX_CACHE_SIZE};
pub use identity::PeerId;
pub use protocol::{Message, PROTOCOL_VERSION};
pub use resolver::{
    ChunkSource, MessageError, OutboundAction, Resolver, ResolverConfig, P2P_TIMEOUT,
};
pub use stats::{MetricEvent, TrafficStats};
pub use swarm::SwarmTracker;
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
