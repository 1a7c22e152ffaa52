//! Host-driven API: Resolver receives events from host, returns actions.
//!
//! Source selection per resource: cache, then the swarm (broadcast request with a
//! deadline), then the origin once the deadline passes or when no peer is connected.
//! Time is passed in by the host; the resolver never sleeps or spawns.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cache::{ChunkCache, MAX_CACHE_SIZE};
use crate::identity::PeerId;
use crate::protocol::Message;
use crate::stats::{MetricEvent, TrafficStats};
use crate::swarm::SwarmTracker;
use crate::wire;

/// How long a broadcast request may go unanswered before falling back to the origin.
pub const P2P_TIMEOUT: Duration = Duration::from_millis(1500);

/// Tunables for a resolver instance.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub cache_capacity: usize,
    pub p2p_timeout: Duration,
    /// After serving a cache hit, still ask the swarm/origin for the resource and deliver
    /// it a second time when it arrives.
    pub refetch_on_cache_hit: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_capacity: MAX_CACHE_SIZE,
            p2p_timeout: P2P_TIMEOUT,
            refetch_on_cache_hit: true,
        }
    }
}

/// Where a delivered chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSource {
    Cache,
    Peer(PeerId),
    Origin,
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundAction {
    /// Send this frame to every connected peer.
    Broadcast(Vec<u8>),
    /// Send this frame to one peer.
    SendMessage(PeerId, Vec<u8>),
    /// Fetch the resource from the origin; report back with `on_origin_fetched` / `on_origin_failed`.
    FetchOrigin(String),
    /// Hand the chunk to the consumer. May happen twice for one resolve (cache hit, then refetch).
    Deliver {
        resource: String,
        chunk: Vec<u8>,
        source: ChunkSource,
    },
    /// The origin could not provide the resource; nothing will be delivered for it.
    ResolveFailed { resource: String, reason: String },
    Metric(MetricEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitingPeer { deadline: Instant },
    AwaitingOrigin,
}

/// The single in-flight resolution.
#[derive(Debug)]
struct Pending {
    resource: String,
    stage: Stage,
}

/// Main coordinator. Host passes events; resolver returns actions.
pub struct Resolver {
    cache: ChunkCache,
    swarm: SwarmTracker,
    pending: Option<Pending>,
    stats: TrafficStats,
    p2p_timeout: Duration,
    refetch_on_cache_hit: bool,
}

impl Resolver {
    pub fn new() -> Self {
        Self::with_config(ResolverConfig::default())
    }

    pub fn with_config(config: ResolverConfig) -> Self {
        Self {
            cache: ChunkCache::new(config.cache_capacity),
            swarm: SwarmTracker::new(),
            pending: None,
            stats: TrafficStats::default(),
            p2p_timeout: config.p2p_timeout,
            refetch_on_cache_hit: config.refetch_on_cache_hit,
        }
    }

    /// Set custom P2P timeout. Applies to requests armed after the call.
    pub fn set_p2p_timeout(&mut self, timeout: Duration) {
        self.p2p_timeout = timeout;
    }

    pub fn set_refetch_on_cache_hit(&mut self, refetch: bool) {
        self.refetch_on_cache_hit = refetch;
    }

    /// Consumer asks for a resource. The result arrives later as a `Deliver` action.
    pub fn resolve(&mut self, resource: &str, now: Instant) -> Vec<OutboundAction> {
        if self.pending_resource() == Some(resource) {
            debug!(resource, "already pending, skipping duplicate request");
            return Vec::new();
        }
        if let Some(abandoned) = self.pending.take() {
            debug!(
                resource = %abandoned.resource,
                "replaced by newer request; a late offer will be treated as unsolicited"
            );
        }

        let mut actions = Vec::new();
        if let Some(chunk) = self.cache.get(resource) {
            let chunk = chunk.to_vec();
            self.stats.cache_hits = self.stats.cache_hits.saturating_add(1);
            debug!(resource, "serving from cache");
            self.deliver(resource.to_string(), chunk, ChunkSource::Cache, &mut actions);
            if !self.refetch_on_cache_hit {
                return actions;
            }
        }

        if self.swarm.is_empty() {
            info!(resource, "no peers available, fetching from origin");
            self.fetch_from_origin(resource, &mut actions);
            return actions;
        }

        match wire::encode_frame(&Message::request(resource)) {
            Ok(frame) => {
                info!(resource, peers = self.swarm.size(), "requesting from swarm");
                actions.push(OutboundAction::Broadcast(frame));
                self.pending = Some(Pending {
                    resource: resource.to_string(),
                    stage: Stage::AwaitingPeer {
                        deadline: now + self.p2p_timeout,
                    },
                });
            }
            Err(e) => {
                warn!(resource, error = %e, "cannot encode request, fetching from origin");
                self.fetch_from_origin(resource, &mut actions);
            }
        }
        actions
    }

    /// Process a received wire frame from `peer`. Undecodable frames are an error the host
    /// should log and otherwise ignore; resolver state is untouched.
    pub fn on_message_received(
        &mut self,
        peer: PeerId,
        bytes: &[u8],
    ) -> Result<Vec<OutboundAction>, MessageError> {
        let (msg, _consumed) =
            wire::decode_frame(bytes).map_err(|_| MessageError::DecodeFailed)?;
        Ok(self.on_message(peer, msg))
    }

    /// Process a decoded message from `peer`.
    pub fn on_message(&mut self, peer: PeerId, msg: Message) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        let action = msg.action();
        match msg {
            Message::Request { resource } => match self.cache.get(&resource) {
                Some(chunk) => {
                    let len = chunk.len() as u64;
                    match wire::encode_frame(&Message::offer(resource.as_str(), chunk.to_vec())) {
                        Ok(frame) => {
                            debug!(resource = %resource, %peer, "sending chunk to peer");
                            actions.push(OutboundAction::SendMessage(peer, frame));
                            self.metric(MetricEvent::BytesSentP2p(len), &mut actions);
                        }
                        Err(e) => warn!(resource = %resource, error = %e, "cannot encode offer"),
                    }
                }
                None => debug!(resource = %resource, %peer, action, "no action, not cached"),
            },
            Message::Offer { resource, chunk } => {
                if self.awaiting_peer(&resource) {
                    // Dropping the pending state cancels the deadline in the same step as delivery.
                    self.pending = None;
                    info!(resource = %resource, %peer, "chunk received from swarm");
                    self.metric(MetricEvent::BytesRecvP2p(chunk.len() as u64), &mut actions);
                    self.deliver(resource, chunk, ChunkSource::Peer(peer), &mut actions);
                } else if !self.cache.contains(&resource) {
                    debug!(resource = %resource, %peer, "unsolicited offer, caching");
                    self.put_in_cache(resource, chunk);
                } else {
                    debug!(resource = %resource, %peer, action, "no action, already cached");
                }
            }
        }
        actions
    }

    /// Peer joined the swarm.
    pub fn on_peer_joined(&mut self, peer: PeerId) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        if self.swarm.on_peer_join(peer) {
            debug!(%peer, size = self.swarm.size(), "peer joined");
            self.metric(MetricEvent::SwarmSize(self.swarm.size()), &mut actions);
        }
        actions
    }

    /// Peer left the swarm. A pending request keeps its deadline; it simply may not be answered.
    pub fn on_peer_left(&mut self, peer: PeerId) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        if self.swarm.on_peer_leave(peer) {
            debug!(%peer, size = self.swarm.size(), "peer left");
            self.metric(MetricEvent::SwarmSize(self.swarm.size()), &mut actions);
        }
        actions
    }

    /// Fire the P2P deadline if it has passed. Fires at most once per request.
    pub fn poll_timeout(&mut self, now: Instant) -> Vec<OutboundAction> {
        let Some(pending) = &mut self.pending else {
            return Vec::new();
        };
        let stage = pending.stage;
        match stage {
            Stage::AwaitingPeer { deadline } if now >= deadline => {
                pending.stage = Stage::AwaitingOrigin;
                self.stats.p2p_timeouts = self.stats.p2p_timeouts.saturating_add(1);
                info!(resource = %pending.resource, "no peer answered in time, fetching from origin");
                vec![OutboundAction::FetchOrigin(pending.resource.clone())]
            }
            _ => Vec::new(),
        }
    }

    /// When the host should next call `poll_timeout`.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.pending.as_ref()?.stage {
            Stage::AwaitingPeer { deadline } => Some(deadline),
            Stage::AwaitingOrigin => None,
        }
    }

    /// Origin returned the chunk.
    pub fn on_origin_fetched(&mut self, resource: &str, chunk: Vec<u8>) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        debug!(resource, bytes = chunk.len(), "chunk received from origin");
        self.metric(MetricEvent::BytesRecvCdn(chunk.len() as u64), &mut actions);
        self.deliver(resource.to_string(), chunk, ChunkSource::Origin, &mut actions);
        actions
    }

    /// Origin fetch failed. No retry: the resolution ends and the consumer is told, unless
    /// the same resource has since been re-requested from the swarm.
    pub fn on_origin_failed(&mut self, resource: &str, reason: &str) -> Vec<OutboundAction> {
        warn!(resource, reason, "origin fetch failed");
        self.stats.origin_failures = self.stats.origin_failures.saturating_add(1);
        let stage = match &self.pending {
            Some(p) if p.resource == resource => Some(p.stage),
            _ => None,
        };
        match stage {
            Some(Stage::AwaitingOrigin) => self.pending = None,
            // A stale fetch failed while a newer resolution of the same resource awaits peers.
            Some(Stage::AwaitingPeer { .. }) => {
                debug!(resource, "stale origin failure, resolution still awaiting peers");
                return Vec::new();
            }
            None => {}
        }
        vec![OutboundAction::ResolveFailed {
            resource: resource.to_string(),
            reason: reason.to_string(),
        }]
    }

    pub fn pending_resource(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.resource.as_str())
    }

    pub fn cache(&self) -> &ChunkCache {
        &self.cache
    }

    pub fn swarm(&self) -> &SwarmTracker {
        &self.swarm
    }

    pub fn stats(&self) -> &TrafficStats {
        &self.stats
    }

    fn awaiting_peer(&self, resource: &str) -> bool {
        matches!(
            &self.pending,
            Some(Pending { resource: r, stage: Stage::AwaitingPeer { .. } }) if r == resource
        )
    }

    fn fetch_from_origin(&mut self, resource: &str, actions: &mut Vec<OutboundAction>) {
        self.pending = Some(Pending {
            resource: resource.to_string(),
            stage: Stage::AwaitingOrigin,
        });
        actions.push(OutboundAction::FetchOrigin(resource.to_string()));
    }

    /// Cache the chunk, clear the pending marker if it was for this resource, hand to consumer.
    fn deliver(
        &mut self,
        resource: String,
        chunk: Vec<u8>,
        source: ChunkSource,
        actions: &mut Vec<OutboundAction>,
    ) {
        if self.pending_resource() == Some(resource.as_str()) {
            self.pending = None;
        }
        if source != ChunkSource::Cache {
            self.put_in_cache(resource.clone(), chunk.clone());
        }
        actions.push(OutboundAction::Deliver {
            resource,
            chunk,
            source,
        });
    }

    fn put_in_cache(&mut self, resource: String, chunk: Vec<u8>) {
        if let Some(evicted) = self.cache.put(resource, chunk) {
            debug!(resource = %evicted, "removing from cache");
        }
    }

    fn metric(&mut self, event: MetricEvent, actions: &mut Vec<OutboundAction>) {
        self.stats.record(event);
        actions.push(OutboundAction::Metric(event));
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to decode message")]
    DecodeFailed,
}
