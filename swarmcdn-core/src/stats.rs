//! Traffic counters reported to the host's metrics sink.

use serde::Serialize;

/// Per-peer / per-source byte counters and swarm size. Fire-and-forget: nothing in the
/// resolver reads these back.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficStats {
    pub bytes_sent_p2p: u64,
    pub bytes_recv_p2p: u64,
    pub bytes_recv_cdn: u64,
    pub swarm_size: usize,
    pub cache_hits: u64,
    pub p2p_timeouts: u64,
    pub origin_failures: u64,
}

impl TrafficStats {
    /// Share of received bytes that came from peers (0.0 when nothing was received).
    pub fn p2p_ratio(&self) -> f64 {
        let total = self.bytes_recv_p2p + self.bytes_recv_cdn;
        if total == 0 {
            return 0.0;
        }
        self.bytes_recv_p2p as f64 / total as f64
    }

    pub(crate) fn record(&mut self, event: MetricEvent) {
        match event {
            MetricEvent::BytesSentP2p(n) => {
                self.bytes_sent_p2p = self.bytes_sent_p2p.saturating_add(n)
            }
            MetricEvent::BytesRecvP2p(n) => {
                self.bytes_recv_p2p = self.bytes_recv_p2p.saturating_add(n)
            }
            MetricEvent::BytesRecvCdn(n) => {
                self.bytes_recv_cdn = self.bytes_recv_cdn.saturating_add(n)
            }
            MetricEvent::SwarmSize(n) => self.swarm_size = n,
        }
    }
}

/// Single metric update, mirrored to the host as an outbound action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    BytesSentP2p(u64),
    BytesRecvP2p(u64),
    BytesRecvCdn(u64),
    SwarmSize(usize),
}
