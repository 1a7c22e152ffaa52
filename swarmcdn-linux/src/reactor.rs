//! Single task that owns the resolver. Every input (player request, peer frame, origin
//! result, deadline) arrives as an event and is handled to completion before the next one.

use std::collections::HashMap;
use std::time::Instant;

use swarmcdn_core::{ChunkSource, OutboundAction, PeerId, Resolver, TrafficStats};
use tokio::sync::{mpsc, oneshot};

use crate::origin::OriginClient;

/// Outcome handed back to a waiting player request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Chunk(Vec<u8>),
    Failed(String),
}

/// Inputs to the reactor.
pub enum Event {
    /// Player wants a resource; answered once on `reply`.
    Resolve {
        resource: String,
        reply: oneshot::Sender<Delivery>,
    },
    /// Handshake completed; frames for this peer go to `tx`.
    PeerConnected {
        peer: PeerId,
        conn: u64,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    },
    PeerDisconnected {
        peer: PeerId,
        conn: u64,
    },
    /// One whole length-prefixed frame from a peer.
    PeerFrame(PeerId, Vec<u8>),
    OriginFetched {
        resource: String,
        chunk: Vec<u8>,
    },
    OriginFailed {
        resource: String,
        reason: String,
    },
    Stats(oneshot::Sender<TrafficStats>),
}

pub type EventSender = mpsc::UnboundedSender<Event>;

pub fn channel() -> (EventSender, mpsc::UnboundedReceiver<Event>) {
    mpsc::unbounded_channel()
}

struct PeerLink {
    conn: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

pub struct Reactor {
    resolver: Resolver,
    origin: OriginClient,
    peers: HashMap<PeerId, PeerLink>,
    /// Player requests waiting for a resource, answered only by `Deliver` / `ResolveFailed`.
    /// A request replaced by a newer one stays here until its player times out.
    waiters: HashMap<String, Vec<oneshot::Sender<Delivery>>>,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

impl Reactor {
    pub fn new(
        resolver: Resolver,
        origin: OriginClient,
        events_tx: EventSender,
        events_rx: mpsc::UnboundedReceiver<Event>,
    ) -> Self {
        Self {
            resolver,
            origin,
            peers: HashMap::new(),
            waiters: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    /// Run until every event sender is gone.
    pub async fn run(mut self) {
        loop {
            let deadline = self.resolver.next_deadline();
            tokio::select! {
                ev = self.events_rx.recv() => match ev {
                    Some(ev) => self.handle(ev),
                    None => break,
                },
                _ = sleep_until(deadline) => {
                    let actions = self.resolver.poll_timeout(Instant::now());
                    self.execute(actions);
                }
            }
        }
        tracing::debug!("reactor stopped");
    }

    fn handle(&mut self, ev: Event) {
        self.prune_waiters();
        let actions = match ev {
            Event::Resolve { resource, reply } => {
                self.waiters.entry(resource.clone()).or_default().push(reply);
                self.resolver.resolve(&resource, Instant::now())
            }
            Event::PeerConnected { peer, conn, tx } => {
                tracing::info!(%peer, conn, "peer connected");
                self.peers.insert(peer, PeerLink { conn, tx });
                self.resolver.on_peer_joined(peer)
            }
            Event::PeerDisconnected { peer, conn } => {
                // A newer connection for the same peer may have replaced this one.
                if self.peers.get(&peer).map(|l| l.conn) != Some(conn) {
                    return;
                }
                tracing::info!(%peer, conn, "peer disconnected");
                self.peers.remove(&peer);
                self.resolver.on_peer_left(peer)
            }
            Event::PeerFrame(peer, frame) => {
                match self.resolver.on_message_received(peer, &frame) {
                    Ok(actions) => actions,
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "ignoring malformed peer message");
                        return;
                    }
                }
            }
            Event::OriginFetched { resource, chunk } => {
                self.resolver.on_origin_fetched(&resource, chunk)
            }
            Event::OriginFailed { resource, reason } => {
                self.resolver.on_origin_failed(&resource, &reason)
            }
            Event::Stats(reply) => {
                let _ = reply.send(self.resolver.stats().clone());
                return;
            }
        };
        self.execute(actions);
    }

    fn execute(&mut self, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::Broadcast(frame) => {
                    for link in self.peers.values() {
                        let _ = link.tx.send(frame.clone());
                    }
                }
                OutboundAction::SendMessage(peer, frame) => {
                    if let Some(link) = self.peers.get(&peer) {
                        let _ = link.tx.send(frame);
                    }
                }
                OutboundAction::FetchOrigin(resource) => self.spawn_origin_fetch(resource),
                OutboundAction::Deliver {
                    resource,
                    chunk,
                    source,
                } => {
                    tracing::info!(
                        resource = %resource,
                        source = source_name(source),
                        bytes = chunk.len(),
                        "chunk delivered"
                    );
                    self.answer(&resource, Delivery::Chunk(chunk));
                }
                OutboundAction::ResolveFailed { resource, reason } => {
                    self.answer(&resource, Delivery::Failed(reason));
                }
                OutboundAction::Metric(event) => {
                    tracing::debug!(target: "swarmcdn::metrics", ?event);
                }
            }
        }
    }

    fn answer(&mut self, resource: &str, delivery: Delivery) {
        match self.waiters.remove(resource) {
            Some(waiters) => {
                for w in waiters {
                    let _ = w.send(delivery.clone());
                }
            }
            None => tracing::debug!(resource, "no player waiting, dropping delivery"),
        }
    }

    /// Drop requests whose player already gave up (timed out or disconnected).
    fn prune_waiters(&mut self) {
        self.waiters.retain(|_, ws| {
            ws.retain(|w| !w.is_closed());
            !ws.is_empty()
        });
    }

    fn spawn_origin_fetch(&self, resource: String) {
        let origin = self.origin.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let ev = match origin.fetch(&resource).await {
                Ok(chunk) => Event::OriginFetched { resource, chunk },
                Err(e) => Event::OriginFailed {
                    resource,
                    reason: e.to_string(),
                },
            };
            let _ = events.send(ev);
        });
    }
}

fn source_name(source: ChunkSource) -> &'static str {
    match source {
        ChunkSource::Cache => "cache",
        ChunkSource::Peer(_) => "p2p",
        ChunkSource::Origin => "cdn",
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use swarmcdn_core::{wire, Message, ResolverConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn start(config: ResolverConfig) -> EventSender {
        let (tx, rx) = channel();
        let origin = OriginClient::new(Duration::from_secs(5)).unwrap();
        let reactor = Reactor::new(Resolver::with_config(config), origin, tx.clone(), rx);
        tokio::spawn(reactor.run());
        tx
    }

    fn connect_peer(events: &EventSender) -> (PeerId, mpsc::UnboundedReceiver<Vec<u8>>) {
        let peer = PeerId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        events
            .send(Event::PeerConnected { peer, conn: 1, tx })
            .unwrap();
        (peer, rx)
    }

    fn resolve(events: &EventSender, resource: &str) -> oneshot::Receiver<Delivery> {
        let (reply, rx) = oneshot::channel();
        events
            .send(Event::Resolve {
                resource: resource.to_string(),
                reply,
            })
            .unwrap();
        rx
    }

    async fn serve_once(body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = s.read(&mut buf).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            s.write_all(head.as_bytes()).await.unwrap();
            s.write_all(body).await.unwrap();
            s.shutdown().await.unwrap();
        });
        format!("http://{}/seg-1.ts", addr)
    }

    #[tokio::test]
    async fn no_peers_served_from_origin() {
        let events = start(ResolverConfig::default());
        let url = serve_once(b"from-cdn").await;
        let got = resolve(&events, &url).await.unwrap();
        assert_eq!(got, Delivery::Chunk(b"from-cdn".to_vec()));

        let (reply, rx) = oneshot::channel();
        events.send(Event::Stats(reply)).unwrap();
        let stats = rx.await.unwrap();
        assert_eq!(stats.bytes_recv_cdn, 8);
        assert_eq!(stats.bytes_recv_p2p, 0);
    }

    #[tokio::test]
    async fn peer_offer_answers_request() {
        let events = start(ResolverConfig::default());
        let (peer, mut peer_rx) = connect_peer(&events);
        let waiter = resolve(&events, "seg-7.ts");

        let frame = peer_rx.recv().await.unwrap();
        let (msg, _) = wire::decode_frame(&frame).unwrap();
        assert_eq!(msg, Message::request("seg-7.ts"));

        let offer = wire::encode_frame(&Message::offer("seg-7.ts", vec![7; 32])).unwrap();
        events.send(Event::PeerFrame(peer, offer)).unwrap();
        assert_eq!(waiter.await.unwrap(), Delivery::Chunk(vec![7; 32]));
    }

    #[tokio::test]
    async fn origin_failure_reported_to_player() {
        let events = start(ResolverConfig::default());
        let got = resolve(&events, "not a url").await.unwrap();
        assert!(matches!(got, Delivery::Failed(_)));
    }

    #[tokio::test]
    async fn unanswered_peer_request_falls_back_after_timeout() {
        let events = start(ResolverConfig {
            p2p_timeout: Duration::from_millis(100),
            ..ResolverConfig::default()
        });
        let (_peer, mut peer_rx) = connect_peer(&events);
        let url = serve_once(b"late").await;
        let started = std::time::Instant::now();
        let got = resolve(&events, &url).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(got, Delivery::Chunk(b"late".to_vec()));
        assert!(peer_rx.try_recv().is_ok());
    }

    fn new_reactor(config: ResolverConfig) -> Reactor {
        let (tx, rx) = channel();
        let origin = OriginClient::new(Duration::from_secs(5)).unwrap();
        Reactor::new(Resolver::with_config(config), origin, tx, rx)
    }

    fn resolve_event(resource: &str) -> (Event, oneshot::Receiver<Delivery>) {
        let (reply, rx) = oneshot::channel();
        let ev = Event::Resolve {
            resource: resource.to_string(),
            reply,
        };
        (ev, rx)
    }

    #[tokio::test]
    async fn unsolicited_offer_for_abandoned_resource_not_delivered() {
        let mut r = new_reactor(ResolverConfig::default());
        let peer = PeerId::generate();
        let (tx, _peer_rx) = mpsc::unbounded_channel();
        r.handle(Event::PeerConnected { peer, conn: 1, tx });

        let (ev_a, mut waiter_a) = resolve_event("a.ts");
        r.handle(ev_a);
        let (ev_b, _waiter_b) = resolve_event("b.ts");
        r.handle(ev_b);

        let offer = wire::encode_frame(&Message::offer("a.ts", vec![9, 9, 9])).unwrap();
        r.handle(Event::PeerFrame(peer, offer));

        assert!(r.resolver.cache().contains("a.ts"));
        assert!(matches!(
            waiter_a.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn abandoned_player_requests_are_pruned() {
        let mut r = new_reactor(ResolverConfig::default());
        let (tx, _peer_rx) = mpsc::unbounded_channel();
        r.handle(Event::PeerConnected {
            peer: PeerId::generate(),
            conn: 1,
            tx,
        });
        for i in 0..1000 {
            let (ev, rx) = resolve_event(&format!("seg-{i}.ts"));
            drop(rx);
            r.handle(ev);
        }
        assert!(r.waiters.len() <= 1);

        let (tx, rx) = oneshot::channel();
        r.handle(Event::Stats(tx));
        drop(rx);
        assert!(r.waiters.is_empty());
    }

    #[tokio::test]
    async fn stale_disconnect_keeps_newer_connection() {
        let events = start(ResolverConfig::default());
        let peer = PeerId::generate();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        events
            .send(Event::PeerConnected { peer, conn: 1, tx: tx1 })
            .unwrap();
        events
            .send(Event::PeerConnected { peer, conn: 2, tx: tx2 })
            .unwrap();
        events
            .send(Event::PeerDisconnected { peer, conn: 1 })
            .unwrap();
        let _waiter = resolve(&events, "seg-1.ts");
        let frame = rx2.recv().await.unwrap();
        assert_eq!(
            wire::decode_frame(&frame).unwrap().0,
            Message::request("seg-1.ts")
        );
    }
}
