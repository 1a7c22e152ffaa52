//! Peer transport: TCP server (incoming), TCP client (outbound to configured peers), handshake + length-prefixed frames.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use swarmcdn_core::wire::{frame_len, LEN_SIZE};
use swarmcdn_core::{PeerId, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::reactor::{Event, EventSender};

const HANDSHAKE_SIZE: usize = 1 + 16; // version + peer_id
const REDIAL_INTERVAL: Duration = Duration::from_secs(5);

/// Run transport: accept incoming peers on `port` and keep a connection open to each of `peers`.
pub async fn run_transport(
    local_id: PeerId,
    port: u16,
    peers: Vec<SocketAddr>,
    events: EventSender,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, %local_id, "transport listening");
    let conn_ids = Arc::new(AtomicU64::new(0));

    for addr in peers {
        let events = events.clone();
        let conn_ids = conn_ids.clone();
        tokio::spawn(async move { dial_loop(local_id, addr, events, conn_ids).await });
    }

    loop {
        let (mut stream, from) = listener.accept().await?;
        let events = events.clone();
        let conn_ids = conn_ids.clone();
        tokio::spawn(async move {
            match handshake_accept(&mut stream, local_id).await {
                Ok(peer_id) => {
                    let conn = conn_ids.fetch_add(1, Ordering::Relaxed);
                    run_connection(stream, peer_id, conn, events).await;
                }
                Err(e) => tracing::debug!(%from, error = %e, "handshake failed"),
            }
        });
    }
}

/// Keep one outbound connection to `addr`, reconnecting after it drops.
async fn dial_loop(
    local_id: PeerId,
    addr: SocketAddr,
    events: EventSender,
    conn_ids: Arc<AtomicU64>,
) {
    while !events.is_closed() {
        match TcpStream::connect(addr).await {
            Ok(mut stream) => match handshake_connect(&mut stream, local_id).await {
                Ok(peer_id) => {
                    let conn = conn_ids.fetch_add(1, Ordering::Relaxed);
                    run_connection(stream, peer_id, conn, events.clone()).await;
                }
                Err(e) => tracing::debug!(%addr, error = %e, "handshake failed"),
            },
            Err(e) => tracing::debug!(%addr, error = %e, "connect failed"),
        }
        tokio::time::sleep(REDIAL_INTERVAL).await;
    }
}

async fn handshake_accept(stream: &mut TcpStream, local_id: PeerId) -> std::io::Result<PeerId> {
    let mut buf = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut buf).await?;
    let peer_id = parse_handshake(&buf, local_id)?;
    stream.write_all(&handshake_bytes(local_id)).await?;
    stream.flush().await?;
    Ok(peer_id)
}

async fn handshake_connect(stream: &mut TcpStream, local_id: PeerId) -> std::io::Result<PeerId> {
    stream.write_all(&handshake_bytes(local_id)).await?;
    stream.flush().await?;
    let mut buf = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut buf).await?;
    parse_handshake(&buf, local_id)
}

fn handshake_bytes(local_id: PeerId) -> [u8; HANDSHAKE_SIZE] {
    let mut out = [0u8; HANDSHAKE_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..17].copy_from_slice(local_id.as_bytes());
    out
}

fn parse_handshake(buf: &[u8; HANDSHAKE_SIZE], local_id: PeerId) -> std::io::Result<PeerId> {
    if buf[0] != PROTOCOL_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unsupported protocol version",
        ));
    }
    let mut id = [0u8; 16];
    id.copy_from_slice(&buf[1..17]);
    let peer_id = PeerId::from_bytes(id);
    if peer_id == local_id {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "connected to self",
        ));
    }
    Ok(peer_id)
}

/// Pump frames both ways until either side closes, then report the disconnect.
async fn run_connection(stream: TcpStream, peer_id: PeerId, conn: u64, events: EventSender) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    if events
        .send(Event::PeerConnected {
            peer: peer_id,
            conn,
            tx,
        })
        .is_err()
    {
        return;
    }
    let (mut reader, mut writer) = stream.into_split();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() || writer.flush().await.is_err() {
                break;
            }
        }
    });
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => {
                if events.send(Event::PeerFrame(peer_id, frame)).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(peer = %peer_id, error = %e, "connection closed");
                break;
            }
        }
    }
    writer_task.abort();
    let _ = events.send(Event::PeerDisconnected {
        peer: peer_id,
        conn,
    });
}

/// Read one whole frame (header included) so it can be handed to the resolver as-is.
async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; LEN_SIZE];
    reader.read_exact(&mut header).await?;
    let len = frame_len(&header)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut frame = vec![0u8; LEN_SIZE + len];
    frame[..LEN_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut frame[LEN_SIZE..]).await?;
    Ok(frame)
}
