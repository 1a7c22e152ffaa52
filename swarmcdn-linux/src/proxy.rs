//! Local HTTP endpoint for the player: resolve chunk URLs through the reactor and return the bytes.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use swarmcdn_core::TrafficStats;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use crate::reactor::{Delivery, Event, EventSender};

const MAX_REQUEST_HEAD: usize = 64 * 1024;

/// What the player asked for.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    Chunk(String),
    Stats,
    BadRequest,
    NotFound,
    MethodNotAllowed,
}

/// `/stats` body: the raw counters plus the derived share of bytes that came from peers.
#[derive(Serialize)]
struct StatsBody<'a> {
    #[serde(flatten)]
    traffic: &'a TrafficStats,
    p2p_ratio: f64,
}

/// Run the endpoint: accept connections and answer each from the reactor.
/// `wait` bounds how long a request waits for its chunk before answering 504.
pub async fn run_proxy(bind: SocketAddr, events: EventSender, wait: Duration) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    tracing::info!(%bind, "player endpoint listening");
    loop {
        let (stream, _) = listener.accept().await?;
        let events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, events, wait).await {
                tracing::debug!(error = %e, "player connection error");
            }
        });
    }
}

async fn handle_client(
    mut client: TcpStream,
    events: EventSender,
    wait: Duration,
) -> std::io::Result<()> {
    let head = match read_head(&mut client).await? {
        Some(h) => h,
        None => return Ok(()),
    };
    match route(&head) {
        Route::Chunk(resource) => {
            let (reply, rx) = oneshot::channel();
            if events.send(Event::Resolve { resource, reply }).is_err() {
                return write_response(&mut client, "503 Service Unavailable", "text/plain", b"")
                    .await;
            }
            match tokio::time::timeout(wait, rx).await {
                Ok(Ok(Delivery::Chunk(chunk))) => {
                    write_response(&mut client, "200 OK", "application/octet-stream", &chunk).await
                }
                Ok(Ok(Delivery::Failed(reason))) => {
                    write_response(&mut client, "502 Bad Gateway", "text/plain", reason.as_bytes())
                        .await
                }
                Ok(Err(_)) => {
                    write_response(&mut client, "503 Service Unavailable", "text/plain", b"").await
                }
                Err(_) => {
                    write_response(&mut client, "504 Gateway Timeout", "text/plain", b"").await
                }
            }
        }
        Route::Stats => {
            let (reply, rx) = oneshot::channel();
            let _ = events.send(Event::Stats(reply));
            match rx.await {
                Ok(stats) => {
                    let body = serde_json::to_vec(&StatsBody {
                        traffic: &stats,
                        p2p_ratio: stats.p2p_ratio(),
                    })
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                    write_response(&mut client, "200 OK", "application/json", &body).await
                }
                Err(_) => {
                    write_response(&mut client, "503 Service Unavailable", "text/plain", b"").await
                }
            }
        }
        Route::BadRequest => {
            write_response(&mut client, "400 Bad Request", "text/plain", b"").await
        }
        Route::NotFound => write_response(&mut client, "404 Not Found", "text/plain", b"").await,
        Route::MethodNotAllowed => {
            write_response(&mut client, "405 Method Not Allowed", "text/plain", b"").await
        }
    }
}

/// Read until the request head is complete. Returns None if the client closed first.
async fn read_head(client: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf) {
            Ok(status) if status.is_complete() => return Ok(Some(buf)),
            Ok(_) if buf.len() < MAX_REQUEST_HEAD => continue,
            _ => return Ok(Some(buf)),
        }
    }
}

/// Map a request head to a route. Chunks are addressed either as `/chunk?url=<encoded url>`
/// or by sending the absolute URL as the request target, proxy style.
fn route(buf: &[u8]) -> Route {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(status) if status.is_complete() => {}
        _ => return Route::BadRequest,
    }
    let (Some(method), Some(path)) = (req.method, req.path) else {
        return Route::BadRequest;
    };
    if !method.eq_ignore_ascii_case("GET") {
        return Route::MethodNotAllowed;
    }
    let lower = path.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Route::Chunk(path.to_string());
    }
    let Ok(url) = reqwest::Url::parse(&format!("http://localhost{}", path)) else {
        return Route::BadRequest;
    };
    match url.path() {
        "/stats" => Route::Stats,
        "/chunk" => url
            .query_pairs()
            .find(|(k, _)| k == "url")
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty())
            .map(Route::Chunk)
            .unwrap_or(Route::BadRequest),
        _ => Route::NotFound,
    }
}

async fn write_response(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        content_type,
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(target: &str) -> Vec<u8> {
        format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", target).into_bytes()
    }

    #[test]
    fn route_chunk_query() {
        assert_eq!(
            route(&get("/chunk?url=http%3A%2F%2Fcdn.example.com%2Fseg-1.ts")),
            Route::Chunk("http://cdn.example.com/seg-1.ts".to_string())
        );
    }

    #[test]
    fn route_absolute_form() {
        assert_eq!(
            route(&get("http://cdn.example.com/live/seg-2.ts")),
            Route::Chunk("http://cdn.example.com/live/seg-2.ts".to_string())
        );
    }

    #[test]
    fn route_misc() {
        assert_eq!(route(&get("/stats")), Route::Stats);
        assert_eq!(route(&get("/chunk")), Route::BadRequest);
        assert_eq!(route(&get("/chunk?url=")), Route::BadRequest);
        assert_eq!(route(&get("/elsewhere")), Route::NotFound);
        assert_eq!(
            route(b"POST /chunk?url=x HTTP/1.1\r\nHost: a\r\n\r\n"),
            Route::MethodNotAllowed
        );
        assert_eq!(route(b"GET /chunk"), Route::BadRequest);
    }

    async fn http_get(addr: SocketAddr, target: &str) -> String {
        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_all(&get(target)).await.unwrap();
        let mut out = Vec::new();
        s.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Stand-in reactor: serves `chunk` for every resolve and default stats.
    fn fake_reactor(chunk: Vec<u8>) -> EventSender {
        let (tx, mut rx) = crate::reactor::channel();
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                match ev {
                    Event::Resolve { resource, reply } if resource.ends_with("missing.ts") => {
                        let _ = reply.send(Delivery::Failed("origin returned status 404".into()));
                    }
                    Event::Resolve { reply, .. } => {
                        let _ = reply.send(Delivery::Chunk(chunk.clone()));
                    }
                    Event::Stats(reply) => {
                        let _ = reply.send(Default::default());
                    }
                    _ => {}
                }
            }
        });
        tx
    }

    async fn start(events: EventSender) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        tokio::spawn(run_proxy(addr, events, Duration::from_secs(5)));
        // Give the endpoint a moment to bind.
        for _ in 0..50 {
            if TcpStream::connect(addr).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        addr
    }

    #[tokio::test]
    async fn serves_chunk_bytes() {
        let addr = start(fake_reactor(b"chunk-bytes".to_vec())).await;
        let resp = http_get(addr, "/chunk?url=http%3A%2F%2Fcdn%2Fa.ts").await;
        assert!(resp.starts_with("HTTP/1.1 200 OK"));
        assert!(resp.ends_with("chunk-bytes"));
    }

    #[tokio::test]
    async fn origin_failure_is_bad_gateway() {
        let addr = start(fake_reactor(Vec::new())).await;
        let resp = http_get(addr, "http://cdn/missing.ts").await;
        assert!(resp.starts_with("HTTP/1.1 502"));
    }

    #[tokio::test]
    async fn stats_as_json() {
        let addr = start(fake_reactor(Vec::new())).await;
        let resp = http_get(addr, "/stats").await;
        assert!(resp.starts_with("HTTP/1.1 200 OK"));
        assert!(resp.contains("\"bytes_recv_p2p\":0"));
        assert!(resp.contains("\"p2p_ratio\":0.0"));
    }
}
