// swarmcdn Linux daemon: player endpoint, peer transport, origin fetch around one resolver.

mod config;
mod origin;
mod proxy;
mod reactor;
mod transport;

use std::time::Duration;

use tracing_subscriber::{fmt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("swarmcdn-linux {}", VERSION);
            return Ok(());
        }
    }

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let cfg = config::load();
    let local_id = swarmcdn_core::PeerId::generate();
    tracing::info!(%local_id, ?cfg, "starting swarmcdn-linux {}", VERSION);

    let bind: std::net::SocketAddr = format!("127.0.0.1:{}", cfg.proxy_port).parse()?;
    // Long enough for a full P2P timeout followed by a full origin fetch.
    let player_wait = cfg.p2p_timeout() + cfg.origin_timeout() + Duration::from_secs(1);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let origin = origin::OriginClient::new(cfg.origin_timeout())?;
        let (events_tx, events_rx) = reactor::channel();
        let resolver = swarmcdn_core::Resolver::with_config(cfg.resolver_config());
        tokio::spawn(reactor::Reactor::new(resolver, origin, events_tx.clone(), events_rx).run());

        let proxy_events = events_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = proxy::run_proxy(bind, proxy_events, player_wait).await {
                tracing::error!(error = %e, "player endpoint stopped");
            }
        });
        let transport_port = cfg.transport_port;
        let peers = cfg.peers.clone();
        tokio::spawn(async move {
            if let Err(e) =
                transport::run_transport(local_id, transport_port, peers, events_tx).await
            {
                tracing::error!(error = %e, "transport stopped");
            }
        });
        shutdown_signal().await?;
        tracing::info!("shutting down");
        anyhow::Ok(())
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix). On shutdown, runtime and tasks exit.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
