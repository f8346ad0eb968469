//! revlay daemon.
//!
//! Server mode accepts reverse-dial control channels from peers behind NAT
//! and forwards local clients to them through resilient proxy sessions.
//! Peer mode keeps a control channel open and pipes each data connection
//! to a local target.
//!
//! Usage:
//!   revlay server --bind 0.0.0.0:7600 --forward 127.0.0.1:8080=desktop-42
//!   revlay peer --server 10.0.0.5:7600 --peer-id desktop-42 --target 127.0.0.1:9876

use std::net::SocketAddr;
use std::sync::Arc;

// ---

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ---

use revlay_broker::{
    // ---
    serve_metrics,
    ConnectionManager,
    ForwardSpec,
    Forwarder,
    ManagerConfig,
    PeerAgent,
    ProxyConfig,
};
use revlay_domain::PeerId;
use revlay_revdial::{RevDialConfig, RevDialServer};

// ---

mod config;

use config::{Config, Mode};

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    let cfg = Config::parse();

    let no_color = std::env::var("EMACS").is_ok()
        || std::env::var("NO_COLOR").is_ok()
        || std::env::var("CARGO_TERM_COLOR").as_deref() == Ok("never")
        || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_ansi(!no_color)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "revlay starting");

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    let manager_cfg = cfg.manager_config();
    let proxy_cfg = cfg.proxy_config();
    let revdial_cfg = cfg.revdial_config();

    match cfg.mode {
        Mode::Server {
            bind,
            forwards,
            metrics_bind,
        } => {
            run_server(
                bind,
                forwards,
                metrics_bind,
                manager_cfg,
                proxy_cfg,
                revdial_cfg,
                cancel,
            )
            .await
        }

        Mode::Peer {
            server,
            peer_id,
            target,
        } => {
            info!(%server, %peer_id, %target, "peer mode");
            PeerAgent::new(server, PeerId::from(peer_id), target, revdial_cfg)
                .run(cancel)
                .await;
            Ok(())
        }
    }
}

// ---

fn spawn_ctrl_c(cancel: CancellationToken) {
    // ---
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("ctrl-c received, shutting down");
                cancel.cancel();
            }
            Err(e) => warn!("cannot listen for ctrl-c: {e}"),
        }
    });
}

// ---------------------------------------------------------------------------
// run_server
// ---------------------------------------------------------------------------

async fn run_server(
    bind: SocketAddr,
    forwards: Vec<ForwardSpec>,
    metrics_bind: Option<SocketAddr>,
    manager_cfg: ManagerConfig,
    proxy_cfg: ProxyConfig,
    revdial_cfg: RevDialConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    // ---
    let manager = ConnectionManager::new(manager_cfg);

    let server = RevDialServer::bind(bind, revdial_cfg).await?;
    info!(addr = %server.local_addr()?, "reverse-dial listener ready");
    let mut registrations = server.listen();

    for spec in forwards {
        let forwarder = Forwarder::bind(spec, manager.clone(), proxy_cfg.clone()).await?;
        tokio::spawn(forwarder.run(cancel.clone()));
    }

    if let Some(addr) = metrics_bind {
        let listener = TcpListener::bind(addr).await?;
        tokio::spawn(serve_metrics(listener, manager.metrics(), cancel.clone()));
    }

    loop {
        let registration = tokio::select! {
            _ = cancel.cancelled() => break,
            reg = registrations.recv() => match reg {
                Some(reg) => reg,
                None => {
                    warn!("reverse-dial listener stopped");
                    break;
                }
            },
        };

        let peer_id = registration.peer_id.clone();
        if let Err(e) = manager.set(registration.peer_id, Arc::new(registration.dialer)) {
            warn!(%peer_id, "registration rejected: {e}");
        }
    }

    manager.shutdown();
    info!("revlay stopped");
    Ok(())
}
