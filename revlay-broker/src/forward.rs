//! Server-mode forwarding: every client accepted on a local listener
//! becomes one [`ResilientProxy`] session to a fixed peer.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

// ---

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ---

use revlay_domain::{PeerId, Result};

// ---

use super::connman::ConnectionManager;
use super::proxy::{PeerRedial, ProxyConfig, ResilientProxy};
use super::upgrade::HttpUpgrade;

// ---------------------------------------------------------------------------
// ForwardSpec
// ---------------------------------------------------------------------------

/// `LOCAL=PEER[:PATH]`, e.g. `127.0.0.1:8080=desktop-42:/ws/stream`.
///
/// With a path, every server-side connection is upgraded via
/// [`HttpUpgrade`] before traffic flows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    // ---
    pub local: SocketAddr,
    pub peer: PeerId,
    pub path: Option<String>,
}

// ---

impl FromStr for ForwardSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // ---
        let (local, target) = s
            .split_once('=')
            .ok_or_else(|| format!("expected LOCAL=PEER[:PATH], got {s:?}"))?;

        let local: SocketAddr = local
            .parse()
            .map_err(|e| format!("bad local address {local:?}: {e}"))?;

        let (peer, path) = match target.split_once(':') {
            Some((peer, path)) => {
                if !path.starts_with('/') {
                    return Err(format!("upgrade path must start with '/', got {path:?}"));
                }
                (peer, Some(path.to_string()))
            }
            None => (target, None),
        };

        if peer.is_empty() {
            return Err(format!("missing peer id in {s:?}"));
        }

        Ok(Self {
            local,
            peer: PeerId::from(peer),
            path,
        })
    }
}

// ---

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        write!(f, "{}={}", self.local, self.peer)?;
        if let Some(path) = &self.path {
            write!(f, ":{path}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Forwarder
// ---------------------------------------------------------------------------

pub struct Forwarder {
    // ---
    listener: TcpListener,
    spec: ForwardSpec,
    manager: ConnectionManager,
    cfg: ProxyConfig,
}

// ---

impl Forwarder {
    // ---
    pub async fn bind(spec: ForwardSpec, manager: ConnectionManager, cfg: ProxyConfig) -> Result<Self> {
        // ---
        let listener = TcpListener::bind(spec.local).await?;
        info!(forward = %spec, "forward listener ready");
        Ok(Self {
            listener,
            spec,
            manager,
            cfg,
        })
    }

    // ---

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    // ---

    /// Accept clients until `cancel` fires.  Running sessions are cancelled
    /// along with it.
    pub async fn run(self, cancel: CancellationToken) {
        // ---
        loop {
            let (stream, remote) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(forward = %self.spec, "accept failed: {e}");
                        continue;
                    }
                },
            };
            self.spawn_session(stream, remote, cancel.child_token());
        }

        info!(forward = %self.spec, "forward listener exiting");
    }

    // ---

    fn spawn_session(&self, stream: TcpStream, remote: SocketAddr, cancel: CancellationToken) {
        // ---
        let _ = stream.set_nodelay(true);

        let redial = PeerRedial::new(self.manager.clone(), self.spec.peer.clone());
        let mut proxy = ResilientProxy::new(Box::new(stream), redial, self.cfg.clone())
            .with_metrics(self.manager.metrics());
        if let Some(path) = &self.spec.path {
            proxy = proxy.with_upgrade(HttpUpgrade::new(path.clone()));
        }

        let session_id = proxy.session_id();
        let peer = self.spec.peer.clone();
        info!(%session_id, %peer, %remote, "client accepted");

        tokio::spawn(async move {
            match proxy.run(cancel).await {
                Ok(exit) => info!(%session_id, %peer, ?exit, "forwarded session ended"),
                Err(e) => warn!(%session_id, %peer, error = %e, "forwarded session failed"),
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
