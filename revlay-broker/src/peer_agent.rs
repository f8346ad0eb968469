//! Peer-side daemon loop: keep one control channel to the server open and
//! pipe every reverse-dialed data connection to a local target.

use std::net::SocketAddr;
use std::time::Duration;

// ---

use rand::Rng;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ---

use revlay_domain::PeerId;
use revlay_revdial::{open_control_channel, ControlHandle, RevDialConfig};

// ---

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// PeerAgent
// ---------------------------------------------------------------------------

pub struct PeerAgent {
    // ---
    server: SocketAddr,
    peer_id: PeerId,
    target: SocketAddr,
    cfg: RevDialConfig,
}

// ---

impl PeerAgent {
    // ---
    pub fn new(server: SocketAddr, peer_id: PeerId, target: SocketAddr, cfg: RevDialConfig) -> Self {
        // ---
        Self {
            server,
            peer_id,
            target,
            cfg,
        }
    }

    // ---

    /// Register with the server and serve data connections, reconnecting
    /// with exponential back-off (1s → 30s, ±20% jitter) until `cancel`.
    pub async fn run(self, cancel: CancellationToken) {
        // ---
        let peer_id = &self.peer_id;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                opened = open_control_channel(self.server, peer_id.clone(), self.cfg.clone()) => opened,
            };

            match opened {
                Ok(ctl) => {
                    backoff = INITIAL_BACKOFF;
                    self.serve(ctl, &cancel).await;
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!(%peer_id, server = %self.server, "control channel lost, reconnecting");
                }
                Err(e) => {
                    let delay = jittered(backoff);
                    warn!(
                        %peer_id,
                        server = %self.server,
                        retry_ms = delay.as_millis() as u64,
                        "control channel failed: {e}",
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        info!(%peer_id, "peer agent exiting");
    }

    // ---

    async fn serve(&self, mut ctl: ControlHandle, cancel: &CancellationToken) {
        // ---
        loop {
            let conn = tokio::select! {
                _ = cancel.cancelled() => {
                    ctl.close();
                    return;
                }
                conn = ctl.accept() => conn,
            };

            match conn {
                Ok(stream) => {
                    tokio::spawn(pipe(stream, self.target));
                }
                Err(e) => {
                    debug!(peer_id = %self.peer_id, "accept ended: {e}");
                    return;
                }
            }
        }
    }
}

// ---

fn jittered(base: Duration) -> Duration {
    base.mul_f64(rand::thread_rng().gen_range(0.8..1.2))
}

// ---

/// Connect to `target` and copy both ways until either side closes.
async fn pipe(mut inbound: TcpStream, target: SocketAddr) {
    // ---
    let mut outbound = match TcpStream::connect(target).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%target, "target connect failed: {e}");
            return;
        }
    };
    let _ = outbound.set_nodelay(true);

    match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
        Ok((up, down)) => debug!(%target, up, down, "data connection finished"),
        Err(e) => debug!(%target, "data connection ended: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn jitter_stays_within_twenty_percent() {
        // ---
        for _ in 0..100 {
            let d = jittered(Duration::from_secs(10));
            assert!(d >= Duration::from_secs(8) && d <= Duration::from_secs(12));
        }
    }

    #[tokio::test]
    async fn cancel_stops_retry_loop() {
        // ---
        // Nothing listens on this port once the listener is dropped.
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let agent = PeerAgent::new(addr, PeerId::from("p"), addr, RevDialConfig::default());
        let cancel = CancellationToken::new();
        let run = tokio::spawn(agent.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .unwrap()
            .unwrap();
    }
}
