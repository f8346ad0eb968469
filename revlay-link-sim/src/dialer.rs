use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

// ---

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ---

use revlay_domain::{DataConnPtr, ReverseDialer, Result, RevlayError};

// ---

use super::LinkSimConfig;

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

/// State shared by the dialer, the peer and every [`SimLink`] handle of
/// one simulated control channel.
pub(crate) struct Shared {
    // ---
    pub(crate) config: LinkSimConfig,

    /// Cancelled when the simulated control channel dies.
    pub(crate) done: CancellationToken,

    pub(crate) refuse_dials: AtomicBool,
    pub(crate) dials: AtomicU64,
}

// ---------------------------------------------------------------------------
// SimDialer
// ---------------------------------------------------------------------------

/// Server-side end of a simulated control channel.
///
/// Each successful [`ReverseDialer::dial`] creates a `tokio::io::duplex`
/// pair, keeps one end and delivers the other to the paired
/// [`super::SimPeer`].
pub struct SimDialer {
    // ---
    pub(crate) shared: Arc<Shared>,
    pub(crate) conn_tx: mpsc::UnboundedSender<DuplexStream>,
}

// ---

#[async_trait]
impl ReverseDialer for SimDialer {
    // ---
    async fn dial(&self) -> Result<DataConnPtr> {
        // ---
        if self.shared.done.is_cancelled() {
            return Err(RevlayError::Transport("sim control channel closed".into()));
        }

        if !self.shared.config.dial_latency.is_zero() {
            tokio::select! {
                _ = self.shared.done.cancelled() => {
                    return Err(RevlayError::Transport("sim control channel closed".into()));
                }
                _ = tokio::time::sleep(self.shared.config.dial_latency) => {}
            }
        }

        if self.shared.refuse_dials.load(Ordering::Relaxed) {
            return Err(RevlayError::Transport("sim dial refused".into()));
        }

        let (near, far) = tokio::io::duplex(self.shared.config.pipe_capacity);
        self.conn_tx
            .send(far)
            .map_err(|_| RevlayError::Transport("sim peer gone".into()))?;

        self.shared.dials.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(near))
    }

    // ---

    async fn closed(&self) {
        self.shared.done.cancelled().await
    }

    // ---

    fn is_closed(&self) -> bool {
        self.shared.done.is_cancelled()
    }

    // ---

    fn close(&self) {
        self.shared.done.cancel();
    }
}

// ---------------------------------------------------------------------------
// SimLink
// ---------------------------------------------------------------------------

/// Test-side remote control for one simulated control channel.
#[derive(Clone)]
pub struct SimLink {
    // ---
    pub(crate) shared: Arc<Shared>,
}

// ---

impl SimLink {
    // ---
    /// Kill the control channel, as a load-balancer idle timeout would.
    pub fn kill(&self) {
        tracing::debug!("sim: control channel killed");
        self.shared.done.cancel();
    }

    // ---

    pub fn is_dead(&self) -> bool {
        self.shared.done.is_cancelled()
    }

    // ---

    /// Refuse (or stop refusing) every subsequent dial.
    pub fn refuse_dials(&self, refuse: bool) {
        self.shared.refuse_dials.store(refuse, Ordering::Relaxed);
    }

    // ---

    /// Number of data connections produced so far.
    pub fn dials(&self) -> u64 {
        self.shared.dials.load(Ordering::Relaxed)
    }
}
