//! Prometheus-compatible counters shared by the connection manager and
//! every resilient proxy session.
//!
//! Lock-free atomics; [`Metrics::render`] produces the text exposition
//! format served on `--metrics-bind`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

// ---

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ---

pub type MetricsPtr = Arc<Metrics>;

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

pub struct Metrics {
    // ---
    /// Peers currently inside their grace period (gauge).
    pub peers_in_grace: AtomicU64,

    /// Dial calls currently parked on a PendingDial (gauge).
    pub pending_dials: AtomicU64,

    /// Dials served straight from a live dialer (counter).
    pub dials_instant_total: AtomicU64,

    /// Dials that had to queue for a reconnect (counter).
    pub dials_waited_total: AtomicU64,

    /// Peers that re-registered while in grace (counter).
    pub peer_reconnects_total: AtomicU64,

    /// Grace periods that ran out without a re-registration (counter).
    pub grace_expirations_total: AtomicU64,

    /// Proxy reconnects that succeeded (counter).
    pub proxy_reconnects_total: AtomicU64,

    /// Proxy sessions that gave up reconnecting (counter).
    pub proxy_reconnect_failures_total: AtomicU64,

    /// Proxy sessions currently running (gauge).
    pub proxy_sessions_active: AtomicU64,

    pub start_time: Instant,
}

// ---

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

// ---

impl Metrics {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            peers_in_grace: AtomicU64::new(0),
            pending_dials: AtomicU64::new(0),
            dials_instant_total: AtomicU64::new(0),
            dials_waited_total: AtomicU64::new(0),
            peer_reconnects_total: AtomicU64::new(0),
            grace_expirations_total: AtomicU64::new(0),
            proxy_reconnects_total: AtomicU64::new(0),
            proxy_reconnect_failures_total: AtomicU64::new(0),
            proxy_sessions_active: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    // ---

    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    // ---

    /// Saturating decrement for gauges.
    pub(crate) fn dec(gauge: &AtomicU64) {
        let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    // ---

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        // ---
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let uptime = self.start_time.elapsed().as_secs();

        format!(
            "# HELP revlay_peers_in_grace Peers currently inside their reconnect grace period\n\
             # TYPE revlay_peers_in_grace gauge\n\
             revlay_peers_in_grace {}\n\
             # HELP revlay_pending_dials Dial calls queued waiting for a peer to reconnect\n\
             # TYPE revlay_pending_dials gauge\n\
             revlay_pending_dials {}\n\
             # HELP revlay_dials_instant_total Dials served by a live dialer without waiting\n\
             # TYPE revlay_dials_instant_total counter\n\
             revlay_dials_instant_total {}\n\
             # HELP revlay_dials_waited_total Dials that queued for a peer reconnect\n\
             # TYPE revlay_dials_waited_total counter\n\
             revlay_dials_waited_total {}\n\
             # HELP revlay_peer_reconnects_total Peers that re-registered within the grace period\n\
             # TYPE revlay_peer_reconnects_total counter\n\
             revlay_peer_reconnects_total {}\n\
             # HELP revlay_grace_expirations_total Grace periods that expired without a reconnect\n\
             # TYPE revlay_grace_expirations_total counter\n\
             revlay_grace_expirations_total {}\n\
             # HELP revlay_proxy_reconnects_total Successful resilient proxy reconnects\n\
             # TYPE revlay_proxy_reconnects_total counter\n\
             revlay_proxy_reconnects_total {}\n\
             # HELP revlay_proxy_reconnect_failures_total Proxy sessions closed after reconnect failure\n\
             # TYPE revlay_proxy_reconnect_failures_total counter\n\
             revlay_proxy_reconnect_failures_total {}\n\
             # HELP revlay_proxy_sessions_active Resilient proxy sessions currently running\n\
             # TYPE revlay_proxy_sessions_active gauge\n\
             revlay_proxy_sessions_active {}\n\
             # HELP revlay_uptime_seconds Process uptime in seconds\n\
             # TYPE revlay_uptime_seconds gauge\n\
             revlay_uptime_seconds {}\n",
            load(&self.peers_in_grace),
            load(&self.pending_dials),
            load(&self.dials_instant_total),
            load(&self.dials_waited_total),
            load(&self.peer_reconnects_total),
            load(&self.grace_expirations_total),
            load(&self.proxy_reconnects_total),
            load(&self.proxy_reconnect_failures_total),
            load(&self.proxy_sessions_active),
            uptime,
        )
    }
}

// ---------------------------------------------------------------------------
// serve_metrics
// ---------------------------------------------------------------------------

/// Routes exposing `metrics`: `GET /metrics` answers with
/// [`Metrics::render`], anything else is a 404.
pub fn metrics_router(metrics: MetricsPtr) -> Router {
    // ---
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

// ---

async fn metrics_handler(State(metrics): State<MetricsPtr>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], metrics.render())
}

// ---

/// Serve [`metrics_router`] on `listener` until `cancel` fires.
pub async fn serve_metrics(listener: TcpListener, metrics: MetricsPtr, cancel: CancellationToken) {
    // ---
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "metrics endpoint ready");
    }

    let served = axum::serve(listener, metrics_router(metrics))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await;

    match served {
        Ok(()) => info!("metrics endpoint stopped"),
        Err(e) => warn!("metrics endpoint failed: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
