//! In-process mock reverse-dial transport for revlay unit and integration
//! testing.
//!
//! [`pair`] returns a [`SimDialer`] (implements
//! [`revlay_domain::ReverseDialer`]), the matching [`SimPeer`], and a
//! [`SimLink`] remote control.  Data connections are `tokio::io::duplex`
//! pipes, so no sockets are involved.  [`LinkSimConfig`] controls injected
//! impairments:
//!
//! - Dial latency (the ConnReady → Attach round trip)
//! - Refused dials
//! - Control-channel death via [`SimLink::kill`]
//!
//! # Quick start
//!
//! ```rust
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use revlay_domain::ReverseDialer;
//! use revlay_link_sim::{pair, LinkSimConfig};
//!
//! let (dialer, peer, link) = pair(LinkSimConfig::perfect());
//! peer.spawn_echo();
//! let conn = dialer.dial().await.unwrap();
//! link.kill();
//! assert!(dialer.is_closed());
//! # drop(conn);
//! # }
//! ```

mod config;
mod dialer;
mod peer;

// --- public API
pub use config::LinkSimConfig;
pub use dialer::{SimDialer, SimLink};
pub use peer::{SimPeer, SinkLog};

use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// pair
// ---------------------------------------------------------------------------

/// Create one simulated control channel: server-side dialer, peer side,
/// and a test remote control.
pub fn pair(config: LinkSimConfig) -> (SimDialer, SimPeer, SimLink) {
    // ---
    let shared = Arc::new(dialer::Shared {
        refuse_dials: AtomicBool::new(config.refuse_dials),
        config,
        done: CancellationToken::new(),
        dials: AtomicU64::new(0),
    });

    let (conn_tx, conn_rx) = mpsc::unbounded_channel();

    let dialer = SimDialer {
        shared: Arc::clone(&shared),
        conn_tx,
    };
    let peer = SimPeer {
        shared: Arc::clone(&shared),
        conn_rx,
    };
    let link = SimLink { shared };

    (dialer, peer, link)
}

#[cfg(test)]
mod tests;
