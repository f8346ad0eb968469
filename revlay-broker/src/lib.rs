//! Server-side reverse-dial broker.
//!
//! - [`ConnectionManager`]: one dialer slot per peer, grace period across
//!   control-channel outages, queued dials resolved on reconnect.
//! - [`ResilientProxy`]: a long-lived client stream that rides out its
//!   server-side connection being replaced, spooling client bytes
//!   meanwhile.
//! - [`Forwarder`] and [`PeerAgent`]: the two halves of the `revlay` daemon.
//! - [`Metrics`]: shared counters with Prometheus text rendering.
//!
//! # Wiring
//!
//! ```ignore
//! let manager = ConnectionManager::new(ManagerConfig::default());
//! let mut registrations = RevDialServer::bind(addr, RevDialConfig::default()).await?.listen();
//! while let Some(reg) = registrations.recv().await {
//!     manager.set(reg.peer_id, Arc::new(reg.dialer))?;
//! }
//!
//! // elsewhere
//! let conn = manager.dial(&"desktop-42".into()).await?;
//! let redial = PeerRedial::new(manager.clone(), "desktop-42".into());
//! ResilientProxy::new(client, redial, ProxyConfig::default())
//!     .with_server(conn)
//!     .run(cancel)
//!     .await?;
//! ```

mod connman;
mod forward;
mod metrics;
mod peer_agent;
mod proxy;
mod spool;
mod upgrade;

// --- public API
pub use connman::{ConnectionManager, ManagerConfig, ManagerStats};
pub use forward::{ForwardSpec, Forwarder};
pub use metrics::{metrics_router, serve_metrics, Metrics, MetricsPtr};
pub use peer_agent::PeerAgent;
pub use proxy::{
    // ---
    PeerRedial,
    ProxyConfig,
    ProxyExit,
    ProxyStats,
    ProxyStatsHandle,
    ResilientProxy,
};
pub use upgrade::HttpUpgrade;
