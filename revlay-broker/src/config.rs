//! CLI configuration for `revlay`.
//!
//! Run modes:
//!   revlay server --bind 0.0.0.0:7600 --forward 127.0.0.1:8080=desktop-42:/ws/stream
//!   revlay peer --server 10.0.0.5:7600 --peer-id desktop-42 --target 127.0.0.1:9876

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};

use revlay_broker::{ForwardSpec, ManagerConfig, ProxyConfig};
use revlay_revdial::RevDialConfig;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "revlay", about = "Reverse-dial connection broker")]
pub struct Config {
    // ---
    #[command(subcommand)]
    pub mode: Mode,

    /// Seconds a disconnected peer keeps its slot and queues dials.
    #[arg(long, global = true, default_value_t = 30)]
    pub grace_period_secs: u64,

    /// Queued dials allowed per disconnected peer.
    #[arg(long, global = true, default_value_t = 100)]
    pub max_pending_dials: usize,

    /// Client bytes a proxy session may hold while reconnecting.
    #[arg(long, global = true, default_value_t = 512 * 1024)]
    pub buffer_size: usize,

    /// Dial + upgrade attempts per proxy reconnection.
    #[arg(long, global = true, default_value_t = 3)]
    pub reconnect_attempts: u32,

    /// Overall budget in seconds for one proxy reconnection.
    #[arg(long, global = true, default_value_t = 30)]
    pub reconnect_timeout_secs: u64,

    /// Seconds to wait for a peer to attach a requested data connection.
    #[arg(long, global = true, default_value_t = 10)]
    pub dial_timeout_secs: u64,

    /// Control-channel ping interval; three missed pings kill the channel.
    #[arg(long, global = true, default_value_t = 15)]
    pub keepalive_secs: u64,
}

// ---

#[derive(Debug, Subcommand)]
pub enum Mode {
    // ---
    /// Accept peer control channels and forward local clients to peers.
    Server {
        // ---
        /// TCP address for peer control and data connections.
        #[arg(long, default_value = "0.0.0.0:7600")]
        bind: SocketAddr,

        /// `LOCAL=PEER[:PATH]`; repeatable.  With PATH every server-side
        /// connection is HTTP-upgraded on that path first.
        #[arg(long = "forward")]
        forwards: Vec<ForwardSpec>,

        /// Serve Prometheus text metrics on this address.
        #[arg(long)]
        metrics_bind: Option<SocketAddr>,
    },

    /// Register with a server and pipe its data connections to a target.
    Peer {
        // ---
        /// The server's `--bind` address.
        #[arg(long)]
        server: SocketAddr,

        /// Identity to register under, e.g. desktop-42.
        #[arg(long)]
        peer_id: String,

        /// Local service every data connection is piped to.
        #[arg(long)]
        target: SocketAddr,
    },
}

// ---

impl Config {
    // ---
    pub fn manager_config(&self) -> ManagerConfig {
        // ---
        ManagerConfig {
            grace_period: Duration::from_secs(self.grace_period_secs),
            max_pending_dials: self.max_pending_dials,
        }
    }

    // ---

    pub fn proxy_config(&self) -> ProxyConfig {
        // ---
        ProxyConfig {
            buffer_size: self.buffer_size,
            max_attempts: self.reconnect_attempts,
            reconnect_timeout: Duration::from_secs(self.reconnect_timeout_secs),
            ..Default::default()
        }
    }

    // ---

    pub fn revdial_config(&self) -> RevDialConfig {
        // ---
        RevDialConfig {
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            ..Default::default()
        }
        .with_keepalive(Duration::from_secs(self.keepalive_secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
