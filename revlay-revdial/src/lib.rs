//! Reverse-dial transport for revlay over TCP.
//!
//! Lets a peer behind NAT receive server-initiated connections without ever
//! listening: the peer keeps one outbound *control* connection open, and the
//! server asks over it for each new *data* connection, which the peer then
//! opens outbound as well.
//!
//! # Quick start
//!
//! ```ignore
//! // --- server side ---
//! use revlay_revdial::{RevDialConfig, RevDialServer};
//!
//! let server  = RevDialServer::bind("0.0.0.0:7600".parse()?, RevDialConfig::default()).await?;
//! let mut reg_rx = server.listen();
//! while let Some(reg) = reg_rx.recv().await {
//!     manager.set(reg.peer_id, Arc::new(reg.dialer));
//! }
//!
//! // --- peer side ---
//! use revlay_revdial::open_control_channel;
//!
//! let mut ctl = open_control_channel(server_addr, "desktop-42".into(), cfg).await?;
//! while let Ok(conn) = ctl.accept().await {
//!     tokio::spawn(serve(conn));
//! }
//! ```

mod config;
mod dialer;
mod error;
mod framing;
mod peer;
mod router;
mod server;

// --- public API
pub use config::RevDialConfig;
pub use dialer::RevDialer;
pub use error::RevDialError;
pub use framing::{read_frame, write_frame, Frame, FIXED_HEADER_LEN, MAGIC, MAX_PAYLOAD_LEN, VERSION};
pub use peer::{open_control_channel, ControlHandle};
pub use router::{AttachRouter, PendingAttach};
pub use server::{handle_connection, RevDialServer, Registration};
