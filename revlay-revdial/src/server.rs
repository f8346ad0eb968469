//! [`RevDialServer`]: the single listener peers connect out to.
//!
//! Both kinds of inbound connection arrive here and are told apart by their
//! first frame:
//!
//! - `Hello { peer_id }` → control connection.  The server answers
//!   `Welcome`, wraps the socket in a [`RevDialer`] and yields a
//!   [`Registration`] to the application.
//! - `Attach { dialer_id, request_id }` → data connection.  Routed to the
//!   waiting dial through the shared [`AttachRouter`].

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

// ---

use revlay_domain::{DataStream, PeerId};

// ---

use super::error::Result;
use super::{read_frame, write_frame, AttachRouter, Frame, RevDialConfig, RevDialError, RevDialer};

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// A freshly registered control connection, ready for `ConnectionManager::set`.
pub struct Registration {
    // ---
    pub peer_id: PeerId,
    pub dialer: RevDialer,
}

// ---------------------------------------------------------------------------
// RevDialServer
// ---------------------------------------------------------------------------

pub struct RevDialServer {
    // ---
    listener: TcpListener,
    router: AttachRouter,
    cfg: RevDialConfig,
}

// ---

impl RevDialServer {
    // ---
    /// Bind the reverse-dial listener.
    pub async fn bind(addr: SocketAddr, cfg: RevDialConfig) -> Result<Self> {
        // ---
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router: AttachRouter::new(),
            cfg,
        })
    }

    // ---

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    // ---

    /// Start the accept loop.
    ///
    /// Returns a receiver that yields one [`Registration`] per control
    /// connection.  The loop stops when the receiver is dropped.
    pub fn listen(self) -> mpsc::Receiver<Registration> {
        // ---
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                let (stream, remote) = tokio::select! {
                    _ = tx.closed() => break,
                    accepted = self.listener.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("revdial accept failed: {e}");
                            continue;
                        }
                    },
                };

                let router = self.router.clone();
                let cfg = self.cfg.clone();
                let tx = tx.clone();

                tokio::spawn(async move {
                    let _ = stream.set_nodelay(true);
                    match handle_connection(stream, router, cfg).await {
                        Ok(Some(registration)) => {
                            tracing::info!(%remote, peer_id = %registration.peer_id, "control connection registered");
                            tx.send(registration).await.ok();
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(%remote, "revdial handshake failed: {e}");
                        }
                    }
                });
            }

            tracing::info!("revdial accept loop exiting");
        });

        rx
    }
}

// ---------------------------------------------------------------------------
// handle_connection
// ---------------------------------------------------------------------------

/// Classify one inbound connection by its first frame.
///
/// Returns `Some` for a control connection, `None` for a data connection
/// (already handed to its dial, or closed if nobody was waiting).
pub async fn handle_connection<S>(
    mut stream: S,
    router: AttachRouter,
    cfg: RevDialConfig,
) -> Result<Option<Registration>>
where
    S: DataStream,
{
    // ---
    let first = tokio::time::timeout(cfg.handshake_timeout, read_frame(&mut stream))
        .await
        .map_err(|_| RevDialError::HandshakeTimeout(cfg.handshake_timeout))??;

    match first {
        Some(Frame::Hello { peer_id }) => {
            let dialer_id = Uuid::new_v4();
            write_frame(&mut stream, &Frame::Welcome { dialer_id }).await?;

            let peer_id = PeerId::from(peer_id);
            let dialer = RevDialer::spawn(stream, peer_id.clone(), dialer_id, router, cfg);
            Ok(Some(Registration { peer_id, dialer }))
        }

        Some(Frame::Attach {
            dialer_id,
            request_id,
        }) => {
            router.deliver(dialer_id, request_id, Box::new(stream));
            Ok(None)
        }

        Some(other) => Err(RevDialError::UnexpectedFrame(other.kind())),

        None => Err(RevDialError::HandshakeEof),
    }
}
