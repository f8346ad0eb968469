//! Peer side of the reverse dial: [`open_control_channel`] and [`ControlHandle`].
//!
//! The peer never listens.  It opens one outbound control connection, and
//! for every `ConnReady` it receives it opens one more outbound connection,
//! sends `Attach`, and surfaces the socket through [`ControlHandle::accept`]
//! as if it had been accepted from a listener.

use std::net::SocketAddr;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---

use revlay_domain::PeerId;

// ---

use super::error::Result;
use super::{read_frame, write_frame, Frame, RevDialConfig, RevDialError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Attached data connections waiting for `accept()`.
const ACCEPT_QUEUE_DEPTH: usize = 32;

// ---------------------------------------------------------------------------
// open_control_channel
// ---------------------------------------------------------------------------

/// Establish the peer's control channel to `server` and register as `peer_id`.
///
/// One attempt only; reconnection policy belongs to the caller.
pub async fn open_control_channel(
    server: SocketAddr,
    peer_id: PeerId,
    cfg: RevDialConfig,
) -> Result<ControlHandle> {
    // ---
    let mut stream = TcpStream::connect(server).await?;
    let _ = stream.set_nodelay(true);

    write_frame(
        &mut stream,
        &Frame::Hello {
            peer_id: peer_id.to_string(),
        },
    )
    .await?;

    let reply = tokio::time::timeout(cfg.handshake_timeout, read_frame(&mut stream))
        .await
        .map_err(|_| RevDialError::HandshakeTimeout(cfg.handshake_timeout))??;

    let dialer_id = match reply {
        Some(Frame::Welcome { dialer_id }) => dialer_id,
        Some(other) => return Err(RevDialError::UnexpectedFrame(other.kind())),
        None => return Err(RevDialError::HandshakeEof),
    };

    tracing::info!(%peer_id, %dialer_id, %server, "control channel registered");

    let (rd, wr) = stream.into_split();
    let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
    let done = CancellationToken::new();

    tokio::spawn(control_loop(ControlLoop {
        rd,
        wr,
        server,
        dialer_id,
        accept_tx,
        done: done.clone(),
        cfg,
        peer_id: peer_id.clone(),
    }));

    Ok(ControlHandle {
        peer_id,
        dialer_id,
        accept_rx,
        done,
    })
}

// ---------------------------------------------------------------------------
// ControlHandle
// ---------------------------------------------------------------------------

/// Live control channel held by the peer process.
pub struct ControlHandle {
    // ---
    peer_id: PeerId,
    dialer_id: Uuid,
    accept_rx: mpsc::Receiver<TcpStream>,
    done: CancellationToken,
}

// ---

impl ControlHandle {
    // ---
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    // ---

    /// Identifier the server assigned to this registration.
    pub fn dialer_id(&self) -> Uuid {
        self.dialer_id
    }

    // ---

    /// Wait for the next server-requested data connection.
    ///
    /// Fails with [`RevDialError::ControlClosed`] once the control channel
    /// is gone; the caller should then open a new one.
    pub async fn accept(&mut self) -> Result<TcpStream> {
        // ---
        tokio::select! {
            conn = self.accept_rx.recv() => conn.ok_or(RevDialError::ControlClosed),
            _ = self.done.cancelled() => Err(RevDialError::ControlClosed),
        }
    }

    // ---

    /// Resolves once the control channel has closed.
    pub async fn closed(&self) {
        self.done.cancelled().await
    }

    // ---

    pub fn close(&self) {
        self.done.cancel();
    }
}

// ---

impl Drop for ControlHandle {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

// ---------------------------------------------------------------------------
// control_loop
// ---------------------------------------------------------------------------

struct ControlLoop {
    // ---
    rd: OwnedReadHalf,
    wr: OwnedWriteHalf,
    server: SocketAddr,
    dialer_id: Uuid,
    accept_tx: mpsc::Sender<TcpStream>,
    done: CancellationToken,
    cfg: RevDialConfig,
    peer_id: PeerId,
}

// ---

async fn control_loop(mut ctl: ControlLoop) {
    // ---
    loop {
        let read = tokio::select! {
            _ = ctl.done.cancelled() => break,
            read = tokio::time::timeout(ctl.cfg.keepalive_timeout, read_frame(&mut ctl.rd)) => read,
        };

        match read {
            Ok(Ok(Some(Frame::Ping))) => {
                if let Err(e) = write_frame(&mut ctl.wr, &Frame::Pong).await {
                    tracing::warn!(peer_id = %ctl.peer_id, "pong write failed: {e}");
                    break;
                }
            }
            Ok(Ok(Some(Frame::Pong))) => {}
            Ok(Ok(Some(Frame::ConnReady { request_id }))) => {
                tokio::spawn(attach(
                    ctl.server,
                    ctl.dialer_id,
                    request_id,
                    ctl.accept_tx.clone(),
                    ctl.peer_id.clone(),
                ));
            }
            Ok(Ok(Some(other))) => {
                tracing::warn!(peer_id = %ctl.peer_id, frame = other.kind(), "unexpected frame from server");
                break;
            }
            Ok(Ok(None)) => {
                tracing::info!(peer_id = %ctl.peer_id, "control channel closed by server");
                break;
            }
            Ok(Err(e)) => {
                tracing::warn!(peer_id = %ctl.peer_id, "control read failed: {e}");
                break;
            }
            Err(_) => {
                tracing::warn!(peer_id = %ctl.peer_id, "no keepalive from server, dropping control channel");
                break;
            }
        }
    }

    ctl.done.cancel();
}

// ---

/// Open one data connection back to the server for `request_id`.
async fn attach(
    server: SocketAddr,
    dialer_id: Uuid,
    request_id: Uuid,
    accept_tx: mpsc::Sender<TcpStream>,
    peer_id: PeerId,
) {
    // ---
    let result = async {
        let mut stream = TcpStream::connect(server).await?;
        let _ = stream.set_nodelay(true);
        write_frame(
            &mut stream,
            &Frame::Attach {
                dialer_id,
                request_id,
            },
        )
        .await?;
        Ok::<_, RevDialError>(stream)
    }
    .await;

    match result {
        Ok(stream) => {
            if accept_tx.send(stream).await.is_err() {
                tracing::debug!(%peer_id, %request_id, "control handle gone, dropping data connection");
            }
        }
        Err(e) => {
            tracing::warn!(%peer_id, %request_id, "attach failed: {e}");
        }
    }
}
