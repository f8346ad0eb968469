//! [`RevDialer`]: server-side handle bound to one control connection.
//!
//! Two tasks own the control connection for its whole life:
//!
//! - **writer**: drains the outbound frame queue (`ConnReady`, `Pong`) and
//!   sends a `Ping` every keepalive interval.
//! - **reader**: consumes inbound frames and declares the channel dead on
//!   EOF, I/O error, protocol violation or keepalive silence.
//!
//! Either task exiting cancels `done`, which stops the other, drops both
//! halves of the socket and wakes every `closed()` waiter.

use async_trait::async_trait;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---

use revlay_domain::{DataConnPtr, DataStream, PeerId, ReverseDialer};

// ---

use super::{read_frame, write_frame, AttachRouter, Frame, RevDialConfig, RevDialError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Outbound control frames queued ahead of the writer task.
const CONTROL_QUEUE_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// RevDialer
// ---------------------------------------------------------------------------

pub struct RevDialer {
    // ---
    peer_id: PeerId,
    dialer_id: Uuid,
    ctl_tx: mpsc::Sender<Frame>,
    router: AttachRouter,
    done: CancellationToken,
    cfg: RevDialConfig,
}

// ---

impl RevDialer {
    // ---
    /// Take ownership of a control connection whose `Hello`/`Welcome`
    /// exchange has already completed, and start its reader and writer.
    pub fn spawn<S>(
        control: S,
        peer_id: PeerId,
        dialer_id: Uuid,
        router: AttachRouter,
        cfg: RevDialConfig,
    ) -> Self
    where
        S: DataStream,
    {
        // ---
        let (rd, wr) = tokio::io::split(control);
        let (ctl_tx, ctl_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let done = CancellationToken::new();

        tokio::spawn(write_loop(
            wr,
            ctl_rx,
            done.clone(),
            cfg.clone(),
            peer_id.clone(),
        ));
        tokio::spawn(read_loop(
            rd,
            ctl_tx.clone(),
            done.clone(),
            cfg.clone(),
            peer_id.clone(),
        ));

        tracing::debug!(%peer_id, %dialer_id, "control channel up");

        Self {
            peer_id,
            dialer_id,
            ctl_tx,
            router,
            done,
            cfg,
        }
    }

    // ---

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    // ---

    pub fn dialer_id(&self) -> Uuid {
        self.dialer_id
    }

    // ---

    async fn request(&self) -> Result<DataConnPtr, RevDialError> {
        // ---
        let request_id = Uuid::new_v4();
        let mut pending = self.router.register(self.dialer_id, request_id);

        self.ctl_tx
            .send(Frame::ConnReady { request_id })
            .await
            .map_err(|_| RevDialError::ControlClosed)?;

        pending.wait().await.ok_or(RevDialError::ControlClosed)
    }
}

// ---

#[async_trait]
impl ReverseDialer for RevDialer {
    // ---
    async fn dial(&self) -> revlay_domain::Result<DataConnPtr> {
        // ---
        if self.done.is_cancelled() {
            return Err(RevDialError::ControlClosed.into());
        }

        let timeout = self.cfg.dial_timeout;

        // Dropping `request()` unregisters the attach slot, so neither
        // branch below can leak a half-open data connection.
        let result = tokio::select! {
            _ = self.done.cancelled() => Err(RevDialError::ControlClosed),
            res = tokio::time::timeout(timeout, self.request()) => {
                res.unwrap_or(Err(RevDialError::AttachTimeout(timeout)))
            }
        };

        match result {
            Ok(conn) => {
                tracing::debug!(peer_id = %self.peer_id, dialer_id = %self.dialer_id, "data connection attached");
                Ok(conn)
            }
            Err(e) => {
                tracing::warn!(peer_id = %self.peer_id, dialer_id = %self.dialer_id, "reverse dial failed: {e}");
                Err(e.into())
            }
        }
    }

    // ---

    async fn closed(&self) {
        self.done.cancelled().await
    }

    // ---

    fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    // ---

    fn close(&self) {
        self.done.cancel();
    }
}

// ---

impl Drop for RevDialer {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

// ---------------------------------------------------------------------------
// Control loops
// ---------------------------------------------------------------------------

async fn write_loop<S: DataStream>(
    mut wr: WriteHalf<S>,
    mut ctl_rx: mpsc::Receiver<Frame>,
    done: CancellationToken,
    cfg: RevDialConfig,
    peer_id: PeerId,
) {
    // ---
    let mut keepalive = tokio::time::interval(cfg.keepalive_interval);
    keepalive.tick().await; // first tick is immediate

    loop {
        let frame = tokio::select! {
            _ = done.cancelled() => break,
            _ = keepalive.tick() => Frame::Ping,
            msg = ctl_rx.recv() => match msg {
                Some(frame) => frame,
                None => break,
            },
        };

        if let Err(e) = write_frame(&mut wr, &frame).await {
            tracing::warn!(%peer_id, "control write failed: {e}");
            break;
        }
    }

    done.cancel();
}

// ---

async fn read_loop<S: DataStream>(
    mut rd: ReadHalf<S>,
    ctl_tx: mpsc::Sender<Frame>,
    done: CancellationToken,
    cfg: RevDialConfig,
    peer_id: PeerId,
) {
    // ---
    loop {
        let read = tokio::select! {
            _ = done.cancelled() => break,
            read = tokio::time::timeout(cfg.keepalive_timeout, read_frame(&mut rd)) => read,
        };

        match read {
            Ok(Ok(Some(Frame::Pong))) => {}
            Ok(Ok(Some(Frame::Ping))) => {
                if ctl_tx.try_send(Frame::Pong).is_err() {
                    tracing::debug!(%peer_id, "control queue full, pong skipped");
                }
            }
            Ok(Ok(Some(other))) => {
                tracing::warn!(%peer_id, frame = other.kind(), "unexpected frame on control channel");
                break;
            }
            Ok(Ok(None)) => {
                tracing::info!(%peer_id, "control channel closed by peer");
                break;
            }
            Ok(Err(e)) => {
                tracing::warn!(%peer_id, "control read failed: {e}");
                break;
            }
            Err(_) => {
                tracing::warn!(%peer_id, timeout = ?cfg.keepalive_timeout, "control channel silent, declaring dead");
                break;
            }
        }
    }

    done.cancel();
}
