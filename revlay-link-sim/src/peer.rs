use std::sync::Arc;
use std::time::Duration;

// ---

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ---

use super::dialer::Shared;

// ---------------------------------------------------------------------------
// SimPeer
// ---------------------------------------------------------------------------

/// Peer-side end of a simulated control channel: receives the far end of
/// every data connection its [`super::SimDialer`] produces.
pub struct SimPeer {
    // ---
    pub(crate) shared: Arc<Shared>,
    pub(crate) conn_rx: mpsc::UnboundedReceiver<DuplexStream>,
}

// ---

impl SimPeer {
    // ---
    /// Next data connection, or `None` once the control channel is dead
    /// and every dialed connection has been drained.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        // ---
        tokio::select! {
            biased;
            conn = self.conn_rx.recv() => conn,
            _ = self.shared.done.cancelled() => self.conn_rx.try_recv().ok(),
        }
    }

    // ---

    /// Echo every byte of every data connection back to the dialer.
    pub fn spawn_echo(mut self) {
        // ---
        tokio::spawn(async move {
            while let Some(conn) = self.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = tokio::io::split(conn);
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
    }

    // ---

    /// Record every byte received, per data connection.
    pub fn spawn_sink(mut self) -> SinkLog {
        // ---
        let log = SinkLog::default();
        let sink = log.clone();

        tokio::spawn(async move {
            while let Some(conn) = self.accept().await {
                sink.attach(conn).await;
            }
        });

        log
    }
}

// ---------------------------------------------------------------------------
// SinkLog
// ---------------------------------------------------------------------------

struct SinkConn {
    // ---
    kill: CancellationToken,
    reader: JoinHandle<()>,
    writer: Option<WriteHalf<DuplexStream>>,
}

// ---

#[derive(Default)]
struct SinkInner {
    // ---
    received: parking_lot::Mutex<Vec<Vec<u8>>>,
    conns: Mutex<Vec<SinkConn>>,
    notify: Notify,
}

// ---

/// Bytes captured by [`SimPeer::spawn_sink`], with controls to talk back
/// and to break connections from the peer side.
#[derive(Clone, Default)]
pub struct SinkLog {
    // ---
    inner: Arc<SinkInner>,
}

// ---

impl SinkLog {
    // ---
    async fn attach(&self, conn: DuplexStream) {
        // ---
        let index = {
            let mut received = self.inner.received.lock();
            received.push(Vec::new());
            received.len() - 1
        };

        let (mut rd, wr) = tokio::io::split(conn);
        let kill = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let token = kill.clone();

        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                let n = tokio::select! {
                    _ = token.cancelled() => break,
                    read = rd.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    },
                };
                inner.received.lock()[index].extend_from_slice(&buf[..n]);
                inner.notify.notify_waiters();
            }
        });

        self.inner.conns.lock().await.push(SinkConn {
            kill,
            reader,
            writer: Some(wr),
        });
        self.inner.notify.notify_waiters();
    }

    // ---

    /// Bytes received on each data connection, in connection order.
    pub fn connections(&self) -> Vec<Vec<u8>> {
        self.inner.received.lock().clone()
    }

    // ---

    /// Every byte received, all connections concatenated in order.
    pub fn received(&self) -> Vec<u8> {
        self.inner.received.lock().concat()
    }

    // ---

    pub fn connection_count(&self) -> usize {
        self.inner.received.lock().len()
    }

    // ---

    /// Wait until `pred` holds for the per-connection log, or `limit` passes.
    pub async fn wait_until<F>(&self, limit: Duration, pred: F) -> bool
    where
        F: Fn(&[Vec<u8>]) -> bool,
    {
        // ---
        let wait = async {
            loop {
                let notified = self.inner.notify.notified();
                if pred(&self.inner.received.lock()) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, wait).await.is_ok()
    }

    // ---

    /// Write `data` to the dialer on the newest live connection.
    pub async fn send_latest(&self, data: &[u8]) -> std::io::Result<()> {
        // ---
        let mut conns = self.inner.conns.lock().await;
        let writer = conns
            .iter_mut()
            .rev()
            .find_map(|c| c.writer.as_mut())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "no live sink connection"))?;
        writer.write_all(data).await
    }

    // ---

    /// Drop every current data connection from the peer side and wait
    /// until both halves are gone.
    pub async fn break_connections(&self) {
        // ---
        let broken: Vec<SinkConn> = self.inner.conns.lock().await.drain(..).collect();
        for conn in &broken {
            conn.kill.cancel();
        }
        for conn in broken {
            drop(conn.writer);
            let _ = conn.reader.await;
        }
    }
}
