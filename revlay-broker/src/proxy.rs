//! [`ResilientProxy`]: a long-lived client stream that survives its
//! server-side connection dying and being re-dialed.
//!
//! # Tasks
//!
//! ```text
//!            Uplink ──────────(WriterCmd)── ┐
//!   client ─┤                                 ├── supervisor ── Redial + Upgrade
//!            server_to_client ──(ReaderCmd)── ┘        ▲
//!                    │                                 │
//!                    └──────── ServerFault{epoch} ─────┘
//! ```
//!
//! Every installed server connection gets a fresh epoch.  The direction
//! tasks report faults tagged with the epoch they were using, and the
//! supervisor ignores faults for epochs it has already replaced.
//!
//! While reconnecting, client bytes are spooled (bounded) and flushed to
//! the new connection before any live byte.  Server bytes in flight on a
//! dead connection are not replayed.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---

use revlay_domain::{
    //
    DataConnPtr,
    PeerId,
    Redial,
    Result,
    RevlayError,
    Upgrade,
};

// ---

use super::connman::ConnectionManager;
use super::metrics::{Metrics, MetricsPtr};
use super::spool::InputSpool;

// ---

/// Read chunk for both copy directions.
const CHUNK: usize = 32 * 1024;

// ---------------------------------------------------------------------------
// ProxyConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    // ---
    /// Client bytes held while reconnecting before the session is closed.
    pub buffer_size: usize,

    /// Dial + upgrade attempts per reconnection.
    pub max_attempts: u32,

    /// Overall budget for one reconnection, all attempts included.
    pub reconnect_timeout: Duration,

    /// Back-off unit; attempt `n` is followed by `n × retry_backoff`.
    pub retry_backoff: Duration,
}

// ---

impl Default for ProxyConfig {
    fn default() -> Self {
        // ---
        Self {
            buffer_size: 512 * 1024,
            max_attempts: 3,
            reconnect_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

// ---------------------------------------------------------------------------
// ProxyExit / ProxyStats
// ---------------------------------------------------------------------------

/// How a session ended without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyExit {
    ClientClosed,
    Cancelled,
}

// ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyStats {
    // ---
    pub session_id: Uuid,
    pub reconnects: u64,

    /// Client bytes ever spooled during reconnection.
    pub bytes_buffered_total: u64,

    /// Client bytes spooled right now.
    pub bytes_buffered_now: usize,

    pub client_to_server_bytes: u64,
    pub server_to_client_bytes: u64,
    pub reconnecting: bool,
}

// ---

#[derive(Default)]
struct Counters {
    // ---
    reconnects: AtomicU64,
    buffered_total: AtomicU64,
    buffered_now: AtomicUsize,
    c2s: AtomicU64,
    s2c: AtomicU64,
    reconnecting: AtomicBool,
}

// ---

/// Live view of one session's [`ProxyStats`], usable while `run` owns the
/// proxy.
#[derive(Clone)]
pub struct ProxyStatsHandle {
    // ---
    session_id: Uuid,
    counters: Arc<Counters>,
}

// ---

impl ProxyStatsHandle {
    // ---
    pub fn snapshot(&self) -> ProxyStats {
        // ---
        let c = &self.counters;
        ProxyStats {
            session_id: self.session_id,
            reconnects: c.reconnects.load(Ordering::Relaxed),
            bytes_buffered_total: c.buffered_total.load(Ordering::Relaxed),
            bytes_buffered_now: c.buffered_now.load(Ordering::Relaxed),
            client_to_server_bytes: c.c2s.load(Ordering::Relaxed),
            server_to_client_bytes: c.s2c.load(Ordering::Relaxed),
            reconnecting: c.reconnecting.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// PeerRedial
// ---------------------------------------------------------------------------

/// [`Redial`] through the connection manager, so every attempt rides the
/// peer's grace period and only ever reaches its live generation.
#[derive(Clone)]
pub struct PeerRedial {
    // ---
    manager: ConnectionManager,
    peer: PeerId,
}

// ---

impl PeerRedial {
    pub fn new(manager: ConnectionManager, peer: PeerId) -> Self {
        Self { manager, peer }
    }
}

// ---

#[async_trait]
impl Redial for PeerRedial {
    // ---
    async fn redial(&self) -> Result<DataConnPtr> {
        // ---
        let (conn, generation) = self.manager.dial_tagged(&self.peer).await?;
        debug!(peer = %self.peer, %generation, "proxy dialed peer");
        Ok(conn)
    }
}

// ---------------------------------------------------------------------------
// Internal channels
// ---------------------------------------------------------------------------

type ServerRead = ReadHalf<DataConnPtr>;
type ServerWrite = WriteHalf<DataConnPtr>;

// ---

enum WriterCmd {
    Attach(u64, ServerWrite),
    Detach,
}

enum ReaderCmd {
    Attach(u64, ServerRead),
    Detach,
}

// ---

/// A direction task lost the server connection of `epoch`.
struct ServerFault {
    epoch: u64,
    reason: String,
}

// ---------------------------------------------------------------------------
// ResilientProxy
// ---------------------------------------------------------------------------

pub struct ResilientProxy {
    // ---
    session_id: Uuid,
    client: DataConnPtr,
    initial: Option<DataConnPtr>,
    connector: Connector,
    metrics: Option<MetricsPtr>,
    counters: Arc<Counters>,
}

// ---

impl ResilientProxy {
    // ---
    pub fn new<R>(client: DataConnPtr, redial: R, cfg: ProxyConfig) -> Self
    where
        R: Redial + 'static,
    {
        // ---
        let session_id = Uuid::new_v4();
        Self {
            session_id,
            client,
            initial: None,
            connector: Connector {
                session_id,
                redial: Arc::new(redial),
                upgrade: None,
                cfg,
            },
            metrics: None,
            counters: Arc::new(Counters::default()),
        }
    }

    // ---

    /// Handshake to repeat on every newly dialed server connection.
    pub fn with_upgrade<U>(mut self, upgrade: U) -> Self
    where
        U: Upgrade + 'static,
    {
        self.connector.upgrade = Some(Arc::new(upgrade));
        self
    }

    // ---

    /// Start on an already dialed (and upgraded) server connection instead
    /// of dialing one in `run`.
    pub fn with_server(mut self, server: DataConnPtr) -> Self {
        self.initial = Some(server);
        self
    }

    // ---

    pub fn with_metrics(mut self, metrics: MetricsPtr) -> Self {
        self.metrics = Some(metrics);
        self
    }

    // ---

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    // ---

    pub fn stats_handle(&self) -> ProxyStatsHandle {
        // ---
        ProxyStatsHandle {
            session_id: self.session_id,
            counters: Arc::clone(&self.counters),
        }
    }

    // ---

    /// Drive the session until the client leaves, `cancel` fires, or a
    /// fatal error (overflow, exhausted reconnection) ends it.
    ///
    /// Both sides are closed on every exit path.
    pub async fn run(self, cancel: CancellationToken) -> Result<ProxyExit> {
        // ---
        let ResilientProxy {
            session_id,
            client,
            initial,
            connector,
            metrics,
            counters,
        } = self;

        let _active = metrics.as_ref().map(|m| SessionGauge::enter(Arc::clone(m)));
        info!(%session_id, "proxy session starting");

        let first = match initial {
            Some(conn) => conn,
            None => {
                let conn = tokio::select! {
                    _ = cancel.cancelled() => return Ok(ProxyExit::Cancelled),
                    conn = connector.connect() => conn,
                };
                match conn {
                    Ok(conn) => conn,
                    Err(e) => {
                        if let Some(m) = &metrics {
                            Metrics::inc(&m.proxy_reconnect_failures_total);
                        }
                        warn!(%session_id, error = %e, "initial server connect failed");
                        return Err(e);
                    }
                }
            }
        };

        let (client_rd, client_wr) = tokio::io::split(client);
        let (fault_tx, mut fault_rx) = mpsc::unbounded_channel();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (reader_tx, reader_rx) = mpsc::unbounded_channel();

        let uplink = Uplink {
            session_id,
            cmds: writer_rx,
            faults: fault_tx.clone(),
            spool: InputSpool::new(connector.cfg.buffer_size),
            counters: Arc::clone(&counters),
            writer: None,
        };
        let mut c2s = tokio::spawn(uplink.run(client_rd));
        let mut s2c = tokio::spawn(server_to_client(
            client_wr,
            reader_rx,
            fault_tx,
            Arc::clone(&counters),
        ));

        let mut epoch = 1;
        install(epoch, first, &writer_tx, &reader_tx);

        // A JoinHandle must not be polled again once it has resolved.
        let mut c2s_done = false;
        let mut s2c_done = false;

        let outcome = loop {
            // ---
            let fault = tokio::select! {
                _ = cancel.cancelled() => break Ok(ProxyExit::Cancelled),
                res = &mut c2s => {
                    c2s_done = true;
                    break joined(res);
                }
                res = &mut s2c => {
                    s2c_done = true;
                    break joined(res);
                }
                fault = fault_rx.recv() => match fault {
                    Some(fault) => fault,
                    None => break Ok(ProxyExit::Cancelled),
                },
            };

            if fault.epoch != epoch {
                debug!(%session_id, stale = fault.epoch, epoch, "stale server fault ignored");
                continue;
            }

            warn!(
                %session_id,
                epoch,
                reason = %fault.reason,
                "server connection lost, reconnecting",
            );
            counters.reconnecting.store(true, Ordering::Relaxed);
            let _ = writer_tx.send(WriterCmd::Detach);
            let _ = reader_tx.send(ReaderCmd::Detach);

            let started = Instant::now();
            let conn = tokio::select! {
                _ = cancel.cancelled() => break Ok(ProxyExit::Cancelled),
                res = &mut c2s => {
                    c2s_done = true;
                    break joined(res);
                }
                res = &mut s2c => {
                    s2c_done = true;
                    break joined(res);
                }
                conn = connector.connect() => conn,
            };

            match conn {
                Ok(conn) => {
                    epoch += 1;
                    install(epoch, conn, &writer_tx, &reader_tx);
                    counters.reconnecting.store(false, Ordering::Relaxed);
                    let reconnects = counters.reconnects.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Some(m) = &metrics {
                        Metrics::inc(&m.proxy_reconnects_total);
                    }
                    info!(
                        %session_id,
                        epoch,
                        reconnects,
                        took_ms = started.elapsed().as_millis() as u64,
                        "reconnected, resuming proxy",
                    );
                }
                Err(e) => {
                    if let Some(m) = &metrics {
                        Metrics::inc(&m.proxy_reconnect_failures_total);
                    }
                    break Err(e);
                }
            }
        };

        // Teardown: the tasks own every client and server half.
        c2s.abort();
        s2c.abort();
        if !c2s_done {
            let _ = c2s.await;
        }
        if !s2c_done {
            let _ = s2c.await;
        }
        counters.reconnecting.store(false, Ordering::Relaxed);
        counters.buffered_now.store(0, Ordering::Relaxed);

        match &outcome {
            Ok(exit) => info!(%session_id, ?exit, "proxy session closed"),
            Err(e) => warn!(%session_id, error = %e, "proxy session failed"),
        }
        outcome
    }
}

// ---

fn install(
    epoch: u64,
    conn: DataConnPtr,
    writer_tx: &mpsc::UnboundedSender<WriterCmd>,
    reader_tx: &mpsc::UnboundedSender<ReaderCmd>,
) {
    // ---
    let (rd, wr) = tokio::io::split(conn);
    let _ = writer_tx.send(WriterCmd::Attach(epoch, wr));
    let _ = reader_tx.send(ReaderCmd::Attach(epoch, rd));
}

// ---

fn joined(res: std::result::Result<Result<ProxyExit>, JoinError>) -> Result<ProxyExit> {
    // ---
    match res {
        Ok(outcome) => outcome,
        Err(e) => Err(RevlayError::Transport(format!("proxy task failed: {e}"))),
    }
}

// ---

/// Holds `proxy_sessions_active` up for the lifetime of one `run`.
struct SessionGauge(MetricsPtr);

impl SessionGauge {
    fn enter(metrics: MetricsPtr) -> Self {
        Metrics::inc(&metrics.proxy_sessions_active);
        Self(metrics)
    }
}

impl Drop for SessionGauge {
    fn drop(&mut self) {
        Metrics::dec(&self.0.proxy_sessions_active);
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Bounded dial + upgrade policy shared by the first connect and every
/// reconnection.
struct Connector {
    // ---
    session_id: Uuid,
    redial: Arc<dyn Redial>,
    upgrade: Option<Arc<dyn Upgrade>>,
    cfg: ProxyConfig,
}

// ---

impl Connector {
    // ---
    async fn connect(&self) -> Result<DataConnPtr> {
        // ---
        let session_id = self.session_id;
        let deadline = Instant::now() + self.cfg.reconnect_timeout;
        let mut attempts = 0;
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=self.cfg.max_attempts {
            // ---
            attempts = attempt;
            debug!(%session_id, attempt, "dialing server side");

            match tokio::time::timeout_at(deadline, self.attempt()).await {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(e)) => {
                    warn!(%session_id, attempt, error = %e, "server dial failed");
                    last_error = e.to_string();
                }
                Err(_) => {
                    last_error = format!(
                        "reconnect timeout after {:?}",
                        self.cfg.reconnect_timeout
                    );
                    break;
                }
            }

            if attempt == self.cfg.max_attempts {
                break;
            }

            let backoff = self.cfg.retry_backoff * attempt;
            if Instant::now() + backoff >= deadline {
                tokio::time::sleep_until(deadline).await;
                last_error = format!(
                    "reconnect timeout after {:?} ({last_error})",
                    self.cfg.reconnect_timeout
                );
                break;
            }
            tokio::time::sleep(backoff).await;
        }

        Err(RevlayError::ReconnectionExhausted {
            attempts,
            last_error,
        })
    }

    // ---

    async fn attempt(&self) -> Result<DataConnPtr> {
        // ---
        let mut conn = self.redial.redial().await?;
        if let Some(upgrade) = &self.upgrade {
            upgrade.upgrade(&mut conn).await?;
        }
        Ok(conn)
    }
}

// ---------------------------------------------------------------------------
// Direction tasks
// ---------------------------------------------------------------------------

/// `true` for I/O errors that just mean the client went away.
fn client_gone(e: &std::io::Error) -> bool {
    // ---
    use std::io::ErrorKind::*;
    matches!(
        e.kind(),
        BrokenPipe | ConnectionReset | ConnectionAborted | NotConnected | UnexpectedEof
    )
}

// ---

/// Client → server.  Spools while detached; flushes the spool into each
/// newly attached writer before forwarding live bytes.
///
/// Every server write races the supervisor's commands: once a connection
/// is detached, a write still stuck on it is abandoned and its chunk goes
/// back to the spool for the next connection.
struct Uplink {
    // ---
    session_id: Uuid,
    cmds: mpsc::UnboundedReceiver<WriterCmd>,
    faults: mpsc::UnboundedSender<ServerFault>,
    spool: InputSpool,
    counters: Arc<Counters>,
    writer: Option<(u64, ServerWrite)>,
}

// ---

/// How one server write ended.
enum Delivery {
    Written,
    Failed(std::io::Error),
    /// A command arrived first; `None` means the supervisor is gone.
    Interrupted(Option<WriterCmd>),
}

// ---

impl Uplink {
    // ---
    async fn run(mut self, mut client: ReadHalf<DataConnPtr>) -> Result<ProxyExit> {
        // ---
        let mut buf = vec![0u8; CHUNK];

        loop {
            tokio::select! {
                biased;

                cmd = self.cmds.recv() => {
                    if !self.command(cmd).await {
                        return Ok(ProxyExit::Cancelled);
                    }
                }

                read = client.read(&mut buf) => {
                    // ---
                    let n = match read {
                        Ok(0) => {
                            if let Some((_, wr)) = self.writer.as_mut() {
                                let _ = wr.shutdown().await;
                            }
                            return Ok(ProxyExit::ClientClosed);
                        }
                        Ok(n) => n,
                        Err(e) if client_gone(&e) => return Ok(ProxyExit::ClientClosed),
                        Err(e) => return Err(e.into()),
                    };

                    if !self.forward(&buf[..n]).await? {
                        return Ok(ProxyExit::Cancelled);
                    }
                }
            }
        }
    }

    // ---

    /// Apply a supervisor command, following any command that interrupts
    /// the spool flush.  `false` once the supervisor is gone.
    async fn command(&mut self, mut cmd: Option<WriterCmd>) -> bool {
        // ---
        loop {
            self.writer = None;
            let (epoch, mut wr) = match cmd {
                None => return false,
                Some(WriterCmd::Detach) => return true,
                Some(WriterCmd::Attach(epoch, wr)) => (epoch, wr),
            };

            let pending = self.spool.take();
            if pending.is_empty() {
                self.writer = Some((epoch, wr));
                return true;
            }

            match self.deliver(&mut wr, &pending).await {
                Delivery::Written => {
                    let flushed = pending.len();
                    self.counters.c2s.fetch_add(flushed as u64, Ordering::Relaxed);
                    self.publish_spool();
                    debug!(session_id = %self.session_id, epoch, flushed, "spooled input flushed");
                    self.writer = Some((epoch, wr));
                    return true;
                }
                Delivery::Failed(e) => {
                    self.spool.restore(pending);
                    self.fault(epoch, e.to_string());
                    return true;
                }
                Delivery::Interrupted(next) => {
                    self.spool.restore(pending);
                    cmd = next;
                }
            }
        }
    }

    // ---

    /// Send one chunk read from the client.  `false` once the supervisor
    /// is gone.
    async fn forward(&mut self, data: &[u8]) -> Result<bool> {
        // ---
        let Some((epoch, mut wr)) = self.writer.take() else {
            self.spool_chunk(data)?;
            return Ok(true);
        };

        match self.deliver(&mut wr, data).await {
            Delivery::Written => {
                self.counters.c2s.fetch_add(data.len() as u64, Ordering::Relaxed);
                self.writer = Some((epoch, wr));
                Ok(true)
            }
            Delivery::Failed(e) => {
                self.spool_chunk(data)?;
                self.fault(epoch, e.to_string());
                Ok(true)
            }
            Delivery::Interrupted(cmd) => {
                self.spool_chunk(data)?;
                Ok(self.command(cmd).await)
            }
        }
    }

    // ---

    async fn deliver(&mut self, wr: &mut ServerWrite, data: &[u8]) -> Delivery {
        // ---
        tokio::select! {
            biased;

            cmd = self.cmds.recv() => Delivery::Interrupted(cmd),
            written = write_chunk(wr, data) => match written {
                Ok(()) => Delivery::Written,
                Err(e) => Delivery::Failed(e),
            },
        }
    }

    // ---

    fn spool_chunk(&mut self, data: &[u8]) -> Result<()> {
        // ---
        self.spool.push(data)?;
        self.counters
            .buffered_total
            .store(self.spool.total(), Ordering::Relaxed);
        self.publish_spool();
        Ok(())
    }

    // ---

    fn publish_spool(&self) {
        self.counters
            .buffered_now
            .store(self.spool.len(), Ordering::Relaxed);
    }

    // ---

    fn fault(&self, epoch: u64, reason: String) {
        let _ = self.faults.send(ServerFault { epoch, reason });
    }
}

// ---

async fn write_chunk<W>(wr: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    wr.write_all(data).await?;
    wr.flush().await
}

// ---

/// Server → client.  Reads whichever server connection is attached; on
/// EOF or error reports the fault and idles until the next attach.
async fn server_to_client(
    mut client: WriteHalf<DataConnPtr>,
    mut cmds: mpsc::UnboundedReceiver<ReaderCmd>,
    faults: mpsc::UnboundedSender<ServerFault>,
    counters: Arc<Counters>,
) -> Result<ProxyExit> {
    // ---
    let mut reader: Option<(u64, ServerRead)> = None;
    let mut buf = vec![0u8; CHUNK];

    loop {
        // ---
        let Some((epoch, rd)) = reader.as_mut() else {
            match cmds.recv().await {
                None => return Ok(ProxyExit::Cancelled),
                Some(ReaderCmd::Attach(epoch, rd)) => reader = Some((epoch, rd)),
                Some(ReaderCmd::Detach) => {}
            }
            continue;
        };
        let epoch = *epoch;

        let read = tokio::select! {
            biased;

            cmd = cmds.recv() => {
                match cmd {
                    None => return Ok(ProxyExit::Cancelled),
                    Some(ReaderCmd::Attach(next, rd)) => reader = Some((next, rd)),
                    Some(ReaderCmd::Detach) => reader = None,
                }
                continue;
            }

            read = rd.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => {
                reader = None;
                let _ = faults.send(ServerFault {
                    epoch,
                    reason: "server closed the connection".into(),
                });
                continue;
            }
            Err(e) => {
                reader = None;
                let _ = faults.send(ServerFault { epoch, reason: e.to_string() });
                continue;
            }
            Ok(n) => n,
        };

        match write_chunk(&mut client, &buf[..n]).await {
            Ok(()) => {
                counters.s2c.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) if client_gone(&e) => return Ok(ProxyExit::ClientClosed),
            Err(e) => return Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests;
