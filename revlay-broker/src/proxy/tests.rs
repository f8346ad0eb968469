use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

// ---

use rand::{rngs::StdRng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ---

use revlay_domain::{DataConnPtr, PeerId, Result, RevlayError, Upgrade};
use revlay_link_sim::{pair, LinkSimConfig, SimLink, SinkLog};

// ---

use super::*;
use crate::connman::{ConnectionManager, ManagerConfig};
use crate::upgrade::HttpUpgrade;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const WAIT: Duration = Duration::from_secs(5);

// ---

/// Client-facing pipe: the proxy's end boxed, the test's end raw.
fn client_pipe() -> (DataConnPtr, DuplexStream) {
    let (proxy_end, test_end) = tokio::io::duplex(256 * 1024);
    (Box::new(proxy_end), test_end)
}

// ---

fn payload(seed: u64, len: usize) -> Vec<u8> {
    // ---
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

// ---

fn digest(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

// ---

/// Register a recording sim peer for `peer`.
fn register_sink(mgr: &ConnectionManager, peer: &PeerId) -> (SimLink, SinkLog) {
    // ---
    let (dialer, sim_peer, link) = pair(LinkSimConfig::perfect());
    let sink = sim_peer.spawn_sink();
    mgr.set(peer.clone(), Arc::new(dialer)).unwrap();
    (link, sink)
}

// ---

async fn wait_for<F: Fn() -> bool>(cond: F) {
    // ---
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---

/// A redial that never produces a connection.
fn never() -> impl Redial {
    || async { std::future::pending::<Result<DataConnPtr>>().await }
}

// ---

/// A redial that always fails, counting its attempts.
fn refusing(count: Arc<AtomicU32>) -> impl Redial {
    // ---
    move || {
        let count = Arc::clone(&count);
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Err::<DataConnPtr, _>(RevlayError::Transport("peer unreachable".into()))
        }
    }
}

// ---

/// A redial that hands out whatever server connections the test feeds it,
/// waiting until one is available.
fn feed() -> (mpsc::UnboundedSender<DataConnPtr>, impl Redial) {
    // ---
    let (tx, rx) = mpsc::unbounded_channel::<DataConnPtr>();
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let redial = move || {
        let rx = Arc::clone(&rx);
        async move {
            rx.lock()
                .await
                .recv()
                .await
                .ok_or_else(|| RevlayError::Transport("no more servers".into()))
        }
    };
    (tx, redial)
}

// ---

async fn read_len(stream: &mut DuplexStream, len: usize) -> Vec<u8> {
    // ---
    let mut buf = vec![0u8; len];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("server side starved")
        .unwrap();
    buf
}

// ---

/// Server connection that accepts `budget` bytes, then fails every write.
/// Its read side never yields, so only the write path can notice.
struct WriteFails {
    budget: usize,
    received: Arc<parking_lot::Mutex<Vec<u8>>>,
}

impl WriteFails {
    fn new(budget: usize) -> (Self, Arc<parking_lot::Mutex<Vec<u8>>>) {
        // ---
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let conn = Self {
            budget,
            received: Arc::clone(&received),
        };
        (conn, received)
    }
}

impl AsyncRead for WriteFails {
    fn poll_read(
        self: Pin<&mut Self>,
        _: &mut Context<'_>,
        _: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for WriteFails {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // ---
        if self.budget == 0 {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "server gone")));
        }
        let n = buf.len().min(self.budget);
        self.budget -= n;
        self.received.lock().extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ---------------------------------------------------------------------------
// Steady state
// ---------------------------------------------------------------------------

#[tokio::test]
async fn forwards_both_directions_through_manager() {
    // ---
    let mgr = ConnectionManager::new(ManagerConfig::default());
    let peer = PeerId::from("desktop-42");
    let (_link, sink) = register_sink(&mgr, &peer);

    let (proxy_end, mut client) = client_pipe();
    let proxy = ResilientProxy::new(
        proxy_end,
        PeerRedial::new(mgr.clone(), peer.clone()),
        ProxyConfig::default(),
    )
    .with_metrics(mgr.metrics());
    let stats = proxy.stats_handle();
    let run = tokio::spawn(proxy.run(CancellationToken::new()));

    client.write_all(b"hello").await.unwrap();
    assert!(sink.wait_until(WAIT, |c| c.concat() == b"hello").await);

    sink.send_latest(b"world").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");

    let snap = stats.snapshot();
    assert_eq!(snap.client_to_server_bytes, 5);
    assert_eq!(snap.server_to_client_bytes, 5);
    assert_eq!(snap.reconnects, 0);
    assert_eq!(mgr.metrics().proxy_sessions_active.load(Ordering::Relaxed), 1);

    drop(client);
    assert_eq!(run.await.unwrap().unwrap(), ProxyExit::ClientClosed);
    assert_eq!(mgr.metrics().proxy_sessions_active.load(Ordering::Relaxed), 0);
}

// ---

#[tokio::test]
async fn client_close_shuts_server_side() {
    // ---
    let (proxy_end, client) = client_pipe();
    let (server_end, mut server) = tokio::io::duplex(4096);

    let proxy = ResilientProxy::new(proxy_end, never(), ProxyConfig::default())
        .with_server(Box::new(server_end));
    let run = tokio::spawn(proxy.run(CancellationToken::new()));

    drop(client);
    assert_eq!(run.await.unwrap().unwrap(), ProxyExit::ClientClosed);

    let mut rest = Vec::new();
    assert_eq!(server.read_to_end(&mut rest).await.unwrap(), 0);
}

// ---

#[tokio::test]
async fn cancel_closes_both_sides() {
    // ---
    let (proxy_end, mut client) = client_pipe();
    let (server_end, mut server) = tokio::io::duplex(4096);

    let cancel = CancellationToken::new();
    let proxy = ResilientProxy::new(proxy_end, never(), ProxyConfig::default())
        .with_server(Box::new(server_end));
    let run = tokio::spawn(proxy.run(cancel.clone()));

    cancel.cancel();
    assert_eq!(run.await.unwrap().unwrap(), ProxyExit::Cancelled);

    let mut rest = Vec::new();
    assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
    assert_eq!(server.read_to_end(&mut rest).await.unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Reconnection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn input_survives_reconnect_byte_exact() {
    // ---
    let mgr = ConnectionManager::new(ManagerConfig::default());
    let peer = PeerId::from("desktop-42");
    let (link1, sink1) = register_sink(&mgr, &peer);

    let (proxy_end, mut client) = client_pipe();
    let proxy = ResilientProxy::new(
        proxy_end,
        PeerRedial::new(mgr.clone(), peer.clone()),
        ProxyConfig::default(),
    );
    let stats = proxy.stats_handle();
    let run = tokio::spawn(proxy.run(CancellationToken::new()));

    let before = payload(1, 100_000);
    let during = payload(2, 200_000);

    client.write_all(&before).await.unwrap();
    assert!(sink1.wait_until(WAIT, |c| c.concat().len() == before.len()).await);

    // Control channel and data connection die together.
    link1.kill();
    sink1.break_connections().await;
    wait_for(|| stats.snapshot().reconnecting && mgr.stats().pending_dials == 1).await;

    client.write_all(&during).await.unwrap();
    wait_for(|| stats.snapshot().bytes_buffered_now == during.len()).await;

    let (_link2, sink2) = register_sink(&mgr, &peer);
    assert!(sink2.wait_until(WAIT, |c| c.concat().len() == during.len()).await);

    let mut delivered = sink1.received();
    delivered.extend_from_slice(&sink2.received());
    let mut expected = before.clone();
    expected.extend_from_slice(&during);
    assert_eq!(delivered.len(), expected.len());
    assert_eq!(digest(&delivered), digest(&expected));

    let snap = stats.snapshot();
    assert_eq!(snap.reconnects, 1);
    assert!(!snap.reconnecting);
    assert_eq!(snap.bytes_buffered_total, during.len() as u64);
    assert_eq!(snap.bytes_buffered_now, 0);
    assert_eq!(sink2.connection_count(), 1);

    // Live traffic resumes on the new connection after the flush.
    client.write_all(b"tail").await.unwrap();
    assert!(sink2.wait_until(WAIT, |c| c[0].ends_with(b"tail")).await);

    drop(client);
    assert_eq!(run.await.unwrap().unwrap(), ProxyExit::ClientClosed);
}


// ---

#[tokio::test]
async fn stalled_write_on_dead_server_moves_to_new_connection() {
    // ---
    let (tx, redial) = feed();
    let (proxy_end, mut client) = client_pipe();
    let (old_end, mut old_server) = tokio::io::duplex(64);

    let proxy = ResilientProxy::new(proxy_end, redial, ProxyConfig::default())
        .with_server(Box::new(old_end));
    let stats = proxy.stats_handle();
    let run = tokio::spawn(proxy.run(CancellationToken::new()));

    // The old server never reads, so this backs up inside the proxy.
    let stalled = payload(7, 4096);
    client.write_all(&stalled).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // It then signals EOF on its read side only.
    old_server.shutdown().await.unwrap();
    wait_for(|| stats.snapshot().reconnecting).await;

    let (fresh_end, mut fresh_server) = tokio::io::duplex(64 * 1024);
    tx.send(Box::new(fresh_end)).unwrap();
    wait_for(|| stats.snapshot().reconnects == 1).await;

    client.write_all(b"after").await.unwrap();

    let mut expected = stalled.clone();
    expected.extend_from_slice(b"after");
    assert_eq!(read_len(&mut fresh_server, expected.len()).await, expected);

    drop(client);
    assert_eq!(run.await.unwrap().unwrap(), ProxyExit::ClientClosed);
    drop(old_server);
}

// ---

#[tokio::test]
async fn failed_live_write_is_spooled_and_replayed() {
    // ---
    let (tx, redial) = feed();
    let (proxy_end, mut client) = client_pipe();

    let before = payload(8, 1000);
    let during = payload(9, 5000);
    let (old, old_received) = WriteFails::new(before.len());

    let proxy = ResilientProxy::new(proxy_end, redial, ProxyConfig::default())
        .with_server(Box::new(old));
    let stats = proxy.stats_handle();
    let run = tokio::spawn(proxy.run(CancellationToken::new()));

    client.write_all(&before).await.unwrap();
    wait_for(|| old_received.lock().len() == before.len()).await;

    // The next write hits the exhausted budget and fails.
    client.write_all(&during).await.unwrap();
    wait_for(|| {
        let snap = stats.snapshot();
        snap.reconnecting && snap.bytes_buffered_now == during.len()
    })
    .await;

    let (fresh_end, mut fresh_server) = tokio::io::duplex(64 * 1024);
    tx.send(Box::new(fresh_end)).unwrap();

    let mut delivered = old_received.lock().clone();
    delivered.extend_from_slice(&read_len(&mut fresh_server, during.len()).await);
    let mut expected = before.clone();
    expected.extend_from_slice(&during);
    assert_eq!(digest(&delivered), digest(&expected));

    assert_eq!(stats.snapshot().reconnects, 1);

    // Nothing beyond the replay reaches the new server.
    client.write_all(b"tail").await.unwrap();
    assert_eq!(read_len(&mut fresh_server, 4).await, b"tail");

    drop(client);
    assert_eq!(run.await.unwrap().unwrap(), ProxyExit::ClientClosed);
}

// ---

#[tokio::test]
async fn failed_flush_keeps_spool_for_next_connection() {
    // ---
    let (tx, redial) = feed();
    let (proxy_end, mut client) = client_pipe();
    let (old_end, mut old_server) = tokio::io::duplex(64 * 1024);

    let proxy = ResilientProxy::new(proxy_end, redial, ProxyConfig::default())
        .with_server(Box::new(old_end));
    let stats = proxy.stats_handle();
    let run = tokio::spawn(proxy.run(CancellationToken::new()));

    let before = payload(10, 10_000);
    let during = payload(11, 20_000);

    client.write_all(&before).await.unwrap();
    assert_eq!(read_len(&mut old_server, before.len()).await, before);

    drop(old_server);
    wait_for(|| stats.snapshot().reconnecting).await;
    client.write_all(&during).await.unwrap();
    wait_for(|| stats.snapshot().bytes_buffered_now == during.len()).await;

    // First replacement dies part-way through the flush.
    let (flaky, flaky_received) = WriteFails::new(100);
    tx.send(Box::new(flaky)).unwrap();
    wait_for(|| {
        let snap = stats.snapshot();
        snap.reconnects == 1 && snap.reconnecting
    })
    .await;
    assert_eq!(*flaky_received.lock(), during[..100]);
    assert_eq!(stats.snapshot().bytes_buffered_now, during.len());

    // The second one gets the whole spool, once.
    let (fresh_end, mut fresh_server) = tokio::io::duplex(64 * 1024);
    tx.send(Box::new(fresh_end)).unwrap();

    let replayed = read_len(&mut fresh_server, during.len()).await;
    assert_eq!(digest(&replayed), digest(&during));

    client.write_all(b"tail").await.unwrap();
    assert_eq!(read_len(&mut fresh_server, 4).await, b"tail");

    let snap = stats.snapshot();
    assert_eq!(snap.reconnects, 2);
    assert_eq!(snap.bytes_buffered_now, 0);

    drop(client);
    assert_eq!(run.await.unwrap().unwrap(), ProxyExit::ClientClosed);
}

// ---

#[tokio::test]
async fn overflow_while_reconnecting_closes_session() {
    // ---
    let (proxy_end, mut client) = client_pipe();
    let (server_end, server) = tokio::io::duplex(4096);

    let cfg = ProxyConfig {
        buffer_size: 1024,
        ..Default::default()
    };
    let proxy = ResilientProxy::new(proxy_end, never(), cfg).with_server(Box::new(server_end));
    let stats = proxy.stats_handle();
    let run = tokio::spawn(proxy.run(CancellationToken::new()));

    drop(server);
    wait_for(|| stats.snapshot().reconnecting).await;

    client.write_all(&payload(3, 4096)).await.unwrap();

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, RevlayError::BufferOverflow { capacity: 1024, .. }));

    // Clean close: nothing partial reaches the client.
    let mut rest = Vec::new();
    assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
}

// ---

#[tokio::test(start_paused = true)]
async fn exhausted_reconnect_closes_session() {
    // ---
    let (proxy_end, mut client) = client_pipe();
    let (server_end, server) = tokio::io::duplex(4096);
    let attempts = Arc::new(AtomicU32::new(0));
    let metrics = Arc::new(Metrics::new());

    let proxy = ResilientProxy::new(
        proxy_end,
        refusing(Arc::clone(&attempts)),
        ProxyConfig::default(),
    )
    .with_server(Box::new(server_end))
    .with_metrics(Arc::clone(&metrics));
    let run = tokio::spawn(proxy.run(CancellationToken::new()));

    let start = Instant::now();
    drop(server);

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        RevlayError::ReconnectionExhausted { attempts: 3, .. }
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    // Linear back-off: 1s after the first failure, 2s after the second.
    let took = start.elapsed();
    assert!(took >= Duration::from_secs(3) && took < Duration::from_secs(4), "took {took:?}");

    assert_eq!(metrics.proxy_reconnect_failures_total.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.proxy_sessions_active.load(Ordering::Relaxed), 0);

    let mut rest = Vec::new();
    assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
}

// ---

#[tokio::test(start_paused = true)]
async fn reconnect_timeout_bounds_hanging_dials() {
    // ---
    let (proxy_end, _client) = client_pipe();
    let (server_end, server) = tokio::io::duplex(4096);

    let cfg = ProxyConfig {
        reconnect_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let proxy = ResilientProxy::new(proxy_end, never(), cfg).with_server(Box::new(server_end));
    let run = tokio::spawn(proxy.run(CancellationToken::new()));

    let start = Instant::now();
    drop(server);

    let err = run.await.unwrap().unwrap_err();
    match err {
        RevlayError::ReconnectionExhausted { attempts, last_error } => {
            assert_eq!(attempts, 1);
            assert!(last_error.contains("timeout"), "{last_error}");
        }
        other => panic!("unexpected error {other}"),
    }
    let took = start.elapsed();
    assert!(took >= Duration::from_secs(5) && took < Duration::from_secs(6), "took {took:?}");
}

// ---

#[tokio::test]
async fn initial_connect_failure_is_reported() {
    // ---
    let (proxy_end, _client) = client_pipe();
    let attempts = Arc::new(AtomicU32::new(0));
    let cfg = ProxyConfig {
        max_attempts: 2,
        retry_backoff: Duration::from_millis(1),
        ..Default::default()
    };

    let proxy = ResilientProxy::new(proxy_end, refusing(Arc::clone(&attempts)), cfg);
    let err = proxy.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, RevlayError::ReconnectionExhausted { attempts: 2, .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

// ---------------------------------------------------------------------------
// Upgrade
// ---------------------------------------------------------------------------

/// Fake upstream: answers the upgrade with `status`, then echoes.
async fn upstream(mut conn: DuplexStream, status: &'static str) {
    // ---
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        match conn.read_u8().await {
            Ok(b) => head.push(b),
            Err(_) => return,
        }
    }
    let response = format!("HTTP/1.1 {status}\r\n\r\n");
    if conn.write_all(response.as_bytes()).await.is_err() || !status.starts_with("101") {
        return;
    }

    let (mut rd, mut wr) = tokio::io::split(conn);
    let _ = tokio::io::copy(&mut rd, &mut wr).await;
}

// ---

#[tokio::test(start_paused = true)]
async fn refused_upgrade_is_retried_on_a_fresh_dial() {
    // ---
    let dials = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&dials);
    let redial = move || {
        let counter = Arc::clone(&counter);
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let (near, far) = tokio::io::duplex(4096);
            let status = if n == 0 { "503 Service Unavailable" } else { "101 Switching Protocols" };
            tokio::spawn(upstream(far, status));
            Ok::<DataConnPtr, RevlayError>(Box::new(near))
        }
    };

    let (proxy_end, mut client) = client_pipe();
    let proxy = ResilientProxy::new(proxy_end, redial, ProxyConfig::default())
        .with_upgrade(HttpUpgrade::new("/ws/input"));
    let run = tokio::spawn(proxy.run(CancellationToken::new()));

    client.write_all(b"keyframe").await.unwrap();
    let mut buf = [0u8; 8];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"keyframe");
    assert_eq!(dials.load(Ordering::SeqCst), 2);

    drop(client);
    assert_eq!(run.await.unwrap().unwrap(), ProxyExit::ClientClosed);
}

// ---

/// Upgrade that records how often it ran.
struct CountingUpgrade(Arc<AtomicU32>);

#[async_trait]
impl Upgrade for CountingUpgrade {
    async fn upgrade(&self, _conn: &mut DataConnPtr) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---

#[tokio::test]
async fn upgrade_runs_on_every_reconnect_but_not_on_given_server() {
    // ---
    let upgrades = Arc::new(AtomicU32::new(0));
    let mgr = ConnectionManager::new(ManagerConfig::default());
    let peer = PeerId::from("hydra-3");
    let (_link, sink) = register_sink(&mgr, &peer);

    let initial = mgr.dial(&peer).await.unwrap();
    let (proxy_end, mut client) = client_pipe();
    let proxy = ResilientProxy::new(
        proxy_end,
        PeerRedial::new(mgr.clone(), peer.clone()),
        ProxyConfig::default(),
    )
    .with_upgrade(CountingUpgrade(Arc::clone(&upgrades)))
    .with_server(initial);
    let stats = proxy.stats_handle();
    let run = tokio::spawn(proxy.run(CancellationToken::new()));

    client.write_all(b"one").await.unwrap();
    assert!(sink.wait_until(WAIT, |c| c.concat() == b"one").await);
    assert_eq!(upgrades.load(Ordering::SeqCst), 0);

    // Data connection drops while the control channel stays up: the
    // redial is served instantly by the same dialer.
    sink.break_connections().await;
    wait_for(|| stats.snapshot().reconnects == 1).await;
    assert_eq!(upgrades.load(Ordering::SeqCst), 1);

    client.write_all(b"two").await.unwrap();
    assert!(sink.wait_until(WAIT, |c| c.len() == 2 && c[1] == b"two").await);

    drop(client);
    assert_eq!(run.await.unwrap().unwrap(), ProxyExit::ClientClosed);
}
