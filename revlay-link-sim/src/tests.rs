use std::time::Duration;

// ---

use tokio::io::{AsyncReadExt, AsyncWriteExt};

// ---

use revlay_domain::ReverseDialer;

// ---

use super::*;

// ---

#[tokio::test]
async fn echo_round_trip() {
    // ---
    let (dialer, peer, link) = pair(LinkSimConfig::perfect());
    peer.spawn_echo();

    let mut conn = dialer.dial().await.unwrap();
    conn.write_all(b"hello").await.unwrap();

    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
    assert_eq!(link.dials(), 1);
}

// ---

#[tokio::test]
async fn kill_closes_dialer_and_fails_dials() {
    // ---
    let (dialer, _peer, link) = pair(LinkSimConfig::perfect());
    assert!(!dialer.is_closed());

    link.kill();
    assert!(dialer.is_closed());
    assert!(link.is_dead());

    // closed() resolves immediately once dead
    tokio::time::timeout(Duration::from_secs(1), dialer.closed())
        .await
        .unwrap();
    assert!(dialer.dial().await.is_err());
}

// ---

#[tokio::test(start_paused = true)]
async fn slow_dial_observes_latency_and_kill() {
    // ---
    let (dialer, _peer, link) = pair(LinkSimConfig::slow_dials(Duration::from_secs(5)));

    let start = tokio::time::Instant::now();
    let _conn = dialer.dial().await.unwrap();
    assert!(start.elapsed() >= Duration::from_secs(5));

    let killer = link.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        killer.kill();
    });
    assert!(dialer.dial().await.is_err());
    assert_eq!(link.dials(), 1);
}

// ---

#[tokio::test]
async fn refused_dials_toggle() {
    // ---
    let (dialer, _peer, link) = pair(LinkSimConfig {
        refuse_dials: true,
        ..Default::default()
    });
    assert!(dialer.dial().await.is_err());

    link.refuse_dials(false);
    assert!(dialer.dial().await.is_ok());
}

// ---

#[tokio::test]
async fn sink_records_per_connection_and_breaks() {
    // ---
    let (dialer, peer, _link) = pair(LinkSimConfig::perfect());
    let sink = peer.spawn_sink();

    let mut first = dialer.dial().await.unwrap();
    first.write_all(b"abc").await.unwrap();
    assert!(sink.wait_until(Duration::from_secs(1), |c| c.len() == 1 && c[0] == b"abc").await);

    sink.send_latest(b"xyz").await.unwrap();
    let mut buf = [0u8; 3];
    first.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"xyz");

    sink.break_connections().await;
    let mut rest = Vec::new();
    assert_eq!(first.read_to_end(&mut rest).await.unwrap(), 0);

    let mut second = dialer.dial().await.unwrap();
    second.write_all(b"def").await.unwrap();
    assert!(sink.wait_until(Duration::from_secs(1), |c| c.len() == 2 && c[1] == b"def").await);
    assert_eq!(sink.received(), b"abcdef");
    assert_eq!(sink.connection_count(), 2);
}
