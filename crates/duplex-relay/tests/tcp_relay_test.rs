//! Integration tests relaying real TCP connections over loopback

use duplex_relay::{CloseMode, RelayConfig, RelayOutcome, RelayPair, RelayTracker, Side};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connected (client, server) loopback pair
async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_large_transfer_arrives_in_order() {
    let (mut client_a, server_a) = tcp_pair().await;
    let (mut client_b, server_b) = tcp_pair().await;
    let config = RelayConfig::default().with_read_size(4096);
    let handle = RelayPair::new(server_a, server_b, config).spawn();

    let payload = pattern(4 * 1024 * 1024);
    let expected = payload.clone();

    let writer = tokio::spawn(async move {
        client_a.write_all(&payload).await.unwrap();
        client_a.shutdown().await.unwrap();
        client_a
    });

    let mut received = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, client_b.read_to_end(&mut received))
        .await
        .expect("transfer timed out")
        .unwrap();
    assert_eq!(received.len(), expected.len());
    assert!(received == expected, "payload corrupted or reordered");

    let _client_a = writer.await.unwrap();
    let report = tokio::time::timeout(TEST_TIMEOUT, handle.join())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.outcome, RelayOutcome::Closed);
    assert_eq!(report.a_to_b.bytes, expected.len() as u64);
    assert_eq!(report.b_to_a.bytes, 0);
}

#[tokio::test]
async fn test_close_propagates_to_other_side() {
    let (client_a, server_a) = tcp_pair().await;
    let (mut client_b, server_b) = tcp_pair().await;
    let handle = RelayPair::with_defaults(server_a, server_b).spawn();

    drop(client_a);

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(TEST_TIMEOUT, client_b.read(&mut buf))
        .await
        .expect("close was not propagated")
        .unwrap();
    assert_eq!(n, 0);

    let report = tokio::time::timeout(TEST_TIMEOUT, handle.join())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.outcome, RelayOutcome::Closed);
}

#[tokio::test]
async fn test_half_close_request_response() {
    let (mut client_a, server_a) = tcp_pair().await;
    let (mut client_b, server_b) = tcp_pair().await;
    let config = RelayConfig::default().with_close_mode(CloseMode::HalfClose);
    let handle = RelayPair::new(server_a, server_b, config).spawn();

    client_a.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    client_a.shutdown().await.unwrap();

    let mut request = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, client_b.read_to_end(&mut request))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request, b"GET / HTTP/1.0\r\n\r\n");

    client_b.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await.unwrap();
    client_b.shutdown().await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, client_a.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, b"HTTP/1.0 200 OK\r\n\r\n");

    let report = tokio::time::timeout(TEST_TIMEOUT, handle.join())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.outcome, RelayOutcome::Closed);
}

#[tokio::test]
async fn test_reset_fails_pair_and_resets_peer() {
    let (mut client_a, server_a) = tcp_pair().await;
    let (client_b, server_b) = tcp_pair().await;
    let handle = RelayPair::with_defaults(server_a, server_b).spawn();

    socket2::SockRef::from(&client_b)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(client_b);

    let report = tokio::time::timeout(TEST_TIMEOUT, handle.join())
        .await
        .unwrap()
        .unwrap();
    match report.outcome {
        RelayOutcome::Failed { side, .. } => assert_eq!(side, Side::B),
        other => panic!("expected failure on side B, got {:?}", other),
    }

    // A was closed abortively, so it never sees a clean end of stream
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(TEST_TIMEOUT, client_a.read(&mut buf))
        .await
        .unwrap();
    assert!(read.is_err(), "expected reset, got {:?}", read);
}

#[tokio::test]
async fn test_tracker_shutdown_closes_all_pairs() {
    let tracker = RelayTracker::new();
    let mut clients = Vec::new();

    for _ in 0..3 {
        let (client_a, server_a) = tcp_pair().await;
        let (client_b, server_b) = tcp_pair().await;
        tracker.register(RelayPair::with_defaults(server_a, server_b).spawn());
        clients.push((client_a, client_b));
    }
    assert_eq!(tracker.len(), 3);

    let reports = tracker.shutdown(TEST_TIMEOUT).await;
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| r.outcome == RelayOutcome::Closed));

    for (mut client_a, mut client_b) in clients {
        let mut buf = [0u8; 4];
        assert_eq!(client_a.read(&mut buf).await.unwrap(), 0);
        assert_eq!(client_b.read(&mut buf).await.unwrap(), 0);
    }
}
