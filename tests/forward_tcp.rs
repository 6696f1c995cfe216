//! TCP relay engine over real host sockets

mod common;

use common::*;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use wgproxy::app::TaskGroup;
use wgproxy::forward::{serve_tcp, UdpMultiplexer};
use wgproxy::transport::DirectDialer;

#[tokio::test]
async fn test_half_close_reaches_target_and_back() {
    let target = spawn_tcp_echo_server().await;
    let (listener, relay_addr) = create_test_listener().await;
    let relay = tokio::spawn(serve_tcp(
        Arc::new(listener),
        Arc::new(DirectDialer::new()),
        target.to_string(),
    ));

    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    client.write_all(b"finite payload").await.unwrap();
    client.shutdown().await.unwrap();

    // the echo server only answers after it saw EOF
    let mut back = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, client.read_to_end(&mut back))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(back, b"finite payload");

    relay.abort();
}

#[tokio::test]
async fn test_dial_failure_does_not_stop_other_connections() {
    let target = spawn_tcp_echo_server().await;
    let (listener, relay_addr) = create_test_listener().await;
    let relay = tokio::spawn(serve_tcp(
        Arc::new(listener),
        Arc::new(FlakyDialer::new(1)),
        target.to_string(),
    ));

    // first connection: dial fails, inbound gets closed
    let mut first = TcpStream::connect(relay_addr).await.unwrap();
    let mut buf = [0u8; 16];
    let closed = tokio::time::timeout(TEST_TIMEOUT, first.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(closed, Ok(0) | Err(_)));

    // second connection relays normally
    let mut second = TcpStream::connect(relay_addr).await.unwrap();
    second.write_all(b"still here").await.unwrap();
    second.shutdown().await.unwrap();
    let mut back = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, second.read_to_end(&mut back))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(back, b"still here");

    assert!(!relay.is_finished());
    relay.abort();
}

#[tokio::test]
async fn test_concurrent_connections_are_independent() {
    let target = spawn_tcp_echo_server().await;
    let (listener, relay_addr) = create_test_listener().await;
    let relay = tokio::spawn(serve_tcp(
        Arc::new(listener),
        Arc::new(DirectDialer::new()),
        target.to_string(),
    ));

    let mut clients = Vec::new();
    for i in 0..4u8 {
        clients.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(relay_addr).await.unwrap();
            let payload = vec![i; 4096];
            stream.write_all(&payload).await.unwrap();
            stream.shutdown().await.unwrap();
            let mut back = Vec::new();
            stream.read_to_end(&mut back).await.unwrap();
            assert_eq!(back, payload);
        }));
    }
    for client in clients {
        tokio::time::timeout(TEST_TIMEOUT, client)
            .await
            .unwrap()
            .unwrap();
    }

    relay.abort();
}

#[tokio::test]
async fn test_accept_failure_ends_engine_with_error() {
    let result = tokio::time::timeout(
        TEST_TIMEOUT,
        serve_tcp(
            Arc::new(BrokenAcceptor),
            Arc::new(DirectDialer::new()),
            "127.0.0.1:9".to_string(),
        ),
    )
    .await
    .unwrap();

    let err = result.unwrap_err();
    assert!(format!("{:#}", err).contains("listener closed"));
}

#[tokio::test]
async fn test_task_group_counts_failed_engines() {
    let mut group = TaskGroup::new();
    group.spawn(
        "broken tcp",
        serve_tcp(
            Arc::new(BrokenAcceptor),
            Arc::new(DirectDialer::new()),
            "127.0.0.1:9".to_string(),
        ),
    );
    group.spawn(
        "broken udp",
        UdpMultiplexer::new(
            Arc::new(BrokenPacketListener),
            Arc::new(DirectDialer::new()),
            "127.0.0.1:9",
        )
        .serve(),
    );

    let failed = tokio::time::timeout(TEST_TIMEOUT, group.join_all())
        .await
        .unwrap();
    assert_eq!(failed, 2);
    assert!(group.is_empty());
}
