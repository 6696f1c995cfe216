//! Test utilities and mocks for wgproxy
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use std::io;
use wgproxy::transport::{Acceptor, Datagram, Dialer, DirectDialer, PacketListener, StreamDyn};

/// Upper bound for any single wait in these tests
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// TCP server that echoes each connection until EOF, then closes its side
pub async fn spawn_tcp_echo_server() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if stream.read_to_end(&mut buf).await.is_ok() {
                    let _ = stream.write_all(&buf).await;
                    let _ = stream.shutdown().await;
                }
            });
        }
    });
    addr
}

/// UDP server answering `<sender port>:<payload>` to every datagram
pub async fn spawn_udp_tagging_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let mut reply = format!("{}:", from.port()).into_bytes();
            reply.extend_from_slice(&buf[..n]);
            let _ = socket.send_to(&reply, from).await;
        }
    });
    addr
}

/// DNS server answering every A query with `ip`; counts queries
pub async fn spawn_dns_server(ip: Ipv4Addr) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let queries = Arc::new(AtomicUsize::new(0));
    let counter = queries.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = socket.send_to(&dns_answer(&buf[..n], ip), from).await;
        }
    });
    (addr, queries)
}

/// Turn a query into a response carrying one A record
fn dns_answer(query: &[u8], ip: Ipv4Addr) -> Vec<u8> {
    let mut out = query.to_vec();
    out[2] = 0x81;
    out[3] = 0x80;
    out[6..8].copy_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01]);
    out.extend_from_slice(&60u32.to_be_bytes());
    out.extend_from_slice(&4u16.to_be_bytes());
    out.extend_from_slice(&ip.octets());
    out
}

/// Host dialer that fails its first `failures` stream dials
#[derive(Debug)]
pub struct FlakyDialer {
    inner: DirectDialer,
    failures: AtomicUsize,
}

impl FlakyDialer {
    /// Fail the next `failures` dials
    pub fn new(failures: usize) -> Self {
        FlakyDialer {
            inner: DirectDialer::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl Dialer for FlakyDialer {
    async fn dial_stream(&self, addr: &str) -> Result<Box<dyn StreamDyn>> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            anyhow::bail!("scripted dial failure to {}", addr);
        }
        self.inner.dial_stream(addr).await
    }

    async fn dial_datagram(&self, addr: &str) -> Result<Arc<dyn Datagram>> {
        self.inner.dial_datagram(addr).await
    }
}

/// Host dialer that records every address it is asked for
#[derive(Debug, Default)]
pub struct RecordingDialer {
    inner: DirectDialer,
    /// Addresses passed to `dial_stream`/`dial_datagram`
    pub dialed: Mutex<Vec<String>>,
}

#[async_trait]
impl Dialer for RecordingDialer {
    async fn dial_stream(&self, addr: &str) -> Result<Box<dyn StreamDyn>> {
        self.dialed.lock().unwrap().push(addr.to_string());
        self.inner.dial_stream(addr).await
    }

    async fn dial_datagram(&self, addr: &str) -> Result<Arc<dyn Datagram>> {
        self.dialed.lock().unwrap().push(addr.to_string());
        self.inner.dial_datagram(addr).await
    }
}

/// Receive one datagram with a timeout
pub async fn recv_within(socket: &UdpSocket, buf: &mut [u8]) -> (usize, SocketAddr) {
    tokio::time::timeout(TEST_TIMEOUT, socket.recv_from(buf))
        .await
        .expect("timed out waiting for datagram")
        .unwrap()
}

/// Acceptor whose every accept fails, as a closed listener would
#[derive(Debug)]
pub struct BrokenAcceptor;

#[async_trait]
impl Acceptor for BrokenAcceptor {
    async fn accept(&self) -> io::Result<(Box<dyn StreamDyn>, SocketAddr)> {
        Err(io::Error::new(io::ErrorKind::Other, "listener closed"))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, 9)))
    }
}

/// Packet listener whose every receive fails
#[derive(Debug)]
pub struct BrokenPacketListener;

#[async_trait]
impl PacketListener for BrokenPacketListener {
    async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        Err(io::Error::new(io::ErrorKind::Other, "socket closed"))
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> io::Result<usize> {
        Ok(buf.len())
    }
}

/// Outbound datagram that keeps what it is sent and fails every read
#[derive(Debug, Default)]
pub struct DeafDatagram {
    /// Payloads sent so far, in order
    pub sent: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl Datagram for DeafDatagram {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.sent.lock().unwrap().push(buf.to_vec());
        Ok(buf.len())
    }

    async fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer went away"))
    }
}

/// Dialer handing out one shared [`DeafDatagram`] and counting dials
#[derive(Debug, Default)]
pub struct DeafDialer {
    /// The datagram every dial returns
    pub outbound: Arc<DeafDatagram>,
    /// Number of `dial_datagram` calls
    pub dials: AtomicUsize,
}

#[async_trait]
impl Dialer for DeafDialer {
    async fn dial_stream(&self, addr: &str) -> Result<Box<dyn StreamDyn>> {
        anyhow::bail!("no streams to {}", addr)
    }

    async fn dial_datagram(&self, _addr: &str) -> Result<Arc<dyn Datagram>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok(self.outbound.clone())
    }
}

/// Poll `condition` until it holds or [`TEST_TIMEOUT`] runs out
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}
