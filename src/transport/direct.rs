//! Host network transport
//!
//! Plain kernel sockets. Remote forwards dial their targets through this.

use super::{Acceptor, Datagram, Dialer, PacketListener, SocketOpts, StreamDyn};
use crate::helper::default_connect_timeout;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};

/// Dialer for the host network
#[derive(Debug, Clone)]
pub struct DirectDialer {
    /// Socket options to apply to connections
    socket_opts: SocketOpts,
    /// Connection timeout
    connect_timeout: Duration,
}

impl Default for DirectDialer {
    fn default() -> Self {
        DirectDialer {
            socket_opts: SocketOpts::default(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl DirectDialer {
    /// Create a new dialer with default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set socket options
    pub fn with_socket_opts(mut self, opts: SocketOpts) -> Self {
        self.socket_opts = opts;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Connect a TCP stream to `addr` with the configured timeout and options.
    pub async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("Connection timeout to {}", addr))?
            .with_context(|| format!("Failed to connect to {}", addr))?;

        if let Err(e) = self.socket_opts.apply(&stream) {
            tracing::warn!("Failed to apply socket options: {}", e);
        }

        tracing::debug!("TCP connection established to {}", addr);
        Ok(stream)
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial_stream(&self, addr: &str) -> Result<Box<dyn StreamDyn>> {
        let stream = self.connect(addr).await?;
        Ok(Box::new(stream))
    }

    async fn dial_datagram(&self, addr: &str) -> Result<Arc<dyn Datagram>> {
        let remote = lookup_host(addr)
            .await
            .with_context(|| format!("Failed to resolve {}", addr))?
            .next()
            .with_context(|| format!("No addresses found for {}", addr))?;

        let bind: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let socket = UdpSocket::bind(bind)
            .await
            .context("Failed to bind UDP socket")?;
        socket
            .connect(remote)
            .await
            .with_context(|| format!("Failed to connect UDP socket to {}", remote))?;

        Ok(Arc::new(socket))
    }
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(Box<dyn StreamDyn>, SocketAddr)> {
        let (stream, peer) = TcpListener::accept(self).await?;
        if let Err(e) = SocketOpts::default().apply(&stream) {
            tracing::debug!("Failed to apply socket options for {}: {}", peer, e);
        }
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

#[async_trait]
impl Datagram for UdpSocket {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }
}

#[async_trait]
impl PacketListener for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_direct_dialer_defaults() {
        let dialer = DirectDialer::new();
        assert!(dialer.socket_opts.nodelay);
        assert_eq!(dialer.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_direct_dialer_with_connect_timeout() {
        let dialer = DirectDialer::new().with_connect_timeout(Duration::from_secs(30));
        assert_eq!(dialer.connect_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_dial_stream_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = DirectDialer::new().with_connect_timeout(Duration::from_millis(500));
        assert!(dialer.dial_stream(&addr.to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_dial_stream_and_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = Acceptor::local_addr(&listener).unwrap().to_string();

        let dialer = DirectDialer::new();
        let (dialed, accepted) = tokio::join!(
            dialer.dial_stream(&addr),
            Acceptor::accept(&listener)
        );
        let mut dialed = dialed.unwrap();
        let (mut accepted, _peer) = accepted.unwrap();

        dialed.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_dial_datagram_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let dialer = DirectDialer::new();
        let conn = dialer.dial_datagram(&server_addr.to_string()).await.unwrap();
        conn.send(b"hello").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        server.send_to(b"world", from).await.unwrap();
        let n = conn.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
    }
}
