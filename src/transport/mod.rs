//! Transport module for wgproxy
//!
//! The capability traits the forwarding engines are written against, and
//! the two networks that implement them: the host network
//! ([`DirectDialer`]) and the WireGuard tunnel ([`TunnelDialer`]).
//!
//! An engine never knows which network it talks to. The orchestrator picks
//! a dialer once per forward rule and hands it over as `Arc<dyn Dialer>`.

mod direct;
mod tunnel;

pub use direct::DirectDialer;
pub use tunnel::TunnelDialer;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Socket options for configuring host TCP connections
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
        }
    }
}

impl SocketOpts {
    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

/// Dynamic stream trait for boxed streams
pub trait StreamDyn: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Debug> StreamDyn for T {}

/// A connected datagram endpoint (one fixed peer).
#[async_trait]
pub trait Datagram: Debug + Send + Sync {
    /// Send one datagram to the peer.
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Receive one datagram from the peer.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens outbound connections on one network.
#[async_trait]
pub trait Dialer: Debug + Send + Sync {
    /// Open a byte stream to `addr` (`host:port`).
    async fn dial_stream(&self, addr: &str) -> Result<Box<dyn StreamDyn>>;

    /// Open a connected datagram endpoint to `addr` (`host:port`).
    async fn dial_datagram(&self, addr: &str) -> Result<Arc<dyn Datagram>>;
}

/// Yields inbound stream connections.
#[async_trait]
pub trait Acceptor: Debug + Send + Sync {
    /// Wait for the next connection.
    async fn accept(&self) -> io::Result<(Box<dyn StreamDyn>, SocketAddr)>;

    /// Address this acceptor listens on.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// An unconnected datagram socket serving many clients.
#[async_trait]
pub trait PacketListener: Debug + Send + Sync {
    /// Receive one datagram and the address it came from.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Send one datagram to `target`.
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
}
