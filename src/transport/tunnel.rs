//! Tunnel network transport
//!
//! Dials through the userspace WireGuard stack. Local forwards and the
//! SOCKS5 server reach their targets through this.

use super::{Acceptor, Datagram, Dialer, StreamDyn};
use crate::error::WgProxyError;
use crate::helper::{literal_socket_addr, split_host_port};
use crate::proxy::TunnelResolver;
use crate::tunnel::{Tunnel, TunnelDatagram, TunnelListener};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Dialer for addresses inside the tunnel
///
/// Hostnames are resolved with the attached [`TunnelResolver`], never with
/// the host resolver. Without one, only IP literals can be dialed.
#[derive(Debug, Clone)]
pub struct TunnelDialer {
    tunnel: Arc<Tunnel>,
    resolver: Option<TunnelResolver>,
}

impl TunnelDialer {
    /// Dial through `tunnel`, IP literals only.
    pub fn new(tunnel: Arc<Tunnel>) -> Self {
        TunnelDialer {
            tunnel,
            resolver: None,
        }
    }

    /// Resolve hostnames with `resolver`
    pub fn with_resolver(mut self, resolver: TunnelResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// The tunnel this dialer uses.
    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    async fn resolve(&self, addr: &str) -> Result<SocketAddr> {
        if let Some(sa) = literal_socket_addr(addr) {
            return Ok(sa);
        }

        let (host, port) = split_host_port(addr)?;
        let resolver = self.resolver.as_ref().ok_or_else(|| {
            WgProxyError::Resolve(format!("no tunnel resolver configured for {}", host))
        })?;
        let ip = resolver.resolve(host).await?;
        Ok(SocketAddr::new(ip, port))
    }
}

#[async_trait]
impl Dialer for TunnelDialer {
    async fn dial_stream(&self, addr: &str) -> Result<Box<dyn StreamDyn>> {
        let remote = self.resolve(addr).await?;
        let stream = self
            .tunnel
            .connect(remote)
            .await
            .with_context(|| format!("Failed to connect to {} through the tunnel", addr))?;
        tracing::debug!("Tunnel connection established to {}", remote);
        Ok(Box::new(stream))
    }

    async fn dial_datagram(&self, addr: &str) -> Result<Arc<dyn Datagram>> {
        let remote = self.resolve(addr).await?;
        let datagram = self
            .tunnel
            .bind_udp(remote)
            .await
            .with_context(|| format!("Failed to open tunnel UDP socket to {}", addr))?;
        Ok(Arc::new(datagram))
    }
}

#[async_trait]
impl Acceptor for TunnelListener {
    async fn accept(&self) -> io::Result<(Box<dyn StreamDyn>, SocketAddr)> {
        let (stream, peer) = TunnelListener::accept(self).await?;
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(TunnelListener::local_addr(self))
    }
}

#[async_trait]
impl Datagram for TunnelDatagram {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        TunnelDatagram::send(self, buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        TunnelDatagram::recv(self, buf).await
    }
}
