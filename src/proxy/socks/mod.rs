//! SOCKS5 server (RFC 1928)
//!
//! No-auth negotiation and the CONNECT command. Domain targets are resolved
//! through the tunnel and every dial goes through [`ProxyDialer`], so the
//! loopback guard applies to all clients.

mod auth;
mod consts;
mod reply;
mod request;

pub use consts::*;
pub use reply::{encode_reply, send_reply};
pub use request::{parse_request, SocksCommand, TargetAddr};

use super::adapter::ProxyDialer;
use super::resolver::TunnelResolver;
use crate::error::Socks5ReplyCode;
use crate::forward::relay_bidirectional;
use crate::transport::Acceptor;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// SOCKS5 server bound to the tunnel's dialer and resolver.
#[derive(Debug, Clone)]
pub struct Socks5Server {
    dialer: ProxyDialer,
    resolver: TunnelResolver,
}

impl Socks5Server {
    /// Create a server using `dialer` for connections and `resolver` for
    /// domain targets.
    pub fn new(dialer: ProxyDialer, resolver: TunnelResolver) -> Self {
        Socks5Server { dialer, resolver }
    }

    /// Accept clients forever, one task each. Returns when accept fails.
    pub async fn serve(self, listener: Arc<dyn Acceptor>) -> Result<()> {
        let local = listener.local_addr()?;
        info!("SOCKS5 server listening on {}", local);
        let server = Arc::new(self);

        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .with_context(|| format!("SOCKS5 accept failed on {}", local))?;

            let server = server.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle(stream).await {
                    debug!("SOCKS5 client {} ended: {:#}", peer, e);
                }
            });
        }
    }

    /// Run one client session to completion.
    pub async fn handle<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        auth::negotiate(&mut stream)
            .await
            .context("SOCKS5 negotiation failed")?;

        let (command, target) = parse_request(&mut stream)
            .await
            .context("Failed to parse SOCKS5 request")?;

        match command {
            Some(SocksCommand::Connect) => {}
            Some(other) => {
                warn!("SOCKS5 {} to {} not supported", other, target);
                send_reply(&mut stream, Socks5ReplyCode::CommandNotSupported, None).await?;
                return Ok(());
            }
            None => {
                warn!("SOCKS5 unknown command to {}", target);
                send_reply(&mut stream, Socks5ReplyCode::CommandNotSupported, None).await?;
                return Ok(());
            }
        }

        let addr = match &target {
            TargetAddr::Ip(addr) => addr.to_string(),
            TargetAddr::Domain(name, port) => match self.resolver.resolve(name).await {
                Ok(ip) => SocketAddr::new(ip, *port).to_string(),
                Err(e) => {
                    send_reply(&mut stream, Socks5ReplyCode::HostUnreachable, None).await?;
                    return Err(e.context(format!("Failed to resolve {}", target)));
                }
            },
        };

        let outbound = match self.dialer.dial("tcp", &addr).await {
            Ok(outbound) => outbound,
            Err(e) => {
                send_reply(&mut stream, Socks5ReplyCode::from_error(&e), None).await?;
                return Err(e);
            }
        };

        send_reply(&mut stream, Socks5ReplyCode::Succeeded, None).await?;
        debug!("SOCKS5 CONNECT {} ({}) established", target, addr);

        let stats = relay_bidirectional(stream, outbound).await;
        debug!(
            "SOCKS5 CONNECT {} closed ({} bytes out, {} bytes back)",
            target, stats.a_to_b, stats.b_to_a
        );
        Ok(())
    }
}
