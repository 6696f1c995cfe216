//! Name resolution through the tunnel.
//!
//! Queries go to the configured DNS server over a datagram socket opened
//! by the injected dialer, so the host resolver never sees the names.

use super::dns::{build_query, parse_a_records, response_id, QTYPE_A};
use crate::error::WgProxyError;
use crate::transport::Dialer;
use anyhow::{Context, Result};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};

/// How long one query waits for its answer.
pub const DNS_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Queries sent before giving up on a silent server.
pub const DNS_ATTEMPTS: usize = 2;

/// Largest response accepted (EDNS-sized).
const DNS_BUF_SIZE: usize = 4096;

/// IPv4 resolver that asks one DNS server through a [`Dialer`].
#[derive(Debug, Clone)]
pub struct TunnelResolver {
    dialer: Arc<dyn Dialer>,
    server: String,
    query_timeout: Duration,
}

impl TunnelResolver {
    /// Resolve through `server` (`ip:port`), reached with `dialer`.
    pub fn new(dialer: Arc<dyn Dialer>, server: impl Into<String>) -> Self {
        TunnelResolver {
            dialer,
            server: server.into(),
            query_timeout: DNS_QUERY_TIMEOUT,
        }
    }

    /// Set the per-query timeout
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// The DNS server queries go to.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Resolve `name` to its first IPv4 address.
    ///
    /// IP literals come back as-is without a query.
    pub async fn resolve(&self, name: &str) -> Result<IpAddr> {
        if let Ok(ip) = name.parse::<IpAddr>() {
            return Ok(ip);
        }

        let result = self.lookup(name).await;
        match &result {
            Ok(ip) => info!("Resolve {} -> {}", name, ip),
            Err(e) => warn!("Resolve {} -> failed: {:#}", name, e),
        }
        result
    }

    async fn lookup(&self, name: &str) -> Result<IpAddr> {
        let conn = self
            .dialer
            .dial_datagram(&self.server)
            .await
            .with_context(|| format!("Failed to reach DNS server {}", self.server))?;
        let mut buf = vec![0u8; DNS_BUF_SIZE];
        // answers to any query of this lookup count, late ones included
        let mut sent_ids: Vec<u16> = Vec::with_capacity(DNS_ATTEMPTS);

        for attempt in 1..=DNS_ATTEMPTS {
            let id: u16 = rand::random();
            let query = build_query(name, QTYPE_A, id)?;
            conn.send(&query)
                .await
                .with_context(|| format!("Failed to send DNS query to {}", self.server))?;
            sent_ids.push(id);

            let deadline = Instant::now() + self.query_timeout;
            loop {
                let n = match timeout_at(deadline, conn.recv(&mut buf)).await {
                    Ok(received) => received.context("Failed to read DNS response")?,
                    Err(_) => {
                        debug!(
                            "DNS query for {} timed out (attempt {}/{})",
                            name, attempt, DNS_ATTEMPTS
                        );
                        break;
                    }
                };

                let response = &buf[..n];
                let Some(got) = response_id(response).filter(|got| sent_ids.contains(got)) else {
                    trace!("Ignoring stray DNS datagram for {} ({} bytes)", name, n);
                    continue;
                };

                let ips = parse_a_records(response, got)
                    .with_context(|| format!("Bad DNS response for {}", name))?;
                return ips.first().map(|ip| IpAddr::V4(*ip)).ok_or_else(|| {
                    WgProxyError::Resolve(format!("no A records for {}", name)).into()
                });
            }
        }

        Err(WgProxyError::Resolve(format!(
            "no answer from {} for {} after {} attempts",
            self.server, name, DNS_ATTEMPTS
        ))
        .into())
    }
}
