//! UDP session multiplexer
//!
//! One listening socket, many clients. Each new client address gets its
//! own outbound datagram connection and a task relaying replies back.

use crate::transport::{Datagram, Dialer, PacketListener};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Receive buffer size, large enough for any UDP payload.
pub const UDP_BUFFER_SIZE: usize = 65536;

/// Outbound connections keyed by client address.
///
/// Only the demux loop touches it. Entries live as long as the listener.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<String, Arc<dyn Datagram>>,
}

impl SessionTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Session for `client_key`, if one exists.
    pub fn get(&self, client_key: &str) -> Option<&Arc<dyn Datagram>> {
        self.sessions.get(client_key)
    }

    /// Register the session for `client_key`.
    pub fn insert(&mut self, client_key: String, outbound: Arc<dyn Datagram>) {
        self.sessions.insert(client_key, outbound);
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no client has been seen yet
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Demultiplexes one [`PacketListener`] into per-client sessions to
/// `target`.
#[derive(Debug)]
pub struct UdpMultiplexer {
    listener: Arc<dyn PacketListener>,
    dialer: Arc<dyn Dialer>,
    target: String,
    sessions: SessionTable,
    relays: JoinSet<()>,
}

impl UdpMultiplexer {
    /// Create a multiplexer; nothing runs until [`UdpMultiplexer::serve`].
    pub fn new(
        listener: Arc<dyn PacketListener>,
        dialer: Arc<dyn Dialer>,
        target: impl Into<String>,
    ) -> Self {
        UdpMultiplexer {
            listener,
            dialer,
            target: target.into(),
            sessions: SessionTable::new(),
            relays: JoinSet::new(),
        }
    }

    /// Run the demux loop until the listener fails.
    ///
    /// Reply relays are aborted when this returns.
    pub async fn serve(mut self) -> Result<()> {
        info!("UDP relay -> {} started", self.target);
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];

        loop {
            self.reap_relays();
            let (n, src) = self
                .listener
                .recv_from(&mut buf)
                .await
                .context("UDP receive failed")?;
            let client_key = src.to_string();

            if let Some(outbound) = self.sessions.get(&client_key) {
                if let Err(e) = outbound.send(&buf[..n]).await {
                    debug!("UDP send for {} failed: {}", client_key, e);
                }
                continue;
            }

            let outbound = match self.dialer.dial_datagram(&self.target).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Dial {} failed for {}: {:#}", self.target, client_key, e);
                    continue;
                }
            };
            if let Err(e) = outbound.send(&buf[..n]).await {
                debug!("UDP send for {} failed: {}", client_key, e);
            }

            debug!("New UDP session {} -> {}", client_key, self.target);
            self.sessions.insert(client_key, outbound.clone());
            self.relays
                .spawn(relay_replies(outbound, self.listener.clone(), src));
        }
    }

    /// Drop the handles of reply relays that already exited.
    ///
    /// Their sessions stay in the table.
    fn reap_relays(&mut self) {
        while self.relays.try_join_next().is_some() {}
    }
}

async fn relay_replies(
    outbound: Arc<dyn Datagram>,
    listener: Arc<dyn PacketListener>,
    client: SocketAddr,
) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        let n = match outbound.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                debug!("UDP session {} read failed: {}", client, e);
                return;
            }
        };
        if let Err(e) = listener.send_to(&buf[..n], client).await {
            debug!("UDP reply to {} failed: {}", client, e);
        }
    }
}
