//! TCP relay engine
//!
//! Accepts connections, dials the target for each one and copies bytes in
//! both directions until both sides are done.

use crate::transport::{Acceptor, Dialer};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Bytes moved by one relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// `a` to `b`
    pub a_to_b: u64,
    /// `b` to `a`
    pub b_to_a: u64,
}

/// Accept on `acceptor` and relay every connection to `target` through
/// `dialer`.
///
/// Runs until the acceptor fails. A failed dial only drops that one
/// inbound connection.
pub async fn serve_tcp(
    acceptor: Arc<dyn Acceptor>,
    dialer: Arc<dyn Dialer>,
    target: String,
) -> Result<()> {
    let local = acceptor.local_addr()?;
    info!("TCP relay {} -> {} started", local, target);
    let target: Arc<str> = target.into();

    loop {
        let (inbound, peer) = acceptor
            .accept()
            .await
            .with_context(|| format!("Accept failed on {}", local))?;
        debug!("Accepted {} on {}", peer, local);

        let dialer = dialer.clone();
        let target = target.clone();
        tokio::spawn(async move {
            let outbound = match dialer.dial_stream(&target).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Dial {} failed for {}: {:#}", target, peer, e);
                    return;
                }
            };

            let stats = relay_bidirectional(inbound, outbound).await;
            debug!(
                "Relay {} <-> {} closed ({} bytes out, {} bytes back)",
                peer, target, stats.a_to_b, stats.b_to_a
            );
        });
    }
}

/// Copy `a` → `b` and `b` → `a` until both directions reach end of stream.
///
/// Each direction shuts down its destination's write side when its source
/// is exhausted, so a half-close travels through the relay. Both streams
/// are dropped on return.
pub async fn relay_bidirectional<A, B>(a: A, b: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let (a_to_b, b_to_a) = tokio::join!(
        copy_half(a_read, b_write, "a->b"),
        copy_half(b_read, a_write, "b->a"),
    );
    RelayStats { a_to_b, b_to_a }
}

async fn copy_half<R, W>(mut reader: R, mut writer: W, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut writer).await;
    if let Err(e) = writer.shutdown().await {
        debug!("{} shutdown failed: {}", direction, e);
    }

    match copied {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("{} copy error: {}", direction, e);
            0
        }
    }
}
