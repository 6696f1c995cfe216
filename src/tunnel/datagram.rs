//! Connected virtual UDP socket.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};

/// Datagrams queued per direction before new ones are dropped.
pub const DATAGRAM_CHANNEL_CAPACITY: usize = 64;

/// The event loop's ends of a datagram socket's channels.
#[derive(Debug)]
pub struct DatagramChannels {
    /// Datagrams from the remote, for the application.
    pub inbound_tx: mpsc::Sender<Bytes>,
    /// Datagrams the application wants sent.
    pub outbound_rx: mpsc::Receiver<Bytes>,
}

/// A UDP socket inside the tunnel, connected to one remote endpoint.
///
/// Only datagrams coming from that endpoint are delivered.
#[derive(Debug)]
pub struct TunnelDatagram {
    outbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: Mutex<mpsc::Receiver<Bytes>>,
    wake: Arc<Notify>,
    remote: SocketAddr,
}

impl TunnelDatagram {
    /// Create a datagram socket and the channel ends the event loop keeps.
    pub fn new_pair(remote: SocketAddr, wake: Arc<Notify>) -> (Self, DatagramChannels) {
        let (inbound_tx, inbound_rx) = mpsc::channel(DATAGRAM_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(DATAGRAM_CHANNEL_CAPACITY);

        let datagram = TunnelDatagram {
            outbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            wake,
            remote,
        };
        let channels = DatagramChannels {
            inbound_tx,
            outbound_rx,
        };
        (datagram, channels)
    }

    /// The remote endpoint this socket is connected to.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Queue one datagram for the remote.
    pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.outbound_tx
            .send(Bytes::copy_from_slice(buf))
            .await
            .map_err(|_| closed())?;
        self.wake.notify_one();
        Ok(buf.len())
    }

    /// Wait for one datagram; anything beyond `buf.len()` is discarded.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.inbound_rx.lock().await.recv().await.ok_or_else(closed)?;
        let n = std::cmp::min(data.len(), buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }
}

impl Drop for TunnelDatagram {
    fn drop(&mut self) {
        self.wake.notify_one();
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "tunnel datagram socket is closed")
}
