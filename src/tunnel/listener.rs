//! Listening TCP port inside the tunnel.

use super::stream::TunnelStream;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};

/// Established connections waiting for `accept()`.
pub const ACCEPT_QUEUE_SIZE: usize = 16;

/// Accepts virtual TCP connections made to the tunnel address.
///
/// The event loop keeps a small backlog of LISTEN sockets for the port and
/// hands over each one that reaches ESTABLISHED. Dropping the listener
/// releases the port.
#[derive(Debug)]
pub struct TunnelListener {
    accept_rx: Mutex<mpsc::Receiver<TunnelStream>>,
    wake: Arc<Notify>,
    local: SocketAddr,
}

impl TunnelListener {
    pub(crate) fn new(
        accept_rx: mpsc::Receiver<TunnelStream>,
        wake: Arc<Notify>,
        local: SocketAddr,
    ) -> Self {
        TunnelListener {
            accept_rx: Mutex::new(accept_rx),
            wake,
            local,
        }
    }

    /// Wait for the next established connection.
    pub async fn accept(&self) -> io::Result<(TunnelStream, SocketAddr)> {
        let stream = self.accept_rx.lock().await.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "tunnel event loop has stopped")
        })?;
        // room in the accept queue again
        self.wake.notify_one();
        let peer = stream.peer_addr();
        Ok((stream, peer))
    }

    /// The tunnel address and port being listened on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Drop for TunnelListener {
    fn drop(&mut self) {
        self.wake.notify_one();
    }
}
