//! Async byte stream over a virtual TCP connection.
//!
//! [`TunnelStream`] implements `AsyncRead + AsyncWrite` on top of two
//! channels to the event loop, which owns the smoltcp socket:
//!
//! - writes become [`StreamMessage::Data`], `shutdown()` becomes
//!   [`StreamMessage::Shutdown`] (FIN, reads keep working);
//! - reads take `Bytes` chunks; the event loop dropping its sender is EOF.
//!
//! Every operation that frees capacity or queues work pokes the loop's
//! [`Notify`] so it never waits for a timer to make progress.

use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::PollSender;

/// Channel capacity for stream <-> event loop communication.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Messages sent from a [`TunnelStream`] to the event loop.
#[derive(Debug)]
pub enum StreamMessage {
    /// Application data for the virtual socket.
    Data(Bytes),
    /// Close the write side (send FIN once queued data is out).
    Shutdown,
}

/// The event loop's ends of a stream's channels.
#[derive(Debug)]
pub struct StreamChannels {
    /// Data read from the virtual socket, for the application.
    pub inbound_tx: mpsc::Sender<Bytes>,
    /// Data and shutdown requests written by the application.
    pub outbound_rx: mpsc::Receiver<StreamMessage>,
}

/// A virtual TCP stream inside the tunnel.
pub struct TunnelStream {
    outbound: PollSender<StreamMessage>,
    inbound: mpsc::Receiver<Bytes>,
    read_buf: BytesMut,
    wake: Arc<Notify>,
    peer: SocketAddr,
    write_closed: bool,
}

impl TunnelStream {
    /// Create a stream and the channel ends the event loop keeps.
    pub fn new_pair(peer: SocketAddr, wake: Arc<Notify>) -> (Self, StreamChannels) {
        let (inbound_tx, inbound_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        let stream = TunnelStream {
            outbound: PollSender::new(outbound_tx),
            inbound: inbound_rx,
            read_buf: BytesMut::new(),
            wake,
            peer,
            write_closed: false,
        };
        let channels = StreamChannels {
            inbound_tx,
            outbound_rx,
        };
        (stream, channels)
    }

    /// Remote end of the virtual connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn broken_pipe() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "tunnel stream is closed")
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.read_buf.is_empty() {
            match ready!(this.inbound.poll_recv(cx)) {
                Some(data) => {
                    this.read_buf.extend_from_slice(&data);
                    // a channel slot just freed up
                    this.wake.notify_one();
                }
                // event loop dropped the sender: EOF
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = std::cmp::min(this.read_buf.len(), buf.remaining());
        buf.put_slice(&this.read_buf.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.write_closed {
            return Poll::Ready(Err(Self::broken_pipe()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if ready!(this.outbound.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(Self::broken_pipe()));
        }
        if this
            .outbound
            .send_item(StreamMessage::Data(Bytes::copy_from_slice(buf)))
            .is_err()
        {
            return Poll::Ready(Err(Self::broken_pipe()));
        }
        this.wake.notify_one();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.write_closed {
            return Poll::Ready(Ok(()));
        }

        if ready!(this.outbound.poll_reserve(cx)).is_err() {
            // loop already gone, nothing left to close
            this.write_closed = true;
            return Poll::Ready(Ok(()));
        }
        let _ = this.outbound.send_item(StreamMessage::Shutdown);
        this.write_closed = true;
        this.wake.notify_one();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        // the loop notices the closed channels on its next pass
        self.wake.notify_one();
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("peer", &self.peer)
            .field("write_closed", &self.write_closed)
            .field("read_buf_len", &self.read_buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (TunnelStream, StreamChannels, Arc<Notify>) {
        let wake = Arc::new(Notify::new());
        let (stream, channels) =
            TunnelStream::new_pair("10.0.0.1:80".parse().unwrap(), wake.clone());
        (stream, channels, wake)
    }

    #[tokio::test]
    async fn test_read_from_channel() {
        let (mut stream, channels, _wake) = pair();
        channels
            .inbound_tx
            .send(Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let mut buf = [0u8; 10];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_read_partial() {
        let (mut stream, channels, _wake) = pair();
        channels
            .inbound_tx
            .send(Bytes::from_static(b"hello world"))
            .await
            .unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let mut rest = [0u8; 10];
        let n = stream.read(&mut rest).await.unwrap();
        assert_eq!(&rest[..n], b" world");
    }

    #[tokio::test]
    async fn test_read_notifies_loop() {
        let (mut stream, channels, wake) = pair();
        channels.inbound_tx.send(Bytes::from_static(b"x")).await.unwrap();

        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await.unwrap();
        // permit stored by notify_one
        tokio::time::timeout(std::time::Duration::from_secs(1), wake.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_eof_when_sender_dropped() {
        let (mut stream, channels, _wake) = pair();
        drop(channels.inbound_tx);

        let mut buf = [0u8; 10];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_to_channel() {
        let (mut stream, mut channels, _wake) = pair();
        stream.write_all(b"test data").await.unwrap();

        match channels.outbound_rx.recv().await.unwrap() {
            StreamMessage::Data(data) => assert_eq!(&data[..], b"test data"),
            other => panic!("Expected Data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_is_half_close() {
        let (mut stream, mut channels, _wake) = pair();
        stream.write_all(b"last").await.unwrap();
        stream.shutdown().await.unwrap();

        assert!(matches!(
            channels.outbound_rx.recv().await,
            Some(StreamMessage::Data(_))
        ));
        assert!(matches!(
            channels.outbound_rx.recv().await,
            Some(StreamMessage::Shutdown)
        ));

        // writes fail, reads still work
        assert!(stream.write(b"more").await.is_err());
        channels
            .inbound_tx
            .send(Bytes::from_static(b"reply"))
            .await
            .unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }

    #[tokio::test]
    async fn test_write_fails_when_loop_gone() {
        let (mut stream, channels, _wake) = pair();
        drop(channels);
        assert!(stream.write(b"data").await.is_err());
    }

    #[tokio::test]
    async fn test_drop_closes_outbound() {
        let (stream, mut channels, _wake) = pair();
        drop(stream);
        assert!(channels.outbound_rx.recv().await.is_none());
        assert!(channels.inbound_tx.is_closed());
    }

    #[test]
    fn test_debug_impl() {
        let (stream, _channels, _wake) = pair();
        let debug = format!("{:?}", stream);
        assert!(debug.contains("TunnelStream"));
        assert!(debug.contains("10.0.0.1:80"));
    }
}
