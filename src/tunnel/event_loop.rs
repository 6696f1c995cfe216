//! Background task driving the tunnel.
//!
//! [`EventLoop`] owns every piece of mutable tunnel state: the host UDP
//! socket to the peer, the Noise session and the virtual stack with all of
//! its sockets. Everything else talks to it over channels.
//!
//! One pass of the loop waits for the first of:
//!
//! - an encrypted datagram from the peer,
//! - the WireGuard timer tick,
//! - a [`Command`] from the [`Tunnel`](super::Tunnel) handle,
//! - a wake-up from a stream, datagram or listener handle,
//! - the stack's own poll deadline (retransmits, delayed ACKs),
//!
//! then polls the stack, moves data between sockets and channels, and
//! encrypts whatever the stack wants sent.

use super::datagram::{DatagramChannels, TunnelDatagram};
use super::listener::{TunnelListener, ACCEPT_QUEUE_SIZE};
use super::noise::NoiseSession;
use super::stack::{endpoint_to_socket_addr, VirtualStack};
use super::stream::{StreamChannels, StreamMessage, TunnelStream};
use crate::error::WgProxyError;
use anyhow::{bail, Result};
use bytes::Bytes;
use smoltcp::iface::SocketHandle;
use smoltcp::socket::{tcp, udp};
use smoltcp::wire::{IpAddress, IpEndpoint};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Interval between boringtun timer ticks (ms).
pub const TIMER_TICK_MS: u64 = 250;

/// Maximum number of virtual sockets (TCP, listening and UDP together).
pub const MAX_SOCKETS: usize = 256;

/// Size of the command channel.
pub const COMMAND_CHANNEL_SIZE: usize = 64;

/// LISTEN sockets kept per listening port.
const LISTEN_BACKLOG: usize = 4;

/// Size of the host UDP receive buffer.
const UDP_BUF_SIZE: usize = 65536;

/// Scratch buffer for reading from virtual sockets.
const RECV_BUF_SIZE: usize = 65536;

/// Requests from the [`Tunnel`](super::Tunnel) handle.
#[derive(Debug)]
pub enum Command {
    /// Open a virtual TCP connection.
    Connect {
        remote: SocketAddrV4,
        timeout: Duration,
        reply: oneshot::Sender<Result<TunnelStream>>,
    },
    /// Accept virtual TCP connections on a port.
    Listen {
        addr: Option<Ipv4Addr>,
        port: u16,
        reply: oneshot::Sender<Result<TunnelListener>>,
    },
    /// Open a connected virtual UDP socket.
    BindUdp {
        remote: SocketAddrV4,
        reply: oneshot::Sender<Result<TunnelDatagram>>,
    },
}

/// A TCP connect waiting for the virtual handshake.
struct PendingConnect {
    handle: SocketHandle,
    remote: SocketAddrV4,
    reply: oneshot::Sender<Result<TunnelStream>>,
    deadline: Instant,
}

/// An established virtual TCP connection and its stream's channels.
struct Connection {
    handle: SocketHandle,
    /// `None` once EOF has been delivered (or the stream is gone).
    inbound_tx: Option<mpsc::Sender<Bytes>>,
    outbound_rx: mpsc::Receiver<StreamMessage>,
    /// Data the socket could not take yet, sent before anything newer.
    pending_out: Option<Bytes>,
    close_requested: bool,
    fin_queued: bool,
}

impl Connection {
    fn new(handle: SocketHandle, channels: StreamChannels) -> Self {
        Connection {
            handle,
            inbound_tx: Some(channels.inbound_tx),
            outbound_rx: channels.outbound_rx,
            pending_out: None,
            close_requested: false,
            fin_queued: false,
        }
    }

    /// Move data both ways. Returns true once the connection can be reaped.
    fn service(&mut self, socket: &mut tcp::Socket<'static>, scratch: &mut [u8]) -> bool {
        self.pump_outbound(socket);
        self.pump_inbound(socket, scratch);

        self.inbound_tx.is_none()
            && matches!(socket.state(), tcp::State::Closed | tcp::State::TimeWait)
    }

    fn pump_outbound(&mut self, socket: &mut tcp::Socket<'static>) {
        loop {
            if let Some(data) = self.pending_out.take() {
                if !socket.may_send() {
                    trace!(
                        "Virtual TCP {:?}: send side closed, dropping {} bytes",
                        self.handle,
                        data.len()
                    );
                    // writers now see BrokenPipe
                    self.outbound_rx.close();
                } else {
                    match socket.send_slice(&data) {
                        Ok(n) if n < data.len() => {
                            self.pending_out = Some(data.slice(n..));
                            return;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            trace!("Virtual TCP {:?}: send failed: {:?}", self.handle, e);
                            self.outbound_rx.close();
                        }
                    }
                }
            }

            match self.outbound_rx.try_recv() {
                Ok(StreamMessage::Data(data)) => self.pending_out = Some(data),
                Ok(StreamMessage::Shutdown) => self.close_requested = true,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.close_requested = true;
                    break;
                }
            }
        }

        if self.close_requested && !self.fin_queued && self.pending_out.is_none() {
            trace!("Virtual TCP {:?}: sending FIN", self.handle);
            socket.close();
            self.fin_queued = true;
        }
    }

    fn pump_inbound(&mut self, socket: &mut tcp::Socket<'static>, scratch: &mut [u8]) {
        let Some(tx) = self.inbound_tx.clone() else {
            return;
        };

        while socket.can_recv() {
            let permit = match tx.try_reserve() {
                Ok(permit) => permit,
                // reader is behind; leave the data in the socket window
                Err(TrySendError::Full(())) => return,
                Err(TrySendError::Closed(())) => {
                    debug!(
                        "Virtual TCP {:?}: unread data after stream dropped, resetting",
                        self.handle
                    );
                    socket.abort();
                    self.inbound_tx = None;
                    return;
                }
            };
            match socket.recv_slice(scratch) {
                Ok(0) => break,
                Ok(n) => permit.send(Bytes::copy_from_slice(&scratch[..n])),
                Err(e) => {
                    trace!("Virtual TCP {:?}: recv failed: {:?}", self.handle, e);
                    break;
                }
            }
        }

        if !socket.may_recv() && !socket.can_recv() {
            trace!("Virtual TCP {:?}: peer finished sending", self.handle);
            self.inbound_tx = None;
        }
    }
}

/// A listening port and its backlog of LISTEN sockets.
struct Listener {
    addr: Option<Ipv4Addr>,
    port: u16,
    backlog: Vec<SocketHandle>,
    accept_tx: mpsc::Sender<TunnelStream>,
}

/// A connected virtual UDP socket.
struct UdpEntry {
    remote: IpEndpoint,
    channels: DatagramChannels,
}

impl UdpEntry {
    /// Move datagrams both ways. Returns true once the handle is gone.
    fn service(&mut self, socket: &mut udp::Socket<'static>, scratch: &mut [u8]) -> bool {
        let mut gone = false;

        while socket.can_send() {
            match self.channels.outbound_rx.try_recv() {
                Ok(data) => {
                    if let Err(e) = socket.send_slice(&data, self.remote) {
                        trace!("Virtual UDP to {}: send failed: {:?}", self.remote, e);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    gone = true;
                    break;
                }
            }
        }

        while socket.can_recv() {
            let (n, meta) = match socket.recv_slice(scratch) {
                Ok(received) => received,
                Err(e) => {
                    trace!("Virtual UDP from {}: recv failed: {:?}", self.remote, e);
                    break;
                }
            };
            if meta.endpoint != self.remote {
                trace!("Virtual UDP: ignoring datagram from {}", meta.endpoint);
                continue;
            }
            match self
                .channels
                .inbound_tx
                .try_send(Bytes::copy_from_slice(&scratch[..n]))
            {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    trace!("Virtual UDP from {}: reader behind, dropping", self.remote)
                }
                Err(TrySendError::Closed(_)) => gone = true,
            }
        }

        gone || self.channels.inbound_tx.is_closed()
    }
}

/// State owned by the event loop task.
pub struct EventLoop {
    udp: UdpSocket,
    peer: SocketAddr,
    session: NoiseSession,
    stack: VirtualStack,
    commands: mpsc::Receiver<Command>,
    wake: Arc<Notify>,
    pending: Vec<PendingConnect>,
    conns: HashMap<SocketHandle, Connection>,
    listeners: Vec<Listener>,
    datagrams: HashMap<SocketHandle, UdpEntry>,
    handshake_logged: bool,
}

impl EventLoop {
    /// Assemble the loop; the handshake initiation should already be out.
    pub fn new(
        udp: UdpSocket,
        peer: SocketAddr,
        session: NoiseSession,
        stack: VirtualStack,
        commands: mpsc::Receiver<Command>,
        wake: Arc<Notify>,
    ) -> Self {
        EventLoop {
            udp,
            peer,
            session,
            stack,
            commands,
            wake,
            pending: Vec::new(),
            conns: HashMap::new(),
            listeners: Vec::new(),
            datagrams: HashMap::new(),
            handshake_logged: false,
        }
    }

    /// Run until the [`Tunnel`](super::Tunnel) handle is dropped.
    pub async fn run(mut self) {
        let mut udp_buf = vec![0u8; UDP_BUF_SIZE];
        let mut scratch = vec![0u8; RECV_BUF_SIZE];
        let tick = Duration::from_millis(TIMER_TICK_MS);
        let mut timer = time::interval(tick);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let wake = self.wake.clone();

        info!("Tunnel event loop started (peer {})", self.peer);

        loop {
            let delay = self.stack.poll_delay().unwrap_or(tick).min(tick);

            tokio::select! {
                result = self.udp.recv_from(&mut udp_buf) => {
                    match result {
                        Ok((n, _src)) => self.handle_datagram(&udp_buf[..n]).await,
                        Err(e) => warn!("UDP recv error: {}", e),
                    }
                }

                _ = timer.tick() => {
                    if let Some(pkt) = self.session.update_timers() {
                        self.send_to_peer(&pkt).await;
                    }
                }

                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            info!("Tunnel handle dropped, event loop exiting");
                            return;
                        }
                    }
                }

                _ = wake.notified() => {}

                _ = time::sleep(delay) => {}
            }

            self.pump(&mut scratch).await;
        }
    }

    /// Feed one encrypted datagram from the peer through the session.
    async fn handle_datagram(&mut self, data: &[u8]) {
        let out = self.session.decapsulate(data);
        for pkt in &out.to_network {
            self.send_to_peer(pkt).await;
        }
        for pkt in out.to_stack {
            self.stack.inject_packet(pkt);
        }

        if !self.handshake_logged && self.session.time_since_last_handshake().is_some() {
            self.handshake_logged = true;
            info!("WireGuard handshake established with {}", self.peer);
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                remote,
                timeout,
                reply,
            } => match self.start_connect(remote) {
                Ok(handle) => self.pending.push(PendingConnect {
                    handle,
                    remote,
                    reply,
                    deadline: Instant::now() + timeout,
                }),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Listen { addr, port, reply } => {
                let _ = reply.send(self.start_listen(addr, port));
            }
            Command::BindUdp { remote, reply } => {
                let _ = reply.send(self.start_udp(remote));
            }
        }
    }

    fn check_capacity(&self) -> Result<()> {
        if self.stack.socket_count() >= MAX_SOCKETS {
            bail!("Maximum concurrent tunnel sockets ({}) exceeded", MAX_SOCKETS);
        }
        Ok(())
    }

    fn start_connect(&mut self, remote: SocketAddrV4) -> Result<SocketHandle> {
        self.check_capacity()?;
        self.stack.connect_tcp(remote)
    }

    fn start_listen(&mut self, addr: Option<Ipv4Addr>, port: u16) -> Result<TunnelListener> {
        if self.listeners.iter().any(|l| l.port == port) {
            bail!("Port {} is already being listened on inside the tunnel", port);
        }
        self.check_capacity()?;

        let mut backlog = Vec::with_capacity(LISTEN_BACKLOG);
        backlog.push(self.stack.listen_tcp(addr, port)?);

        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);
        let mut listener = Listener {
            addr,
            port,
            backlog,
            accept_tx,
        };
        refill_backlog(&mut self.stack, &mut listener);

        let local = SocketAddr::from((addr.unwrap_or(Ipv4Addr::UNSPECIFIED), port));
        info!("Listening on tunnel {}", local);
        self.listeners.push(listener);
        Ok(TunnelListener::new(accept_rx, self.wake.clone(), local))
    }

    fn start_udp(&mut self, remote: SocketAddrV4) -> Result<TunnelDatagram> {
        self.check_capacity()?;
        let handle = self.stack.bind_udp()?;

        let (datagram, channels) =
            TunnelDatagram::new_pair(SocketAddr::V4(remote), self.wake.clone());
        self.datagrams.insert(
            handle,
            UdpEntry {
                remote: IpEndpoint::new(IpAddress::Ipv4(*remote.ip()), remote.port()),
                channels,
            },
        );
        Ok(datagram)
    }

    /// Poll, service every socket, poll again and ship the output.
    async fn pump(&mut self, scratch: &mut [u8]) {
        self.stack.poll();
        self.check_pending_connects();
        self.check_listeners();
        self.service_connections(scratch);
        self.service_datagrams(scratch);
        self.stack.poll();

        for pkt in self.stack.drain_tx_packets() {
            if let Some(sealed) = self.session.encapsulate(&pkt) {
                self.send_to_peer(&sealed).await;
            }
        }
    }

    fn check_pending_connects(&mut self) {
        let now = Instant::now();
        let mut i = 0;

        while i < self.pending.len() {
            let pending = &self.pending[i];
            let socket = self.stack.tcp(pending.handle);

            let outcome = if socket.may_send() {
                Ok(())
            } else if socket.state() == tcp::State::Closed {
                Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("connection to {} refused inside the tunnel", pending.remote),
                ))
            } else if now >= pending.deadline {
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connection to {} timed out inside the tunnel", pending.remote),
                ))
            } else if pending.reply.is_closed() {
                Err(io::Error::new(io::ErrorKind::Other, "connect caller went away"))
            } else {
                i += 1;
                continue;
            };

            let pending = self.pending.swap_remove(i);
            match outcome {
                Ok(()) => {
                    let (stream, channels) =
                        TunnelStream::new_pair(SocketAddr::V4(pending.remote), self.wake.clone());
                    debug!(
                        "Virtual TCP connected to {} (handle={:?})",
                        pending.remote, pending.handle
                    );
                    // if the caller is gone the dropped stream closes the socket
                    let _ = pending.reply.send(Ok(stream));
                    self.conns
                        .insert(pending.handle, Connection::new(pending.handle, channels));
                }
                Err(e) => {
                    debug!("Virtual TCP connect to {} failed: {}", pending.remote, e);
                    self.stack.tcp(pending.handle).abort();
                    self.stack.remove(pending.handle);
                    let _ = pending.reply.send(Err(anyhow::Error::new(e)));
                }
            }
        }
    }

    fn check_listeners(&mut self) {
        let mut i = 0;

        while i < self.listeners.len() {
            if self.listeners[i].accept_tx.is_closed() {
                let listener = self.listeners.swap_remove(i);
                for handle in listener.backlog {
                    self.stack.tcp(handle).abort();
                    self.stack.remove(handle);
                }
                info!("Stopped listening on tunnel port {}", listener.port);
                continue;
            }

            let listener = &mut self.listeners[i];
            for slot in (0..listener.backlog.len()).rev() {
                let handle = listener.backlog[slot];
                let socket = self.stack.tcp(handle);

                match socket.state() {
                    tcp::State::Listen | tcp::State::SynReceived => continue,
                    tcp::State::Closed => {
                        self.stack.remove(handle);
                        listener.backlog.swap_remove(slot);
                        continue;
                    }
                    _ => {}
                }

                let permit = match listener.accept_tx.try_reserve() {
                    Ok(permit) => permit,
                    // accept queue full, try again next pass
                    Err(_) => break,
                };
                let peer = match socket.remote_endpoint() {
                    Some(endpoint) => endpoint_to_socket_addr(endpoint),
                    None => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
                };

                let (stream, channels) = TunnelStream::new_pair(peer, self.wake.clone());
                permit.send(stream);
                self.conns.insert(handle, Connection::new(handle, channels));
                listener.backlog.swap_remove(slot);
                debug!(
                    "Virtual TCP accepted {} on port {} (handle={:?})",
                    peer, listener.port, handle
                );
            }

            refill_backlog(&mut self.stack, listener);
            i += 1;
        }
    }

    fn service_connections(&mut self, scratch: &mut [u8]) {
        let mut done = Vec::new();
        for (handle, conn) in self.conns.iter_mut() {
            if conn.service(self.stack.tcp(*handle), scratch) {
                done.push(*handle);
            }
        }
        for handle in done {
            self.conns.remove(&handle);
            self.stack.remove(handle);
            debug!("Virtual TCP {:?} closed", handle);
        }
    }

    fn service_datagrams(&mut self, scratch: &mut [u8]) {
        let mut done = Vec::new();
        for (handle, entry) in self.datagrams.iter_mut() {
            if entry.service(self.stack.udp(*handle), scratch) {
                done.push(*handle);
            }
        }
        for handle in done {
            self.datagrams.remove(&handle);
            self.stack.remove(handle);
            debug!("Virtual UDP {:?} closed", handle);
        }
    }

    async fn send_to_peer(&self, data: &[u8]) {
        if let Err(e) = self.udp.send_to(data, self.peer).await {
            warn!("UDP send to {} failed: {}", self.peer, e);
        }
    }
}

/// Top a listener's backlog back up to [`LISTEN_BACKLOG`] sockets.
fn refill_backlog(stack: &mut VirtualStack, listener: &mut Listener) {
    while listener.backlog.len() < LISTEN_BACKLOG && stack.socket_count() < MAX_SOCKETS {
        match stack.listen_tcp(listener.addr, listener.port) {
            Ok(handle) => listener.backlog.push(handle),
            Err(e) => {
                warn!("Failed to re-arm tunnel port {}: {:#}", listener.port, e);
                break;
            }
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("peer", &self.peer)
            .field("pending", &self.pending.len())
            .field("conns", &self.conns.len())
            .field("listeners", &self.listeners.len())
            .field("datagrams", &self.datagrams.len())
            .finish()
    }
}

/// Error for a request the loop never answered.
pub fn loop_gone() -> anyhow::Error {
    anyhow::Error::new(WgProxyError::Tunnel(
        "event loop is not running".to_string()
    ))
}
