//! Virtual TCP/IP stack built on smoltcp.
//!
//! [`VirtualStack`] owns a smoltcp [`Interface`], its [`SocketSet`] and the
//! [`QueueDevice`] feeding it. It only knows about sockets and packets; the
//! event loop decides what flows where.

use super::device::QueueDevice;
use anyhow::{anyhow, bail, Result};
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::{tcp, udp};
use smoltcp::time::Instant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tracing::{debug, trace};

/// TCP socket receive buffer size.
const TCP_RX_BUF_SIZE: usize = 65536;

/// TCP socket transmit buffer size.
const TCP_TX_BUF_SIZE: usize = 65536;

/// UDP socket payload buffer size (each direction).
const UDP_BUF_SIZE: usize = 65536;

/// Datagrams a UDP socket can hold per direction.
const UDP_PACKET_SLOTS: usize = 32;

/// Starting ephemeral port for virtual sockets.
const EPHEMERAL_PORT_START: u16 = 49152;

/// Upper bound for ephemeral ports.
const EPHEMERAL_PORT_END: u16 = 65535;

/// Virtual TCP/IP stack managing smoltcp internals.
pub struct VirtualStack {
    iface: Interface,
    sockets: SocketSet<'static>,
    device: QueueDevice,
    address: Ipv4Addr,
    next_port: u16,
}

impl VirtualStack {
    /// Create a stack owning `address/prefix_len`, routing everything else
    /// into the tunnel.
    pub fn new(address: Ipv4Addr, prefix_len: u8, mtu: usize) -> Result<Self> {
        let mut device = QueueDevice::new(mtu);

        let config = Config::new(HardwareAddress::Ip);
        let mut iface = Interface::new(config, &mut device, Instant::now());

        let cidr = IpCidr::new(IpAddress::Ipv4(address), prefix_len);
        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(cidr);
        });
        // Everything outside our own subnet still goes to the peer.
        iface
            .routes_mut()
            .add_default_ipv4_route(address)
            .map_err(|_| anyhow!("smoltcp route table full"))?;

        debug!("Virtual stack created: ip={}/{}, mtu={}", address, prefix_len, mtu);

        Ok(Self {
            iface,
            sockets: SocketSet::new(Vec::new()),
            device,
            address,
            next_port: EPHEMERAL_PORT_START,
        })
    }

    /// Number of sockets currently in the set.
    pub fn socket_count(&self) -> usize {
        self.sockets.iter().count()
    }

    /// Create a TCP socket and start connecting to `remote`.
    pub fn connect_tcp(&mut self, remote: SocketAddrV4) -> Result<SocketHandle> {
        let local_port = self.allocate_port();
        let mut socket = new_tcp_socket();

        socket
            .connect(
                self.iface.context(),
                (IpAddress::Ipv4(*remote.ip()), remote.port()),
                IpListenEndpoint {
                    addr: Some(IpAddress::Ipv4(self.address)),
                    port: local_port,
                },
            )
            .map_err(|e| anyhow!("smoltcp connect to {} failed: {:?}", remote, e))?;

        let handle = self.sockets.add(socket);
        debug!(
            "Virtual TCP: connecting :{} -> {} (handle={:?})",
            local_port, remote, handle
        );
        Ok(handle)
    }

    /// Create a TCP socket in LISTEN state.
    ///
    /// `addr = None` accepts on any destination address.
    pub fn listen_tcp(&mut self, addr: Option<Ipv4Addr>, port: u16) -> Result<SocketHandle> {
        if port == 0 {
            bail!("cannot listen on port 0 inside the tunnel");
        }
        let mut socket = new_tcp_socket();
        socket
            .listen(IpListenEndpoint {
                addr: addr.map(IpAddress::Ipv4),
                port,
            })
            .map_err(|e| anyhow!("smoltcp listen on port {} failed: {:?}", port, e))?;

        let handle = self.sockets.add(socket);
        trace!("Virtual TCP: listening on :{} (handle={:?})", port, handle);
        Ok(handle)
    }

    /// Create a UDP socket bound to a fresh ephemeral port.
    pub fn bind_udp(&mut self) -> Result<SocketHandle> {
        let local_port = self.allocate_port();
        let rx = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; UDP_PACKET_SLOTS],
            vec![0u8; UDP_BUF_SIZE],
        );
        let tx = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; UDP_PACKET_SLOTS],
            vec![0u8; UDP_BUF_SIZE],
        );
        let mut socket = udp::Socket::new(rx, tx);
        socket
            .bind(IpListenEndpoint {
                addr: Some(IpAddress::Ipv4(self.address)),
                port: local_port,
            })
            .map_err(|e| anyhow!("smoltcp UDP bind on port {} failed: {:?}", local_port, e))?;

        let handle = self.sockets.add(socket);
        debug!("Virtual UDP: bound :{} (handle={:?})", local_port, handle);
        Ok(handle)
    }

    /// Borrow a TCP socket.
    pub fn tcp(&mut self, handle: SocketHandle) -> &mut tcp::Socket<'static> {
        self.sockets.get_mut::<tcp::Socket<'static>>(handle)
    }

    /// Borrow a UDP socket.
    pub fn udp(&mut self, handle: SocketHandle) -> &mut udp::Socket<'static> {
        self.sockets.get_mut::<udp::Socket<'static>>(handle)
    }

    /// Drop a socket from the set.
    pub fn remove(&mut self, handle: SocketHandle) {
        self.sockets.remove(handle);
    }

    /// Process packets between device and sockets.
    pub fn poll(&mut self) {
        let _ = self
            .iface
            .poll(Instant::now(), &mut self.device, &mut self.sockets);
    }

    /// How long until the stack next needs a poll (retransmits, delayed ACKs).
    pub fn poll_delay(&mut self) -> Option<Duration> {
        self.iface
            .poll_delay(Instant::now(), &self.sockets)
            .map(|d| Duration::from_micros(d.total_micros()))
    }

    /// Queue a decrypted IP packet for the next poll.
    pub fn inject_packet(&mut self, packet: Vec<u8>) {
        self.device.push_rx(packet);
    }

    /// Take all outbound IP packets produced by the last poll.
    pub fn drain_tx_packets(&mut self) -> Vec<Vec<u8>> {
        self.device.take_tx()
    }

    /// Allocate the next ephemeral port, wrapping around when exhausted.
    fn allocate_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if self.next_port == EPHEMERAL_PORT_END {
            EPHEMERAL_PORT_START
        } else {
            self.next_port + 1
        };
        port
    }
}

fn new_tcp_socket() -> tcp::Socket<'static> {
    let rx = tcp::SocketBuffer::new(vec![0u8; TCP_RX_BUF_SIZE]);
    let tx = tcp::SocketBuffer::new(vec![0u8; TCP_TX_BUF_SIZE]);
    let mut socket = tcp::Socket::new(rx, tx);
    socket.set_nagle_enabled(false);
    socket
}

/// Convert a smoltcp endpoint to a std socket address.
pub fn endpoint_to_socket_addr(endpoint: IpEndpoint) -> SocketAddr {
    match endpoint.addr {
        IpAddress::Ipv4(ip) => SocketAddr::from((ip, endpoint.port)),
        IpAddress::Ipv6(ip) => SocketAddr::from((ip, endpoint.port)),
    }
}

impl std::fmt::Debug for VirtualStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualStack")
            .field("address", &self.address)
            .field("next_port", &self.next_port)
            .field("device", &self.device)
            .finish()
    }
}
