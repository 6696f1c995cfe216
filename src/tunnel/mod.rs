//! Userspace WireGuard tunnel.
//!
//! [`Tunnel`] runs a WireGuard session (`boringtun`) and a virtual TCP/IP
//! stack (`smoltcp`) inside one background task, and hands out sockets
//! living on the tunnel's address:
//!
//! - [`Tunnel::connect`] → [`TunnelStream`]
//! - [`Tunnel::listen`] → [`TunnelListener`]
//! - [`Tunnel::bind_udp`] → [`TunnelDatagram`]
//!
//! No TUN device is created and no privileges are needed.
//!
//! ```text
//! app ──bytes──► smoltcp ──IP pkts──► boringtun ──UDP──► WireGuard peer
//! ```

pub mod config;
mod datagram;
mod device;
mod event_loop;
mod listener;
mod noise;
mod stack;
mod stream;
mod wg_quick;

pub use config::TunnelConfig;
pub use datagram::TunnelDatagram;
pub use listener::TunnelListener;
pub use stream::TunnelStream;

use crate::error::WgProxyError;
use crate::helper::{default_connect_timeout, split_host_port};
use anyhow::{Context, Result};
use event_loop::{loop_gone, Command, EventLoop, COMMAND_CHANNEL_SIZE};
use noise::NoiseSession;
use stack::VirtualStack;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Handle to a running tunnel.
///
/// Dropping it stops the event loop, which closes every socket.
#[derive(Debug)]
pub struct Tunnel {
    commands: mpsc::Sender<Command>,
    address: Ipv4Addr,
    connect_timeout: Duration,
    task: JoinHandle<()>,
}

impl Tunnel {
    /// Validate `config`, bind the host UDP socket, send the first handshake
    /// initiation and spawn the event loop.
    pub async fn start(config: &TunnelConfig) -> Result<Self> {
        config
            .validate()
            .context("WireGuard configuration validation failed")?;

        let mut session = NoiseSession::new(config).context("Failed to create WireGuard session")?;
        let peer = config
            .resolve_endpoint()
            .context("Failed to resolve WireGuard peer endpoint")?;

        let (address, prefix_len) = config.parse_address()?;
        let stack = VirtualStack::new(address, prefix_len, config.interface.mtu)
            .context("Failed to create virtual TCP/IP stack")?;

        let bind: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
        };
        let udp = UdpSocket::bind(bind)
            .await
            .context("Failed to bind WireGuard UDP socket")?;
        info!(
            "WireGuard UDP socket bound on {} -> peer {}",
            udp.local_addr()?,
            peer
        );

        if let Some(init) = session.handshake_initiation() {
            udp.send_to(&init, peer)
                .await
                .context("Failed to send initial WireGuard handshake")?;
            debug!("Sent initial WireGuard handshake to {}", peer);
        }

        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let wake = Arc::new(Notify::new());
        let event_loop = EventLoop::new(udp, peer, session, stack, command_rx, wake);
        let task = tokio::spawn(event_loop.run());

        info!("Tunnel up, local address {}", address);
        Ok(Tunnel {
            commands,
            address,
            connect_timeout: default_connect_timeout(),
            task,
        })
    }

    /// The tunnel's own IPv4 address.
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// Whether the event loop is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Set how long [`Tunnel::connect`] waits for the virtual handshake.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Open a virtual TCP connection to `addr`.
    ///
    /// Resolves once the three-way handshake inside the tunnel completes.
    pub async fn connect(&self, addr: SocketAddr) -> Result<TunnelStream> {
        let remote = ipv4_only(addr)?;
        let timeout = self.connect_timeout;

        let stream = self
            .request(|reply| Command::Connect {
                remote,
                timeout,
                reply,
            })
            .await
            .with_context(|| format!("Tunnel connection to {} failed", addr))?;
        Ok(stream)
    }

    /// Listen on `listen` (`host:port`) inside the tunnel.
    ///
    /// The host must be empty, `0.0.0.0` or the tunnel's own address.
    pub async fn listen(&self, listen: &str) -> Result<TunnelListener> {
        let (host, port) = split_host_port(listen)?;
        let addr = match host {
            "" | "0.0.0.0" => None,
            host => {
                let ip: Ipv4Addr = host.parse().map_err(|_| {
                    WgProxyError::Config(format!("invalid tunnel listen address: {}", listen))
                })?;
                if ip != self.address {
                    return Err(WgProxyError::Config(format!(
                        "cannot listen on {}: tunnel address is {}",
                        ip, self.address
                    ))
                    .into());
                }
                Some(ip)
            }
        };

        self.request(|reply| Command::Listen { addr, port, reply })
            .await
            .with_context(|| format!("Failed to listen on tunnel {}", listen))
    }

    /// Open a virtual UDP socket connected to `addr`.
    pub async fn bind_udp(&self, addr: SocketAddr) -> Result<TunnelDatagram> {
        let remote = ipv4_only(addr)?;
        self.request(|reply| Command::BindUdp { remote, reply })
            .await
            .with_context(|| format!("Failed to open tunnel UDP socket to {}", addr))
    }

    /// Send a command and wait for its reply.
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| loop_gone())?;
        response.await.map_err(|_| loop_gone())?
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn ipv4_only(addr: SocketAddr) -> Result<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Ok(v4),
        SocketAddr::V6(_) => Err(WgProxyError::UnsupportedNetwork(format!(
            "IPv6 is not supported inside the tunnel: {}",
            addr
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::tests::test_config;

    #[test]
    fn test_ipv4_only() {
        assert!(ipv4_only("10.0.0.1:80".parse().unwrap()).is_ok());
        let err = ipv4_only("[fd00::1]:80".parse().unwrap()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WgProxyError>(),
            Some(WgProxyError::UnsupportedNetwork(_))
        ));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut cfg = test_config();
        cfg.interface.private_key = "short".to_string();
        assert!(Tunnel::start(&cfg).await.is_err());
    }

    #[tokio::test]
    async fn test_start_and_open_sockets() {
        // Nobody answers on the peer port; local operations still work.
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut cfg = test_config();
        cfg.peer.endpoint = peer.local_addr().unwrap().to_string();

        let tunnel = Tunnel::start(&cfg).await.unwrap();
        assert!(tunnel.is_running());
        assert_eq!(tunnel.address(), Ipv4Addr::new(10, 0, 0, 2));

        // handshake initiation arrives at the peer
        let mut buf = [0u8; 256];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 148);
        assert_eq!(buf[0], 1);

        let listener = tunnel.listen("0.0.0.0:8080").await.unwrap();
        assert_eq!(listener.local_addr().port(), 8080);
        assert!(tunnel.listen(":8080").await.is_err(), "port already taken");
        assert!(tunnel.listen("10.9.9.9:9090").await.is_err());
        assert!(tunnel.listen("10.0.0.2:9090").await.is_ok());

        let datagram = tunnel.bind_udp("10.0.0.53:53".parse().unwrap()).await.unwrap();
        assert_eq!(datagram.remote_addr().port(), 53);

        assert!(tunnel.bind_udp("[fd00::1]:53".parse().unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_times_out_without_peer() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut cfg = test_config();
        cfg.peer.endpoint = peer.local_addr().unwrap().to_string();

        let tunnel = Tunnel::start(&cfg)
            .await
            .unwrap()
            .with_connect_timeout(Duration::from_millis(300));
        let err = tunnel
            .connect("10.0.0.1:80".parse().unwrap())
            .await
            .unwrap_err();
        let io_err = err
            .chain()
            .find_map(|c| c.downcast_ref::<std::io::Error>())
            .unwrap();
        assert_eq!(io_err.kind(), std::io::ErrorKind::TimedOut);
    }
}
