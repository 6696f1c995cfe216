//! WireGuard session wrapper around `boringtun::noise::Tunn`.
//!
//! [`NoiseSession`] hides boringtun's borrow-the-output-buffer API behind
//! owned packets so the event loop can hold them across `.await`s.

use super::config::TunnelConfig;
use anyhow::{Context, Result};
use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use tracing::{debug, trace, warn};

/// Overhead added by WireGuard encapsulation (header + auth tag).
const WG_OVERHEAD: usize = 80;

/// Minimum size for an output buffer (handshake initiation is 148 bytes).
const MIN_BUF: usize = 148;

/// Size of the reusable output buffer.
const BUF_SIZE: usize = 65536 + WG_OVERHEAD;

/// Output of feeding one datagram from the peer into the session.
#[derive(Debug, Default)]
pub struct Decapsulated {
    /// Packets to send back to the peer (handshake responses, queued data).
    pub to_network: Vec<Vec<u8>>,
    /// Decrypted IP packets for the virtual stack.
    pub to_stack: Vec<Vec<u8>>,
}

/// One WireGuard session with one peer.
pub struct NoiseSession {
    tunn: Box<Tunn>,
    buf: Vec<u8>,
}

impl NoiseSession {
    /// Create a session from the tunnel configuration.
    pub fn new(config: &TunnelConfig) -> Result<Self> {
        let private_key = config.private_key().context("Invalid private key")?;
        let peer_public = config.peer_public_key().context("Invalid peer public key")?;
        let preshared_key = config.preshared_key().context("Invalid preshared key")?;
        let keepalive = config.keepalive_interval();

        let tunn = Tunn::new(
            StaticSecret::from(private_key),
            PublicKey::from(peer_public),
            preshared_key,
            keepalive,
            0,
            None,
        )
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to create WireGuard session")?;

        debug!("WireGuard session created (keepalive={:?})", keepalive);

        Ok(Self {
            tunn: Box::new(tunn),
            buf: vec![0u8; BUF_SIZE],
        })
    }

    /// Encrypt one IP packet from the stack.
    ///
    /// Returns the datagram to send, which is a handshake initiation when no
    /// session is up yet (boringtun queues the packet until it is).
    pub fn encapsulate(&mut self, packet: &[u8]) -> Option<Vec<u8>> {
        let needed = std::cmp::max(packet.len() + WG_OVERHEAD, MIN_BUF);
        if self.buf.len() < needed {
            self.buf.resize(needed, 0);
        }

        match self.tunn.encapsulate(packet, &mut self.buf) {
            TunnResult::WriteToNetwork(data) => {
                trace!("encapsulate: {} -> {} bytes", packet.len(), data.len());
                Some(data.to_vec())
            }
            TunnResult::Done => None,
            TunnResult::Err(e) => {
                warn!("encapsulate error: {:?}", e);
                None
            }
            _ => None,
        }
    }

    /// Decrypt one datagram from the peer.
    ///
    /// When boringtun answers with a network packet it may have more queued
    /// behind it, so keep draining with an empty input until it is done.
    pub fn decapsulate(&mut self, datagram: &[u8]) -> Decapsulated {
        let mut out = Decapsulated::default();
        let mut input: &[u8] = datagram;

        loop {
            match self.tunn.decapsulate(None, input, &mut self.buf) {
                TunnResult::WriteToTunnelV4(data, _) | TunnResult::WriteToTunnelV6(data, _) => {
                    trace!("decapsulate: IP packet ({} bytes)", data.len());
                    out.to_stack.push(data.to_vec());
                    break;
                }
                TunnResult::WriteToNetwork(data) => {
                    trace!("decapsulate: send-to-network ({} bytes)", data.len());
                    out.to_network.push(data.to_vec());
                    input = &[];
                }
                TunnResult::Done => break,
                TunnResult::Err(e) => {
                    debug!("decapsulate error: {:?}", e);
                    break;
                }
            }
        }

        out
    }

    /// Tick the internal timers (keepalive, rekey, handshake retry).
    ///
    /// Call every ~250 ms.
    pub fn update_timers(&mut self) -> Option<Vec<u8>> {
        match self.tunn.update_timers(&mut self.buf) {
            TunnResult::WriteToNetwork(data) => {
                trace!("timer: send packet ({} bytes)", data.len());
                Some(data.to_vec())
            }
            TunnResult::Err(e) => {
                trace!("timer error: {:?}", e);
                None
            }
            _ => None,
        }
    }

    /// Build a handshake initiation right away.
    pub fn handshake_initiation(&mut self) -> Option<Vec<u8>> {
        match self.tunn.format_handshake_initiation(&mut self.buf, false) {
            TunnResult::WriteToNetwork(data) => {
                debug!("Handshake initiation ({} bytes)", data.len());
                Some(data.to_vec())
            }
            TunnResult::Err(e) => {
                warn!("handshake initiation error: {:?}", e);
                None
            }
            _ => None,
        }
    }

    /// Seconds since the last completed handshake, if any.
    pub fn time_since_last_handshake(&self) -> Option<std::time::Duration> {
        self.tunn.time_since_last_handshake()
    }
}

impl std::fmt::Debug for NoiseSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseSession")
            .field("buf_size", &self.buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::config::tests::test_config;

    /// Minimal IPv4 header, 10.0.0.2 -> 10.0.0.1.
    const IP_PACKET: [u8; 20] = [
        0x45, 0x00, 0x00, 0x14, 0x00, 0x00, 0x00, 0x00, 0x40, 0x06, 0x00, 0x00, 0x0a, 0x00,
        0x00, 0x02, 0x0a, 0x00, 0x00, 0x01,
    ];

    #[test]
    fn test_create_session() {
        assert!(NoiseSession::new(&test_config()).is_ok());
    }

    #[test]
    fn test_create_session_with_psk() {
        let mut cfg = test_config();
        cfg.peer.preshared_key = Some(crate::tunnel::config::tests::key(0xAB));
        assert!(NoiseSession::new(&cfg).is_ok());
    }

    #[test]
    fn test_encapsulate_without_session_starts_handshake() {
        let mut session = NoiseSession::new(&test_config()).unwrap();
        if let Some(pkt) = session.encapsulate(&IP_PACKET) {
            // Type 1 = handshake initiation
            assert_eq!(pkt[0], 1);
        }
    }

    #[test]
    fn test_decapsulate_garbage() {
        let mut session = NoiseSession::new(&test_config()).unwrap();
        let out = session.decapsulate(&[0xFF; 100]);
        assert!(out.to_stack.is_empty());
    }

    #[test]
    fn test_update_timers_does_not_panic() {
        let mut session = NoiseSession::new(&test_config()).unwrap();
        let _ = session.update_timers();
    }

    #[test]
    fn test_handshake_initiation() {
        let mut session = NoiseSession::new(&test_config()).unwrap();
        let pkt = session.handshake_initiation().unwrap();
        assert_eq!(pkt.len(), 148);
        assert_eq!(pkt[0], 1);
        assert!(session.time_since_last_handshake().is_none());
    }

    #[test]
    fn test_two_sessions_complete_handshake() {
        let client_cfg = test_config();
        let mut server_cfg = test_config();
        server_cfg.interface.private_key = crate::tunnel::config::tests::key(2);
        let client_public = {
            let secret = StaticSecret::from([1u8; 32]);
            PublicKey::from(&secret).to_bytes()
        };
        server_cfg.peer.public_key = {
            use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
            BASE64.encode(client_public)
        };

        let mut client = NoiseSession::new(&client_cfg).unwrap();
        let mut server = NoiseSession::new(&server_cfg).unwrap();

        let init = client.handshake_initiation().unwrap();
        let response = server.decapsulate(&init);
        assert_eq!(response.to_network.len(), 1);

        let done = client.decapsulate(&response.to_network[0]);
        assert!(done.to_stack.is_empty());
        assert!(client.time_since_last_handshake().is_some());

        let sealed = client.encapsulate(&IP_PACKET).unwrap();
        let opened = server.decapsulate(&sealed);
        assert_eq!(opened.to_stack, vec![IP_PACKET.to_vec()]);
    }
}
