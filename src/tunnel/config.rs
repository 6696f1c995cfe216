//! WireGuard tunnel configuration.
//!
//! Defines [`TunnelConfig`], read from the file passed with `--config`:
//!
//! ```toml
//! [interface]
//! private_key = "..."
//! address = "10.0.0.2/32"
//!
//! [peer]
//! public_key = "..."
//! endpoint = "vpn.example.com:51820"
//! allowed_ips = ["0.0.0.0/0"]
//! ```
//!
//! wg-quick key names (`PrivateKey`, `PublicKey`, ...) are accepted as
//! aliases. Plain wg-quick profiles are read by [`TunnelConfig::from_wg_quick`].

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};

/// Default inner MTU for WireGuard tunnels.
pub const DEFAULT_MTU: usize = 1420;

/// Default persistent keepalive interval in seconds.
pub(super) fn default_keepalive() -> u16 {
    25
}

fn default_mtu() -> usize {
    DEFAULT_MTU
}

/// Default allowed IPs: everything.
pub(super) fn default_allowed_ips() -> Vec<String> {
    vec!["0.0.0.0/0".to_string()]
}

/// Complete tunnel configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TunnelConfig {
    /// Local side of the tunnel
    #[serde(alias = "Interface")]
    pub interface: InterfaceConfig,
    /// The single remote peer
    #[serde(alias = "Peer")]
    pub peer: PeerConfig,
}

/// `[interface]` section
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InterfaceConfig {
    /// Local WireGuard private key (base64-encoded, 32 bytes decoded).
    #[serde(alias = "PrivateKey")]
    pub private_key: String,

    /// Virtual IPv4 address in CIDR notation (`10.0.0.2/32`).
    #[serde(alias = "Address")]
    pub address: String,

    /// Inner MTU of the virtual interface.
    #[serde(default = "default_mtu", alias = "MTU")]
    pub mtu: usize,
}

/// `[peer]` section
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PeerConfig {
    /// Peer public key (base64-encoded, 32 bytes decoded).
    #[serde(alias = "PublicKey")]
    pub public_key: String,

    /// Optional preshared key (base64-encoded, 32 bytes decoded).
    #[serde(default, alias = "PresharedKey")]
    pub preshared_key: Option<String>,

    /// Real network endpoint of the peer (`host:port`, UDP).
    #[serde(alias = "Endpoint")]
    pub endpoint: String,

    /// Persistent keepalive in seconds (0 = disabled, default: 25).
    #[serde(default = "default_keepalive", alias = "PersistentKeepalive")]
    pub persistent_keepalive: u16,

    /// Allowed IP ranges in CIDR notation.
    #[serde(default = "default_allowed_ips", alias = "AllowedIPs")]
    pub allowed_ips: Vec<String>,
}

impl TunnelConfig {
    /// Parse a TOML tunnel file.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse WireGuard TOML configuration")
    }

    /// Parse a wg-quick profile (`[Interface]`/`[Peer]` INI).
    pub fn from_wg_quick(content: &str) -> Result<Self> {
        super::wg_quick::parse(content).context("Failed to parse wg-quick configuration")
    }

    /// Validate the configuration, returning an error with a descriptive
    /// message if any field is invalid.
    pub fn validate(&self) -> Result<()> {
        Self::decode_key(&self.interface.private_key, "private_key")?;
        Self::decode_key(&self.peer.public_key, "public_key")?;
        if let Some(ref psk) = self.peer.preshared_key {
            Self::decode_key(psk, "preshared_key")?;
        }

        self.parse_address().context("Invalid address")?;

        if !(576..=65535).contains(&self.interface.mtu) {
            bail!("mtu must be between 576 and 65535, got {}", self.interface.mtu);
        }

        for cidr in &self.peer.allowed_ips {
            validate_cidr(cidr)?;
        }

        if self.peer.endpoint.rsplit_once(':').is_none() {
            bail!("endpoint must be host:port, got {}", self.peer.endpoint);
        }

        Ok(())
    }

    /// Decode and validate a base64 WireGuard key (must be 32 bytes).
    fn decode_key(key_b64: &str, field_name: &str) -> Result<[u8; 32]> {
        if key_b64.is_empty() {
            bail!("{field_name} must not be empty");
        }
        let decoded = BASE64
            .decode(key_b64.trim())
            .with_context(|| format!("{field_name} is not valid base64"))?;
        let key: [u8; 32] = decoded.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "{field_name} must decode to exactly 32 bytes, got {}",
                decoded.len()
            )
        })?;
        Ok(key)
    }

    /// Decode the private key to raw 32-byte form.
    pub fn private_key(&self) -> Result<[u8; 32]> {
        Self::decode_key(&self.interface.private_key, "private_key")
    }

    /// Decode the peer public key to raw 32-byte form.
    pub fn peer_public_key(&self) -> Result<[u8; 32]> {
        Self::decode_key(&self.peer.public_key, "public_key")
    }

    /// Decode the optional preshared key to raw 32-byte form.
    pub fn preshared_key(&self) -> Result<Option<[u8; 32]>> {
        match &self.peer.preshared_key {
            Some(psk) => Ok(Some(Self::decode_key(psk, "preshared_key")?)),
            None => Ok(None),
        }
    }

    /// Resolve the peer endpoint on the host network.
    pub fn resolve_endpoint(&self) -> Result<SocketAddr> {
        self.peer
            .endpoint
            .to_socket_addrs()
            .with_context(|| format!("Cannot resolve endpoint: {}", self.peer.endpoint))?
            .next()
            .with_context(|| format!("No addresses found for endpoint: {}", self.peer.endpoint))
    }

    /// Parse the interface address from CIDR notation.
    ///
    /// A bare address is treated as `/32`. Returns `(ip, prefix_len)`.
    pub fn parse_address(&self) -> Result<(Ipv4Addr, u8)> {
        let address = self
            .interface
            .address
            .split(',')
            .map(str::trim)
            .find(|a| !a.contains(':'))
            .with_context(|| {
                format!(
                    "No IPv4 address in interface address: {}",
                    self.interface.address
                )
            })?;

        let (ip, prefix) = match address.split_once('/') {
            Some((ip, prefix)) => (ip, prefix),
            None => (address, "32"),
        };
        let ip = ip
            .parse::<Ipv4Addr>()
            .with_context(|| format!("Invalid IP in address: {}", address))?;
        let prefix: u8 = prefix
            .parse()
            .with_context(|| format!("Invalid prefix in address: {}", address))?;
        if prefix > 32 {
            bail!("Address prefix must be 0-32, got {}", prefix);
        }
        Ok((ip, prefix))
    }

    /// Get the keepalive interval, returning `None` when set to 0.
    pub fn keepalive_interval(&self) -> Option<u16> {
        if self.peer.persistent_keepalive == 0 {
            None
        } else {
            Some(self.peer.persistent_keepalive)
        }
    }
}

/// Validate a CIDR notation string (e.g. `"10.0.0.0/24"`, `"::/0"`).
fn validate_cidr(cidr: &str) -> Result<()> {
    let (ip, prefix) = cidr
        .split_once('/')
        .with_context(|| format!("Invalid CIDR (expected addr/prefix): {}", cidr))?;
    let ip: std::net::IpAddr = ip
        .parse()
        .with_context(|| format!("Invalid IP in CIDR: {}", cidr))?;
    let prefix: u8 = prefix
        .parse()
        .with_context(|| format!("Invalid prefix in CIDR: {}", cidr))?;
    let max = if ip.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        bail!("CIDR prefix must be 0-{}, got {}", max, prefix);
    }
    Ok(())
}
