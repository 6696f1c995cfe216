//! Reader for wg-quick profiles (`wg0.conf`).
//!
//! ```text
//! [Interface]
//! PrivateKey = ...
//! Address = 10.0.0.2/32, fd00::2/128
//! DNS = 10.0.0.1
//!
//! [Peer]
//! PublicKey = ...
//! Endpoint = vpn.example.com:51820
//! AllowedIPs = 0.0.0.0/0, ::/0
//! ```
//!
//! Keys are case-insensitive, `#` starts a comment, and list keys may be
//! repeated or comma separated. Keys that only matter to wg-quick itself
//! (`DNS`, `Table`, `PostUp`, ...) are skipped. Exactly one `[Peer]` is
//! supported.

use super::config::{
    default_allowed_ips, default_keepalive, InterfaceConfig, PeerConfig, TunnelConfig, DEFAULT_MTU,
};
use anyhow::{bail, Context, Result};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    None,
    Interface,
    Peer,
}

#[derive(Debug, Default)]
struct InterfaceBuilder {
    private_key: Option<String>,
    addresses: Vec<String>,
    mtu: Option<usize>,
}

#[derive(Debug, Default)]
struct PeerBuilder {
    public_key: Option<String>,
    preshared_key: Option<String>,
    endpoint: Option<String>,
    persistent_keepalive: Option<u16>,
    allowed_ips: Vec<String>,
}

/// Parse a wg-quick profile. The result is not validated yet.
pub fn parse(content: &str) -> Result<TunnelConfig> {
    let mut section = Section::None;
    let mut interface: Option<InterfaceBuilder> = None;
    let mut peer: Option<PeerBuilder> = None;

    for (index, raw) in content.lines().enumerate() {
        let line_no = index + 1;
        let line = match raw.split_once('#') {
            Some((before, _)) => before,
            None => raw,
        }
        .trim();
        if line.is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = match name.trim().to_ascii_lowercase().as_str() {
                "interface" => {
                    if interface.is_some() {
                        bail!("line {}: duplicate [Interface] section", line_no);
                    }
                    interface = Some(InterfaceBuilder::default());
                    Section::Interface
                }
                "peer" => {
                    if peer.is_some() {
                        bail!("line {}: only one [Peer] section is supported", line_no);
                    }
                    peer = Some(PeerBuilder::default());
                    Section::Peer
                }
                other => bail!("line {}: unknown section [{}]", line_no, other),
            };
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .with_context(|| format!("line {}: expected `Key = Value`", line_no))?;
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        match section {
            Section::None => bail!("line {}: `{}` outside of a section", line_no, key),
            Section::Interface => {
                if let Some(builder) = interface.as_mut() {
                    builder.set(&key, value, line_no)?;
                }
            }
            Section::Peer => {
                if let Some(builder) = peer.as_mut() {
                    builder.set(&key, value, line_no)?;
                }
            }
        }
    }

    let interface = interface
        .context("missing [Interface] section")?
        .build()?;
    let peer = peer.context("missing [Peer] section")?.build()?;
    Ok(TunnelConfig { interface, peer })
}

fn list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
}

impl InterfaceBuilder {
    fn set(&mut self, key: &str, value: &str, line_no: usize) -> Result<()> {
        match key {
            "privatekey" => self.private_key = Some(value.to_string()),
            "address" => self.addresses.extend(list(value)),
            "mtu" => {
                let mtu = value
                    .parse()
                    .with_context(|| format!("line {}: invalid MTU {}", line_no, value))?;
                self.mtu = Some(mtu);
            }
            _ => debug!("wg-quick: ignoring Interface key {}", key),
        }
        Ok(())
    }

    fn build(self) -> Result<InterfaceConfig> {
        if self.addresses.is_empty() {
            bail!("[Interface] has no Address");
        }
        Ok(InterfaceConfig {
            private_key: self.private_key.context("[Interface] has no PrivateKey")?,
            address: self.addresses.join(", "),
            mtu: self.mtu.unwrap_or(DEFAULT_MTU),
        })
    }
}

impl PeerBuilder {
    fn set(&mut self, key: &str, value: &str, line_no: usize) -> Result<()> {
        match key {
            "publickey" => self.public_key = Some(value.to_string()),
            "presharedkey" => self.preshared_key = Some(value.to_string()),
            "endpoint" => self.endpoint = Some(value.to_string()),
            "allowedips" => self.allowed_ips.extend(list(value)),
            "persistentkeepalive" => {
                let secs = if value.eq_ignore_ascii_case("off") {
                    0
                } else {
                    value.parse().with_context(|| {
                        format!("line {}: invalid PersistentKeepalive {}", line_no, value)
                    })?
                };
                self.persistent_keepalive = Some(secs);
            }
            _ => debug!("wg-quick: ignoring Peer key {}", key),
        }
        Ok(())
    }

    fn build(self) -> Result<PeerConfig> {
        Ok(PeerConfig {
            public_key: self.public_key.context("[Peer] has no PublicKey")?,
            preshared_key: self.preshared_key,
            endpoint: self.endpoint.context("[Peer] has no Endpoint")?,
            persistent_keepalive: self.persistent_keepalive.unwrap_or_else(default_keepalive),
            allowed_ips: if self.allowed_ips.is_empty() {
                default_allowed_ips()
            } else {
                self.allowed_ips
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::config::tests::key;
    use std::net::Ipv4Addr;

    fn profile() -> String {
        format!(
            "# exported by the VPN provider\n\
             [Interface]\n\
             PrivateKey = {}\n\
             Address = 10.64.0.2/32, fc00:bbbb::2/128\n\
             DNS = 10.64.0.1\n\
             \n\
             [Peer]\n\
             PublicKey = {}\n\
             AllowedIPs = 0.0.0.0/0\n\
             AllowedIPs = ::/0\n\
             Endpoint = 198.51.100.7:51820 # primary\n",
            key(1),
            key(2)
        )
    }

    #[test]
    fn test_parse_profile() {
        let cfg = parse(&profile()).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.interface.private_key, key(1));
        assert_eq!(cfg.interface.mtu, DEFAULT_MTU);
        assert_eq!(
            cfg.parse_address().unwrap(),
            (Ipv4Addr::new(10, 64, 0, 2), 32)
        );
        assert_eq!(cfg.peer.endpoint, "198.51.100.7:51820");
        assert_eq!(cfg.peer.allowed_ips, vec!["0.0.0.0/0", "::/0"]);
        assert_eq!(cfg.peer.persistent_keepalive, 25);
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let content = format!(
            "[interface]\nprivatekey={}\naddress=10.0.0.2\nmtu=1380\n\
             [PEER]\npublickey={}\nendpoint=vpn.example.com:51820\n\
             presharedkey={}\npersistentkeepalive=off\n",
            key(1),
            key(2),
            key(3)
        );
        let cfg = parse(&content).unwrap();
        assert_eq!(cfg.interface.mtu, 1380);
        assert_eq!(cfg.peer.preshared_key, Some(key(3)));
        assert_eq!(cfg.keepalive_interval(), None);
        assert_eq!(cfg.peer.allowed_ips, vec!["0.0.0.0/0"]);
    }

    #[test]
    fn test_rejects_second_peer() {
        let content = format!("{}\n[Peer]\nPublicKey = {}\n", profile(), key(4));
        let err = parse(&content).unwrap_err();
        assert!(err.to_string().contains("only one [Peer]"));
    }

    #[test]
    fn test_rejects_malformed_profiles() {
        assert!(parse("PrivateKey = x\n").is_err());
        assert!(parse("[Interface]\nnot a pair\n").is_err());
        assert!(parse("[Wireguard]\n").is_err());
        assert!(parse(&format!("[Interface]\nPrivateKey = {}\n", key(1))).is_err());

        let no_endpoint = profile().replace("Endpoint", "# Endpoint");
        let err = parse(&no_endpoint).unwrap_err();
        assert!(err.to_string().contains("Endpoint"));
    }
}
