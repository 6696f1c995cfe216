//! Configuration module for wgproxy
//!
//! Runtime configuration assembled from the command line ([`Cli`]) and the
//! tunnel file ([`TunnelConfig`]).

mod cli;

pub use crate::tunnel::config::{InterfaceConfig, PeerConfig, TunnelConfig};
pub use cli::{args_with_file_fallback, Cli, ARGS_FILE};

use crate::error::WgProxyError;
use crate::forward::{ForwardRule, Protocol};
use crate::helper::split_host_port;
use anyhow::{Context, Result};
use std::path::Path;

/// Tunnel config file used when `--config` is not given.
pub const DEFAULT_TUNNEL_CONFIG: &str = "wg.conf";

/// DNS server used when `--dns` is not given.
pub const DEFAULT_DNS: &str = "8.8.8.8:53";

/// SOCKS5 listener added when nothing else is configured.
pub const DEFAULT_SOCKS_LISTEN: &str = "127.0.0.1:1080";

/// Everything the orchestrator needs to start.
#[derive(Debug, Clone)]
pub struct Config {
    /// WireGuard tunnel parameters
    pub tunnel: TunnelConfig,
    /// DNS server (`ip:port`) reached through the tunnel
    pub dns: String,
    /// SOCKS5 listen addresses on the host
    pub socks: Vec<String>,
    /// `-L` forwards
    pub local_forwards: Vec<ForwardRule>,
    /// `-R` forwards
    pub remote_forwards: Vec<ForwardRule>,
}

impl Config {
    /// Check what the parsers cannot see on their own.
    pub fn validate(&self) -> Result<()> {
        split_host_port(&self.dns).context("Invalid DNS server")?;
        for listen in &self.socks {
            split_host_port(listen).context("Invalid SOCKS5 listen address")?;
        }

        if let Some(rule) = self
            .remote_forwards
            .iter()
            .find(|rule| rule.protocol == Protocol::Udp)
        {
            return Err(WgProxyError::Config(format!(
                "UDP remote forwards are not supported: {}",
                rule
            ))
            .into());
        }
        Ok(())
    }

    /// Whether the default SOCKS5 listener should be added.
    pub fn needs_default_socks(&self) -> bool {
        self.local_forwards.is_empty() && self.socks.is_empty()
    }
}

/// Load the tunnel configuration.
///
/// A `.toml` file is read as TOML, anything else as a wg-quick profile.
pub fn load_tunnel_config<P: AsRef<Path>>(path: P) -> Result<TunnelConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read WireGuard config file: {:?}", path))?;

    let is_toml = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let config = if is_toml {
        parse_tunnel_config(&content)
    } else {
        parse_wg_quick_config(&content)
    };
    config.with_context(|| format!("Invalid WireGuard config file: {:?}", path))
}

/// Parse and validate the tunnel configuration from a TOML string
pub fn parse_tunnel_config(content: &str) -> Result<TunnelConfig> {
    validated(TunnelConfig::from_toml(content)?)
}

/// Parse and validate a wg-quick profile
pub fn parse_wg_quick_config(content: &str) -> Result<TunnelConfig> {
    validated(TunnelConfig::from_wg_quick(content)?)
}

fn validated(config: TunnelConfig) -> Result<TunnelConfig> {
    config
        .validate()
        .context("WireGuard configuration validation failed")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::config::tests::{key, test_config};

    fn config() -> Config {
        Config {
            tunnel: test_config(),
            dns: DEFAULT_DNS.to_string(),
            socks: Vec::new(),
            local_forwards: Vec::new(),
            remote_forwards: Vec::new(),
        }
    }

    #[test]
    fn test_parse_tunnel_config() {
        let content = format!(
            r#"
[interface]
private_key = "{}"
address = "10.0.0.2/24"

[peer]
public_key = "{}"
endpoint = "127.0.0.1:51820"
"#,
            key(1),
            key(2)
        );

        let tunnel = parse_tunnel_config(&content).unwrap();
        assert_eq!(tunnel.interface.address, "10.0.0.2/24");
        assert_eq!(tunnel.interface.mtu, 1420);
        assert_eq!(tunnel.peer.endpoint, "127.0.0.1:51820");
    }

    #[test]
    fn test_parse_tunnel_config_rejects_bad_key() {
        let content = format!(
            r#"
[interface]
private_key = "not-base64"
address = "10.0.0.2/24"

[peer]
public_key = "{}"
endpoint = "127.0.0.1:51820"
"#,
            key(2)
        );
        assert!(parse_tunnel_config(&content).is_err());
    }

    #[test]
    fn test_parse_wg_quick_config() {
        let content = format!(
            "[Interface]\nPrivateKey = {}\nAddress = 10.0.0.2/24\n\n\
             [Peer]\nPublicKey = {}\nEndpoint = 127.0.0.1:51820\nAllowedIPs = 0.0.0.0/0, ::/0\n",
            key(1),
            key(2)
        );

        let tunnel = parse_wg_quick_config(&content).unwrap();
        assert_eq!(tunnel.interface.address, "10.0.0.2/24");
        assert_eq!(tunnel.peer.allowed_ips.len(), 2);

        // a profile is not TOML
        assert!(parse_tunnel_config(&content).is_err());
    }

    #[test]
    fn test_parse_wg_quick_config_validates() {
        let content = format!(
            "[Interface]\nPrivateKey = {}\nAddress = 10.0.0.2/40\n\
             [Peer]\nPublicKey = {}\nEndpoint = 127.0.0.1:51820\n",
            key(1),
            key(2)
        );
        let err = parse_wg_quick_config(&content).unwrap_err();
        assert!(format!("{:#}", err).contains("validation failed"));
    }

    #[test]
    fn test_load_tunnel_config_missing_file() {
        let err = load_tunnel_config("/nonexistent/wg.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }

    #[test]
    fn test_remote_udp_forward_is_rejected() {
        let mut cfg = config();
        cfg.remote_forwards
            .push(ForwardRule::remote("udp:5353:53").unwrap());
        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WgProxyError>(),
            Some(WgProxyError::Config(_))
        ));
    }

    #[test]
    fn test_validate_addresses() {
        let mut cfg = config();
        assert!(cfg.validate().is_ok());

        cfg.dns = "8.8.8.8".to_string();
        assert!(cfg.validate().is_err());

        cfg.dns = DEFAULT_DNS.to_string();
        cfg.socks.push("localhost".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_needs_default_socks() {
        let mut cfg = config();
        assert!(cfg.needs_default_socks());

        cfg.remote_forwards.push(ForwardRule::remote("2222:22").unwrap());
        assert!(cfg.needs_default_socks(), "remote forwards do not count");

        cfg.local_forwards
            .push(ForwardRule::local("8080:10.0.0.1:80").unwrap());
        assert!(!cfg.needs_default_socks());
    }
}
