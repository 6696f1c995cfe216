//! Helper utilities for wgproxy
//!
//! Small address helpers shared by the dialers, the resolver and the
//! SOCKS5 server.

use crate::error::WgProxyError;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Default connection timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default connection timeout
pub fn default_connect_timeout() -> Duration {
    Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)
}

/// Split `host:port` (or `[v6]:port`) into its parts.
pub fn split_host_port(addr: &str) -> Result<(&str, u16), WgProxyError> {
    let invalid = || WgProxyError::Config(format!("invalid host:port address: {}", addr));

    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host, port))
}

/// Return the socket address if `addr` is an IP literal with a port.
pub fn literal_socket_addr(addr: &str) -> Option<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Some(sa);
    }
    let (host, port) = split_host_port(addr).ok()?;
    host.parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, port))
}
