//! Forward rule parsing
//!
//! Turns the ssh-style `-L`/`-R` argument strings into [`ForwardRule`]s.
//!
//! ```text
//! [udp:]port
//! [udp:]listen_port:target_port
//! [udp:]listen_port:target_host:target_port
//! [udp:]listen_host:listen_port:target_host:target_port
//! ```
//!
//! The one- and two-field forms are only valid for remote forwards.

use crate::error::WgProxyError;
use std::fmt;

/// Prefix selecting UDP instead of TCP.
pub const UDP_PREFIX: &str = "udp:";

/// Listen host used by local forwards when the rule omits one.
pub const LOCAL_LISTEN_HOST: &str = "127.0.0.1";

/// Listen host used by remote forwards when the rule omits one.
pub const REMOTE_LISTEN_HOST: &str = "0.0.0.0";

/// Target host used when the rule omits one.
pub const DEFAULT_TARGET_HOST: &str = "127.0.0.1";

/// Transport protocol carried by a forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Byte streams
    Tcp,
    /// Datagrams
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Which side listens and which side dials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Listen on the host, dial through the tunnel (`-L`)
    Local,
    /// Listen inside the tunnel, dial on the host (`-R`)
    Remote,
}

impl Direction {
    fn default_listen_host(self) -> &'static str {
        match self {
            Direction::Local => LOCAL_LISTEN_HOST,
            Direction::Remote => REMOTE_LISTEN_HOST,
        }
    }

    fn flag(self) -> &'static str {
        match self {
            Direction::Local => "L",
            Direction::Remote => "R",
        }
    }
}

/// A parsed forward. `listen` and `target` are always `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    /// Protocol to relay
    pub protocol: Protocol,
    /// Forward direction
    pub direction: Direction,
    /// Address to listen on
    pub listen: String,
    /// Address to dial for every accepted connection or new UDP session
    pub target: String,
}

impl ForwardRule {
    /// Parse a raw rule for the given direction.
    pub fn parse(raw: &str, direction: Direction) -> Result<Self, WgProxyError> {
        let (protocol, body) = match raw.strip_prefix(UDP_PREFIX) {
            Some(rest) => (Protocol::Udp, rest),
            None => (Protocol::Tcp, raw),
        };

        let invalid = || WgProxyError::InvalidSpec(raw.to_string());
        let tokens: Vec<&str> = body.split(':').collect();

        let (listen_host, listen_port, target_host, target_port) =
            match (tokens.as_slice(), direction) {
                ([port], Direction::Remote) => {
                    (REMOTE_LISTEN_HOST, *port, DEFAULT_TARGET_HOST, *port)
                }
                ([listen_port, target_port], Direction::Remote) => (
                    REMOTE_LISTEN_HOST,
                    *listen_port,
                    DEFAULT_TARGET_HOST,
                    *target_port,
                ),
                ([listen_port, target_host, target_port], _) => (
                    direction.default_listen_host(),
                    *listen_port,
                    *target_host,
                    *target_port,
                ),
                ([listen_host, listen_port, target_host, target_port], _) => {
                    let listen_host = if listen_host.is_empty() {
                        direction.default_listen_host()
                    } else {
                        *listen_host
                    };
                    (listen_host, *listen_port, *target_host, *target_port)
                }
                _ => return Err(invalid()),
            };

        let listen_port = parse_port(listen_port).ok_or_else(invalid)?;
        let target_port = parse_port(target_port).ok_or_else(invalid)?;
        let target_host = if target_host.is_empty() {
            DEFAULT_TARGET_HOST
        } else {
            target_host
        };

        Ok(ForwardRule {
            protocol,
            direction,
            listen: format!("{}:{}", listen_host, listen_port),
            target: format!("{}:{}", target_host, target_port),
        })
    }

    /// Parse a `-L` rule.
    pub fn local(raw: &str) -> Result<Self, WgProxyError> {
        Self::parse(raw, Direction::Local)
    }

    /// Parse a `-R` rule.
    pub fn remote(raw: &str) -> Result<Self, WgProxyError> {
        Self::parse(raw, Direction::Remote)
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} -> {}",
            self.direction.flag(),
            self.protocol,
            self.listen,
            self.target
        )
    }
}

fn parse_port(token: &str) -> Option<u16> {
    token.parse::<u16>().ok()
}
