//! Error types for wgproxy
//!
//! Typed failures that callers need to tell apart. Everything else travels
//! as `anyhow::Error` with context attached at the call site.

use std::io;
use thiserror::Error;

/// Main error type for wgproxy operations
#[derive(Error, Debug)]
pub enum WgProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A `-L`/`-R` forward rule that does not match the grammar
    #[error("Invalid forward rule: {0}")]
    InvalidSpec(String),

    /// Proxy dial to a loopback address was refused
    #[error("Dial to loopback address refused: {0}")]
    LoopbackForbidden(String),

    /// Proxy dial asked for a network other than tcp/udp
    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// Name resolution through the tunnel failed or returned nothing
    #[error("Resolve error: {0}")]
    Resolve(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The tunnel event loop is gone or refused the request
    #[error("Tunnel error: {0}")]
    Tunnel(String),
}

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5ReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl From<Socks5ReplyCode> for u8 {
    fn from(code: Socks5ReplyCode) -> Self {
        code as u8
    }
}

impl From<&io::Error> for Socks5ReplyCode {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Socks5ReplyCode::ConnectionRefused,
            io::ErrorKind::TimedOut => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::AddrNotAvailable => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::PermissionDenied => Socks5ReplyCode::ConnectionNotAllowed,
            _ => Socks5ReplyCode::GeneralFailure,
        }
    }
}

impl From<&WgProxyError> for Socks5ReplyCode {
    fn from(err: &WgProxyError) -> Self {
        match err {
            WgProxyError::LoopbackForbidden(_) => Socks5ReplyCode::ConnectionNotAllowed,
            WgProxyError::Resolve(_) => Socks5ReplyCode::HostUnreachable,
            WgProxyError::UnsupportedNetwork(_) => Socks5ReplyCode::CommandNotSupported,
            WgProxyError::Io(e) => Socks5ReplyCode::from(e),
            _ => Socks5ReplyCode::GeneralFailure,
        }
    }
}

impl Socks5ReplyCode {
    /// Pick the reply code for a failed dial by walking the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(e) = cause.downcast_ref::<WgProxyError>() {
                return Socks5ReplyCode::from(e);
            }
            if let Some(e) = cause.downcast_ref::<io::Error>() {
                return Socks5ReplyCode::from(e);
            }
            if cause.is::<tokio::time::error::Elapsed>() {
                return Socks5ReplyCode::HostUnreachable;
            }
        }
        Socks5ReplyCode::GeneralFailure
    }
}
