//! SOCKS5 front end and the pieces it is wired with
//!
//! - [`adapter`]: loopback-guarded dialing
//! - [`resolver`]: DNS through the tunnel
//! - [`socks`]: the SOCKS5 server itself

pub mod adapter;
pub mod dns;
pub mod resolver;
pub mod socks;

pub use adapter::{ProxyDialer, LOOPBACK_GUARD_PREFIX};
pub use resolver::{TunnelResolver, DNS_ATTEMPTS, DNS_QUERY_TIMEOUT};
pub use socks::Socks5Server;
