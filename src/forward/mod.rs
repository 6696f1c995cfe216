//! Port forwarding
//!
//! - [`rule`]: the `-L`/`-R` grammar
//! - [`tcp`]: stream relay engine
//! - [`udp`]: datagram session multiplexer
//!
//! The engines only see the [`crate::transport`] traits, so the same code
//! serves local forwards (host → tunnel) and remote forwards (tunnel → host).

pub mod rule;
pub mod tcp;
pub mod udp;

pub use rule::{Direction, ForwardRule, Protocol};
pub use tcp::{relay_bidirectional, serve_tcp, RelayStats};
pub use udp::{SessionTable, UdpMultiplexer};
