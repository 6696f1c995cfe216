//! # wgproxy - Userspace WireGuard client with SOCKS5 and port forwarding
//!
//! wgproxy connects to a WireGuard peer entirely in user space (no TUN
//! device, no root) and exposes the private network behind it to ordinary
//! applications.
//!
//! ## Features
//!
//! - **SOCKS5 proxy** (`-D`): CONNECT through the tunnel, names resolved
//!   with a DNS server inside the tunnel
//! - **Local forwards** (`-L`): host TCP/UDP port → address in the tunnel
//! - **Remote forwards** (`-R`): tunnel TCP port → address on the host
//! - **Loopback guard**: SOCKS5 clients cannot reach `127.0.0.1`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wgproxy::{App, Cli};
//! use clap::Parser;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Cli::parse().into_config()?;
//!     let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//!     App::new(config).run(shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! -L / SOCKS5:  host listener -> relay -> TunnelDialer -> smoltcp -> boringtun -> peer
//! -R:           smoltcp listener -> relay -> DirectDialer -> host network
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod app;
pub mod config;
pub mod error;
pub mod forward;
pub mod helper;
pub mod proxy;
pub mod transport;
pub mod tunnel;

// Re-export commonly used items
pub use app::App;
pub use config::{Cli, Config};
pub use error::{Socks5ReplyCode, WgProxyError};

/// Version of the wgproxy library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
