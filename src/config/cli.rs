//! Command line
//!
//! ssh-style forwarding flags. Single-dash long flags (`-config wg.conf`,
//! `-listen :1080`) are accepted too, so argument files written for the
//! flag style of other wg proxies keep working.

use super::{load_tunnel_config, Config, DEFAULT_DNS, DEFAULT_TUNNEL_CONFIG};
use crate::forward::ForwardRule;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

/// Arguments file read when the binary is started without arguments.
pub const ARGS_FILE: &str = "wg-proxy.conf";

/// Long flags that may also be spelled with one dash.
const LONG_FLAGS: &[&str] = &["config", "dns", "listen", "local", "remote", "log-level", "json-log"];

/// wgproxy - userspace WireGuard client with SOCKS5 and port forwarding
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "wgproxy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// WireGuard tunnel config file (TOML)
    #[arg(short, long, default_value = DEFAULT_TUNNEL_CONFIG)]
    pub config: PathBuf,

    /// DNS server used through the tunnel
    #[arg(long, default_value = DEFAULT_DNS)]
    pub dns: String,

    /// Local port forward, like ssh -L ([udp:][host:]port:target_host:target_port)
    #[arg(short = 'L', long = "local", value_name = "RULE")]
    pub local: Vec<String>,

    /// Remote port forward, like ssh -R
    #[arg(short = 'R', long = "remote", value_name = "RULE")]
    pub remote: Vec<String>,

    /// SOCKS5 server listen address, like ssh -D
    #[arg(short = 'D', long = "listen", value_name = "ADDR")]
    pub socks: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    pub json_log: bool,
}

impl Cli {
    /// Parse forward rules and load the tunnel file.
    pub fn into_config(self) -> Result<Config> {
        let local_forwards = self
            .local
            .iter()
            .map(|raw| ForwardRule::local(raw))
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid local forward")?;
        let remote_forwards = self
            .remote
            .iter()
            .map(|raw| ForwardRule::remote(raw))
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid remote forward")?;

        let tunnel = load_tunnel_config(&self.config)?;

        let config = Config {
            tunnel,
            dns: self.dns,
            socks: self.socks,
            local_forwards,
            remote_forwards,
        };
        config.validate()?;
        Ok(config)
    }
}

/// The process arguments, or the contents of [`ARGS_FILE`] in `dir` when
/// none were given.
///
/// The file is split on whitespace. A missing or unreadable file leaves the
/// arguments as they are.
pub fn args_with_file_fallback(args: Vec<String>, dir: &Path) -> Vec<String> {
    if args.len() > 1 {
        return normalize_flags(args);
    }

    match std::fs::read_to_string(dir.join(ARGS_FILE)) {
        Ok(content) => {
            let program = args
                .into_iter()
                .next()
                .unwrap_or_else(|| "wgproxy".to_string());
            let mut expanded = vec![program];
            expanded.extend(content.split_whitespace().map(str::to_string));
            normalize_flags(expanded)
        }
        Err(_) => args,
    }
}

/// Turn `-config` / `-config=x` into `--config` / `--config=x`.
fn normalize_flags(args: Vec<String>) -> Vec<String> {
    args.into_iter()
        .map(|arg| {
            let single = match arg.strip_prefix('-') {
                Some(rest) if !rest.starts_with('-') => rest,
                _ => return arg,
            };
            let name = single.split('=').next().unwrap_or(single);
            if LONG_FLAGS.contains(&name) {
                format!("-{}", arg)
            } else {
                arg
            }
        })
        .collect()
}
