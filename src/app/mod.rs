//! Orchestrator
//!
//! Starts the tunnel, wires the dialers and spawns one engine per
//! configured listener into a [`TaskGroup`].

mod task_group;

pub use task_group::TaskGroup;

use crate::config::{Config, DEFAULT_SOCKS_LISTEN};
use crate::forward::{serve_tcp, ForwardRule, Protocol, UdpMultiplexer};
use crate::proxy::{ProxyDialer, Socks5Server, TunnelResolver};
use crate::transport::{Dialer, DirectDialer, TunnelDialer};
use crate::tunnel::Tunnel;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tracing::info;

/// The running proxy
#[derive(Debug)]
pub struct App {
    config: Config,
}

impl App {
    /// Create the app; nothing starts until [`App::run`].
    pub fn new(config: Config) -> Self {
        App { config }
    }

    /// Get a reference to the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start everything and block until all engines exit or `shutdown_rx`
    /// fires.
    ///
    /// Setup failures (tunnel start, bind) are returned before any engine
    /// runs.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
        let config = self.config;
        config.validate()?;

        let tunnel = Tunnel::start(&config.tunnel)
            .await
            .context("Failed to start WireGuard tunnel")?;
        let tunnel = Arc::new(tunnel);

        let direct: Arc<dyn Dialer> = Arc::new(DirectDialer::new());
        let resolver = TunnelResolver::new(
            Arc::new(TunnelDialer::new(tunnel.clone())),
            config.dns.clone(),
        );
        let tunnel_dialer: Arc<dyn Dialer> =
            Arc::new(TunnelDialer::new(tunnel.clone()).with_resolver(resolver.clone()));
        let proxy = ProxyDialer::new(tunnel_dialer.clone());
        info!("DNS through the tunnel via {}", resolver.server());

        let mut group = TaskGroup::new();

        let mut socks = config.socks.clone();
        if config.needs_default_socks() {
            socks.push(DEFAULT_SOCKS_LISTEN.to_string());
            info!("Enable default socks5 listener: {}", DEFAULT_SOCKS_LISTEN);
        }
        for listen in &socks {
            let listener = bind_tcp(listen).await?;
            let server = Socks5Server::new(proxy.clone(), resolver.clone());
            group.spawn(format!("socks5 {}", listen), server.serve(Arc::new(listener)));
        }

        for rule in &config.remote_forwards {
            let listener = tunnel
                .listen(&rule.listen)
                .await
                .with_context(|| format!("Failed to start {}", rule))?;
            info!("Forward {}", rule);
            group.spawn(
                rule.to_string(),
                serve_tcp(Arc::new(listener), direct.clone(), rule.target.clone()),
            );
        }

        for rule in &config.local_forwards {
            spawn_local_forward(&mut group, rule, tunnel_dialer.clone()).await?;
        }

        let shutdown = tokio::select! {
            _ = group.join_all() => false,
            _ = shutdown_rx.recv() => true,
        };
        if shutdown {
            info!("Shutdown signal received, stopping {} tasks", group.len());
            group.abort_all();
            group.join_all().await;
        } else {
            info!("All listeners have exited");
        }

        info!("Stopped");
        Ok(())
    }
}

async fn spawn_local_forward(
    group: &mut TaskGroup,
    rule: &ForwardRule,
    dialer: Arc<dyn Dialer>,
) -> Result<()> {
    let target = rule.target.clone();
    match rule.protocol {
        Protocol::Tcp => {
            let listener = bind_tcp(&rule.listen).await?;
            group.spawn(rule.to_string(), serve_tcp(Arc::new(listener), dialer, target));
        }
        Protocol::Udp => {
            let socket = UdpSocket::bind(host_listen_addr(&rule.listen))
                .await
                .with_context(|| format!("Can not listen on udp {}", rule.listen))?;
            let mux = UdpMultiplexer::new(Arc::new(socket), dialer, target);
            group.spawn(rule.to_string(), mux.serve());
        }
    }
    info!("Forward {}", rule);
    Ok(())
}

async fn bind_tcp(listen: &str) -> Result<TcpListener> {
    TcpListener::bind(host_listen_addr(listen))
        .await
        .with_context(|| format!("Can not listen on {}", listen))
}

/// `:port` means every interface.
fn host_listen_addr(listen: &str) -> String {
    if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::config::tests::test_config;

    #[test]
    fn test_host_listen_addr() {
        assert_eq!(host_listen_addr(":1080"), "0.0.0.0:1080");
        assert_eq!(host_listen_addr("127.0.0.1:1080"), "127.0.0.1:1080");
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut tunnel = test_config();
        tunnel.peer.endpoint = peer.local_addr().unwrap().to_string();

        let app = App::new(Config {
            tunnel,
            dns: "10.0.0.53:53".to_string(),
            socks: vec![taken.local_addr().unwrap().to_string()],
            local_forwards: Vec::new(),
            remote_forwards: Vec::new(),
        });
        let (_tx, rx) = broadcast::channel(1);

        let err = app.run(rx).await.unwrap_err();
        assert!(err.to_string().contains("Can not listen on"));
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_run() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut tunnel = test_config();
        tunnel.peer.endpoint = peer.local_addr().unwrap().to_string();

        let app = App::new(Config {
            tunnel,
            dns: "10.0.0.53:53".to_string(),
            socks: vec!["127.0.0.1:0".to_string()],
            local_forwards: vec![ForwardRule::local("127.0.0.1:0:10.0.0.1:80").unwrap()],
            remote_forwards: vec![ForwardRule::remote("8080:80").unwrap()],
        });
        let (tx, rx) = broadcast::channel(1);

        let run = tokio::spawn(app.run(rx));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!run.is_finished());

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
