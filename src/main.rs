//! wgproxy - Userspace WireGuard client with SOCKS5 and port forwarding
//!
//! This is the main entry point for the wgproxy application.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use wgproxy::config::{args_with_file_fallback, Cli};
use wgproxy::App;

#[tokio::main]
async fn main() -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to read working directory")?;
    let from_file = std::env::args().len() <= 1;
    let cli = Cli::parse_from(args_with_file_fallback(std::env::args().collect(), &cwd));

    // Setup logging
    setup_logging(&cli.log_level, cli.json_log)?;

    info!("wgproxy v{}", wgproxy::VERSION);
    if from_file && cwd.join(wgproxy::config::ARGS_FILE).exists() {
        info!("Reading args from {}", wgproxy::config::ARGS_FILE);
    }
    info!("WireGuard config: {:?}", cli.config);

    let config = cli.into_config()?;

    // Setup shutdown signal
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Handle Ctrl+C and termination signals (cross-platform)
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {
                            info!("Received Ctrl+C, shutting down...");
                        }
                        _ = sigterm.recv() => {
                            info!("Received SIGTERM, shutting down...");
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to setup SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received Ctrl+C, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            // On Windows, only handle Ctrl+C
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down...");
        }

        let _ = shutdown_tx.send(true);
    });

    App::new(config).run(shutdown_rx).await
}

/// Setup logging based on configuration
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
