//! Nimbus DNS proxy daemon
//!
//! A UDP-to-DoH DNS proxy. All configuration comes from environment
//! variables (LISTEN_HOST, LISTEN_PORT, DOH_UPSTREAM, BOOTSTRAP_DNS,
//! WORKER_COUNT, QUEUE_SIZE, CACHE_ENABLED, LOG_LEVEL).

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nimbus_dns::{Config, Server};

/// Nimbus - DNS proxy forwarding UDP queries over DNS-over-HTTPS
#[derive(Parser)]
#[command(name = "nimbus")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level override (error, warn, info, debug, trace); defaults to LOG_LEVEL
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env().context("Failed to load configuration from environment")?;

    let level = cli
        .log_level
        .unwrap_or_else(|| config.tracing_level().to_string());
    init_logging(&level);

    info!("nimbus v{} starting", env!("CARGO_PKG_VERSION"));

    let server = Server::bind(config)
        .await
        .context("Failed to start DNS proxy")?;

    // Create the shutdown handle before moving the server into its task
    let shutdown_tx = server.shutdown_handle();

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("server error: {}", e);
        }
    });

    wait_for_shutdown().await;

    info!("Shutting down...");

    // Signal graceful shutdown
    let _ = shutdown_tx.send(());

    // Wait for the server to drain (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("Failed to register SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C");
    }
}
