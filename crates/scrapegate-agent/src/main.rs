//! Scrapegate Agent
//!
//! Lightweight daemon running next to the scrape targets.
//!
//! - Connects to the proxy over WebSocket and registers its paths
//! - Fetches target URLs on the proxy's behalf with a bounded worker pool
//! - Reconnects at a steady cadence when the connection drops

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use scrapegate_agent::{config, control};

/// Scrapegate agent daemon.
#[derive(Parser, Debug)]
#[command(name = "scrapegate-agent", about = "Scrapegate field agent")]
struct Cli {
    /// Proxy WebSocket URL.
    #[arg(long, default_value = "ws://localhost:8080/agent/ws")]
    proxy_url: String,

    /// Path to the targets TOML file.
    #[arg(long, default_value = "targets.toml")]
    config: PathBuf,

    /// Hostname override.
    #[arg(long)]
    hostname: Option<String>,

    /// Minimum seconds between connection attempts.
    #[arg(long, default_value_t = 3)]
    reconnect_pause_secs: u64,

    /// Number of concurrent fetch workers.
    #[arg(long, default_value_t = 4)]
    fetch_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let hostname = cli
        .hostname
        .unwrap_or_else(|| gethostname().unwrap_or_else(|| "scrapegate-agent".into()));

    let targets = config::load(&cli.config)?;
    tracing::info!(
        hostname = %hostname,
        proxy_url = %cli.proxy_url,
        targets = targets.len(),
        "scrapegate-agent starting"
    );

    let mut agent_config = control::AgentConfig::new(cli.proxy_url, hostname, targets);
    agent_config.reconnect_pause = Duration::from_secs(cli.reconnect_pause_secs);
    agent_config.fetch_workers = cli.fetch_workers;

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let control_handle = tokio::spawn(control::run(Arc::new(agent_config), shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            let _ = shutdown_tx.send(true);
        }
        result = control_handle => {
            if let Err(err) = result {
                tracing::error!("control task failed: {err}");
            }
        }
    }

    tracing::info!("scrapegate-agent stopped");
    Ok(())
}

fn gethostname() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
}
