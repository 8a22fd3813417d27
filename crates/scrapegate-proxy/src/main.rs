//! Scrapegate Proxy
//!
//! Single binary that runs:
//! - The scrape-facing HTTP endpoint (`GET /<path>`)
//! - The WebSocket endpoint for agents (`GET /agent/ws`)
//! - The introspection endpoint (`GET /debug/agents`)

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use clap::Parser;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use scrapegate_proxy::state::{AppState, ProxyConfig};
use scrapegate_proxy::{debug, scrape, ws_agent};

/// Scrapegate proxy daemon.
#[derive(Parser, Debug)]
#[command(name = "scrapegate-proxy", about = "Scrapegate metrics scrape proxy")]
struct Cli {
    /// Listen address for both the scrape endpoint and the agent WebSocket.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen_addr: String,

    /// Seconds an unanswered scrape may age before the caller gets a 503.
    #[arg(long, default_value_t = 5)]
    scrape_timeout_secs: u64,

    /// Per-agent outbound queue capacity.
    #[arg(long, default_value_t = 128)]
    queue_capacity: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = ProxyConfig {
        queue_capacity: cli.queue_capacity,
        scrape_timeout: Duration::from_secs(cli.scrape_timeout_secs),
        ..ProxyConfig::default()
    };

    // Shutdown signal — observed by waiting scrape handlers and the server.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = AppState::new(config, shutdown_rx.clone());

    let app = Router::new()
        .route("/agent/ws", axum::routing::get(ws_agent::handler))
        .route("/debug/agents", axum::routing::get(debug::handler))
        .fallback(scrape::handler)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = cli.listen_addr.parse()?;
    tracing::info!("scrapegate-proxy listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let mut serve_shutdown = shutdown_rx.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = serve_shutdown.changed().await;
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received SIGINT, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    server.await?;

    tracing::info!("scrapegate-proxy stopped");
    Ok(())
}
