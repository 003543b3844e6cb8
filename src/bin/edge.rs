//! # Tidepool Edge Binary
//!
//! Stateless edge router: proxies public traffic to live coordinators,
//! enforces the registry read/write budget, and hands out DHT bootstrap
//! seeds.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{routing::get, Router};
use clap::Parser;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tracing::info;

use tidepool_node::config::load_config;
use tidepool_node::dht::{DhtNode, DhtResolver, HttpDhtTransport};
use tidepool_node::edge::{EdgeService, MemoryStore};

#[derive(Parser)]
#[command(name = "tidepool-edge")]
#[command(about = "Tidepool edge router - coordinator discovery and request fan-out")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/tidepool.toml")]
    config: String,

    /// HTTP API port
    #[arg(short, long, default_value = "8081")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    // The backing store is deployment-specific; anything implementing
    // `CoordinatorStore` plugs in here without touching cache or
    // suppression logic.
    let store = Arc::new(MemoryStore::new());

    // When the overlay is enabled the edge keeps a querying DHT node so
    // service dispatch can skip the coordinator round trip. The
    // coordinator path remains the fallback for every lookup.
    let resolver = if config.dht.enabled {
        let transport = Arc::new(HttpDhtTransport::new(Duration::from_millis(
            config.dht.lookup_timeout_ms,
        ))?);
        let node = Arc::new(DhtNode::new(
            config.dht.public_endpoint.clone(),
            config.dht.clone(),
            transport,
        ));
        let bootstrap = config.dht.bootstrap_peers.clone();
        let join_node = Arc::clone(&node);
        tokio::spawn(async move {
            join_node.join(&bootstrap).await;
        });
        DhtResolver::new(
            Some(node),
            Duration::from_millis(config.dht.lookup_timeout_ms),
            Duration::from_secs(config.dht.record_staleness_secs),
        )
    } else {
        DhtResolver::new(
            None,
            Duration::from_millis(config.dht.lookup_timeout_ms),
            Duration::from_secs(config.dht.record_staleness_secs),
        )
    };

    let edge = EdgeService::new(config.edge, store, resolver)?;
    edge.start().await?;

    let app = Router::new()
        .merge(edge.routes())
        .route("/", get(root_handler))
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Edge API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    edge.stop().await;
    Ok(())
}

async fn root_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "service": "Tidepool Edge",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "register": "POST /api/worker/register",
            "dispatch": "POST /api/service/{service_type}",
            "announce": "POST /api/coordinator/announce",
            "bootstrap": "GET /api/dht/bootstrap",
            "health": "GET /health"
        }
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
