//! # Tidepool Coordinator Binary
//!
//! Per-region coordinator: worker registry, health sweep, service routing,
//! and self-announcement to the edge layer.

use std::net::SocketAddr;

use anyhow::Result;
use axum::{routing::get, Router};
use clap::Parser;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tracing::info;

use tidepool_node::config::load_config;
use tidepool_node::coordinator::Coordinator;

#[derive(Parser)]
#[command(name = "tidepool-coordinator")]
#[command(about = "Tidepool coordinator - worker registry and service routing")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/tidepool.toml")]
    config: String,

    /// HTTP API port
    #[arg(short, long, default_value = "8080")]
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

    let coordinator = Coordinator::new(config.coordinator, config.dht)?;
    coordinator.start().await?;

    let app = Router::new()
        .merge(coordinator.routes())
        .route("/", get(root_handler))
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Coordinator API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    coordinator.stop().await;
    Ok(())
}

async fn root_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "service": "Tidepool Coordinator",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "register": "POST /worker/register",
            "heartbeat": "POST /worker/heartbeat",
            "dispatch": "POST /service/{service_type}",
            "workers": "GET /admin/workers",
            "stats": "GET /admin/stats",
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
