//! # Tidepool Worker Binary
//!
//! Donated-hardware agent: detects capabilities, registers through the
//! edge, heartbeats its coordinator, and (when the overlay is enabled)
//! publishes itself to the DHT.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::info;

use tidepool_node::agent::WorkerAgent;
use tidepool_node::config::load_config;
use tidepool_node::coordinator::dht_routes;

#[derive(Parser)]
#[command(name = "tidepool-worker")]
#[command(about = "Tidepool worker agent - capability detection and heartbeat loop")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/tidepool.toml")]
    config: String,

    /// Edge router URL (overrides config)
    #[arg(short, long)]
    edge_url: Option<String>,

    /// Comma-separated service types to offer (overrides config)
    #[arg(short, long)]
    services: Option<String>,
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

    let mut agent_config = config.agent;
    if let Some(edge_url) = cli.edge_url {
        agent_config.edge_url = edge_url;
    }
    if let Some(services) = cli.services {
        agent_config.services = services
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    let dht_listen = config.dht.listen_addr.clone();
    let agent = Arc::new(WorkerAgent::new(agent_config, config.dht)?);

    // Workers are full overlay peers: serve the DHT message endpoint so
    // other nodes can query records replicated here.
    if let Some(node) = agent.dht_node() {
        let addr: SocketAddr = dht_listen.parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("DHT listener on http://{}", addr);
        tokio::spawn(async move {
            let app = dht_routes(node);
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("DHT listener failed: {}", e);
            }
        });
    }

    info!(worker_id = %agent.worker_id(), "Starting worker agent");

    let runner = Arc::clone(&agent);
    tokio::select! {
        result = runner.run() => result,
        _ = shutdown_signal() => {
            // Unpublish is best-effort; the registry sweep and DHT
            // staleness filters cover an abrupt exit.
            agent.stop().await;
            Ok(())
        }
    }
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
