//! # Edge HTTP API
//!
//! Public-facing routes: worker registration and service dispatch proxies,
//! coordinator announcements, and DHT bootstrap seeds.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::coordinator::api::{error_response, ErrorResponse};
use crate::edge::router::{BootstrapSeed, EdgeRouter, ProxyReply};
use crate::types::CoordinatorAnnounce;

pub struct EdgeApiState {
    pub router: EdgeRouter,
    pub default_region: String,
}

/// Optional region override on proxied requests.
#[derive(Debug, Deserialize)]
pub struct RegionParams {
    pub region: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BootstrapResponse {
    pub seeds: Vec<BootstrapSeed>,
    /// Seconds the client may cache these seeds.
    pub ttl: u64,
}

pub fn edge_routes(state: Arc<EdgeApiState>) -> Router {
    Router::new()
        .route("/api/worker/register", post(proxy_register))
        .route("/api/service/:service_type", post(proxy_service))
        .route("/api/coordinator/announce", post(coordinator_announce))
        .route("/api/dht/bootstrap", get(dht_bootstrap))
        .route("/health", get(health))
        .with_state(state)
}

fn relay_reply(reply: ProxyReply) -> (StatusCode, Json<serde_json::Value>) {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(reply.body))
}

async fn proxy_register(
    State(state): State<Arc<EdgeApiState>>,
    Query(params): Query<RegionParams>,
    Json(payload): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, Json<ErrorResponse>)> {
    let region = params.region.as_deref().unwrap_or(&state.default_region);
    state
        .router
        .proxy_register(region, payload)
        .await
        .map(relay_reply)
        .map_err(|e| error_response(&e))
}

async fn proxy_service(
    State(state): State<Arc<EdgeApiState>>,
    Path(service_type): Path<String>,
    Query(params): Query<RegionParams>,
    Json(payload): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, Json<ErrorResponse>)> {
    let region = params.region.as_deref().unwrap_or(&state.default_region);
    state
        .router
        .proxy_service(region, &service_type, payload)
        .await
        .map(relay_reply)
        .map_err(|e| error_response(&e))
}

async fn coordinator_announce(
    State(state): State<Arc<EdgeApiState>>,
    Json(announce): Json<CoordinatorAnnounce>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let outcome = state
        .router
        .announce(announce)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(serde_json::json!({ "ok": true, "persisted": outcome.persisted })))
}

async fn dht_bootstrap(
    State(state): State<Arc<EdgeApiState>>,
    Query(params): Query<RegionParams>,
) -> Result<Json<BootstrapResponse>, (StatusCode, Json<ErrorResponse>)> {
    let region = params.region.as_deref().unwrap_or(&state.default_region);
    let (seeds, ttl) = state
        .router
        .bootstrap_seeds(region)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(BootstrapResponse { seeds, ttl }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
