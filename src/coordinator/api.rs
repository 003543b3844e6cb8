//! # Coordinator HTTP API
//!
//! Endpoints consumed by worker agents (register, heartbeat) and by the
//! edge router (service dispatch). Diagnostics live under `/admin`.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coordinator::registry::{
    HeartbeatSnapshot, Registration, RegistryStats, TierAssignment, WorkerRegistry, WorkerView,
};
use crate::coordinator::router::ServiceRouter;
use crate::types::{unix_now, TidepoolError, WorkerCapabilities, WorkerId};

/// Shared state behind the coordinator's router.
pub struct CoordinatorApiState {
    pub registry: Arc<WorkerRegistry>,
    pub router: ServiceRouter,
    /// Endpoint handed to workers for direct heartbeats.
    pub public_endpoint: String,
    /// Interval suggestion returned on every heartbeat.
    pub recommended_heartbeat_secs: u64,
}

/// Registration request from a worker agent.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub worker_id: String,
    pub endpoint: String,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub capabilities: WorkerCapabilities,
}

/// Registration response: the tier assignment plus the endpoint the worker
/// should heartbeat against (this coordinator, even when registration was
/// proxied through the edge).
#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    #[serde(flatten)]
    pub assignment: TierAssignment,
    pub coordinator_endpoint: String,
}

/// Heartbeat request from a worker agent.
#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: String,
    /// Sender-side unix seconds; defaults to arrival time when omitted.
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub load: f64,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub loaded_models: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub heartbeat_interval_secs: u64,
}

/// Error body shared by coordinator and edge handlers.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Map a domain error onto its HTTP-equivalent status.
pub fn error_response(err: &TidepoolError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, code) = match err {
        TidepoolError::InvalidCapabilities(_) => {
            (StatusCode::UNPROCESSABLE_ENTITY, "invalid_capabilities")
        }
        TidepoolError::UnknownWorker(_) => (StatusCode::NOT_FOUND, "unknown_worker"),
        TidepoolError::NoWorkerAvailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "no_worker_available")
        }
        TidepoolError::ServiceUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
        }
        TidepoolError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_failed"),
        TidepoolError::StaleHeartbeat { .. } | TidepoolError::Config(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: code.to_string(),
        }),
    )
}

/// Build the coordinator's route table.
pub fn coordinator_routes(state: Arc<CoordinatorApiState>) -> Router {
    Router::new()
        .route("/worker/register", post(register_worker))
        .route("/worker/heartbeat", post(worker_heartbeat))
        .route("/service/:service_type", post(dispatch_service))
        .route("/admin/workers", get(admin_workers))
        .route("/admin/stats", get(admin_stats))
        .route("/health", get(health))
        .with_state(state)
}

async fn register_worker(
    State(state): State<Arc<CoordinatorApiState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, (StatusCode, Json<ErrorResponse>)> {
    if req.worker_id.trim().is_empty() {
        return Err(error_response(&TidepoolError::InvalidCapabilities(
            "worker_id must not be empty".to_string(),
        )));
    }
    if req.endpoint.trim().is_empty() {
        return Err(error_response(&TidepoolError::InvalidCapabilities(
            "endpoint must not be empty".to_string(),
        )));
    }

    let assignment = state
        .registry
        .register(Registration {
            worker_id: WorkerId::from(req.worker_id),
            endpoint: req.endpoint,
            services: req.services,
            capabilities: req.capabilities,
        })
        .await
        .map_err(|e| error_response(&e))?;

    Ok(Json(RegisterResponse {
        assignment,
        coordinator_endpoint: state.public_endpoint.clone(),
    }))
}

async fn worker_heartbeat(
    State(state): State<Arc<CoordinatorApiState>>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, (StatusCode, Json<ErrorResponse>)> {
    let snapshot = HeartbeatSnapshot {
        worker_id: WorkerId::from(req.worker_id),
        timestamp: req.timestamp.unwrap_or_else(unix_now),
        load: req.load,
        cpu_percent: req.cpu_percent,
        loaded_models: req.loaded_models.into_iter().collect::<HashSet<_>>(),
    };

    match state.registry.heartbeat(snapshot).await {
        Ok(()) => {}
        // Reordered/duplicate delivery is not a caller failure: drop it
        // and answer as if applied.
        Err(TidepoolError::StaleHeartbeat { .. }) => {
            debug!("Stale heartbeat dropped");
        }
        Err(e) => return Err(error_response(&e)),
    }

    Ok(Json(HeartbeatResponse {
        ok: true,
        heartbeat_interval_secs: state.recommended_heartbeat_secs,
    }))
}

async fn dispatch_service(
    State(state): State<Arc<CoordinatorApiState>>,
    Path(service_type): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    state
        .router
        .dispatch(&service_type, payload)
        .await
        .map(Json)
        .map_err(|e| error_response(&e))
}

async fn admin_workers(
    State(state): State<Arc<CoordinatorApiState>>,
) -> Json<Vec<WorkerView>> {
    Json(state.registry.list().await)
}

async fn admin_stats(State(state): State<Arc<CoordinatorApiState>>) -> Json<RegistryStats> {
    Json(state.registry.stats().await)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
