//! End-to-end coordinator flow over real HTTP: registration, heartbeats,
//! dispatch to a stub worker, and expiry-driven recovery with shortened
//! timers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::Path, routing::post, Json, Router};
use serde_json::json;

use tidepool_node::config::{CoordinatorConfig, DhtSettings};
use tidepool_node::coordinator::Coordinator;

/// Serve an axum router on an ephemeral port, returning its base URL.
async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Stub worker that echoes dispatched payloads.
async fn spawn_stub_worker(name: &'static str) -> String {
    let app = Router::new().route(
        "/service/:service_type",
        post(move |Path(service): Path<String>, Json(payload): Json<serde_json::Value>| async move {
            Json(json!({ "worker": name, "service": service, "echo": payload }))
        }),
    );
    serve(app).await
}

async fn spawn_coordinator(config: CoordinatorConfig) -> (Arc<Coordinator>, String) {
    let coordinator = Arc::new(Coordinator::new(config, DhtSettings::default()).unwrap());
    let url = serve(coordinator.routes()).await;
    (coordinator, url)
}

fn quick_expiry_config() -> CoordinatorConfig {
    CoordinatorConfig {
        stale_after_secs: 1,
        expire_multiplier: 3,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_happy_path_register_heartbeat_dispatch() {
    let worker_url = spawn_stub_worker("worker-1").await;
    let (_coordinator, coord_url) = spawn_coordinator(CoordinatorConfig::default()).await;
    let client = reqwest::Client::new();

    // Register a GPU worker offering OCR.
    let response = client
        .post(format!("{}/worker/register", coord_url))
        .json(&json!({
            "worker_id": "worker-1",
            "endpoint": worker_url,
            "services": ["ocr"],
            "capabilities": { "gpu_vram_gb": 12, "cpu_cores": 8, "ram_gb": 32, "disk_gb": 500 }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["tier"], "gpu");
    assert_eq!(body["assigned_services"], json!(["ocr"]));
    assert!(body["coordinator_endpoint"].is_string());

    // Heartbeat keeps it active.
    let response = client
        .post(format!("{}/worker/heartbeat", coord_url))
        .json(&json!({ "worker_id": "worker-1", "load": 0.2, "cpu_percent": 20.0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["ok"], true);

    // Dispatch routes to the stub worker and relays its response.
    let response = client
        .post(format!("{}/service/ocr", coord_url))
        .json(&json!({ "document": "page-1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["worker"], "worker-1");
    assert_eq!(body["echo"]["document"], "page-1");

    // Diagnostics show the worker as active.
    let workers: serde_json::Value = client
        .get(format!("{}/admin/workers", coord_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(workers.as_array().unwrap().len(), 1);
    assert_eq!(workers[0]["status"], "active");
}

#[tokio::test]
async fn test_invalid_capabilities_rejected_with_422() {
    let (_coordinator, coord_url) = spawn_coordinator(CoordinatorConfig::default()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/worker/register", coord_url))
        .json(&json!({
            "worker_id": "worker-1",
            "endpoint": "http://worker.local:9000",
            "services": ["ocr"],
            "capabilities": {}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "invalid_capabilities");
}

#[tokio::test]
async fn test_heartbeat_for_unknown_worker_is_404() {
    let (_coordinator, coord_url) = spawn_coordinator(CoordinatorConfig::default()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/worker/heartbeat", coord_url))
        .json(&json!({ "worker_id": "never-registered", "load": 0.1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "unknown_worker");
}

#[tokio::test]
async fn test_dispatch_without_candidates_is_503() {
    let (_coordinator, coord_url) = spawn_coordinator(CoordinatorConfig::default()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/service/ocr", coord_url))
        .json(&json!({ "document": "page-1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "no_worker_available");
}

#[tokio::test]
async fn test_expiry_and_recovery() {
    // Shortened timers: stale after 1s, expired after 3s.
    let worker_url = spawn_stub_worker("worker-1").await;
    let (_coordinator, coord_url) = spawn_coordinator(quick_expiry_config()).await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/worker/register", coord_url))
        .json(&json!({
            "worker_id": "worker-1",
            "endpoint": worker_url,
            "services": ["ocr"],
            "capabilities": { "gpu_vram_gb": 12, "cpu_cores": 8, "ram_gb": 32, "disk_gb": 500 }
        }))
        .send()
        .await
        .unwrap();

    // Fresh registration dispatches fine.
    let response = client
        .post(format!("{}/service/ocr", coord_url))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Silence past the stale window: the only candidate is gone.
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let response = client
        .post(format!("{}/service/ocr", coord_url))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    // One heartbeat restores routing.
    let response = client
        .post(format!("{}/worker/heartbeat", coord_url))
        .json(&json!({ "worker_id": "worker-1", "load": 0.1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .post(format!("{}/service/ocr", coord_url))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_load_based_selection_over_http() {
    let low_url = spawn_stub_worker("worker-low").await;
    let high_url = spawn_stub_worker("worker-high").await;
    let (_coordinator, coord_url) = spawn_coordinator(CoordinatorConfig::default()).await;
    let client = reqwest::Client::new();

    for (id, url) in [("worker-high", &high_url), ("worker-low", &low_url)] {
        client
            .post(format!("{}/worker/register", coord_url))
            .json(&json!({
                "worker_id": id,
                "endpoint": url,
                "services": ["ocr"],
                "capabilities": { "gpu_vram_gb": 12, "cpu_cores": 8, "ram_gb": 32, "disk_gb": 500 }
            }))
            .send()
            .await
            .unwrap();
    }

    client
        .post(format!("{}/worker/heartbeat", coord_url))
        .json(&json!({ "worker_id": "worker-high", "load": 0.8 }))
        .send()
        .await
        .unwrap();
    client
        .post(format!("{}/worker/heartbeat", coord_url))
        .json(&json!({ "worker_id": "worker-low", "load": 0.2 }))
        .send()
        .await
        .unwrap();

    let body: serde_json::Value = client
        .post(format!("{}/service/ocr", coord_url))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["worker"], "worker-low");
}

#[tokio::test]
async fn test_failed_worker_triggers_fallback_to_other_candidate() {
    // First candidate's endpoint is dead; dispatch must fall back to the
    // live one rather than retry the corpse.
    let live_url = spawn_stub_worker("worker-live").await;
    let (_coordinator, coord_url) = spawn_coordinator(CoordinatorConfig::default()).await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/worker/register", coord_url))
        .json(&json!({
            "worker_id": "worker-dead",
            "endpoint": "http://127.0.0.1:1",
            "services": ["ocr"],
            "capabilities": { "gpu_vram_gb": 12, "cpu_cores": 8, "ram_gb": 32, "disk_gb": 500 }
        }))
        .send()
        .await
        .unwrap();
    client
        .post(format!("{}/worker/register", coord_url))
        .json(&json!({
            "worker_id": "worker-live",
            "endpoint": live_url,
            "services": ["ocr"],
            "capabilities": { "gpu_vram_gb": 12, "cpu_cores": 8, "ram_gb": 32, "disk_gb": 500 }
        }))
        .send()
        .await
        .unwrap();

    // Make the dead worker the preferred candidate.
    client
        .post(format!("{}/worker/heartbeat", coord_url))
        .json(&json!({ "worker_id": "worker-dead", "load": 0.0 }))
        .send()
        .await
        .unwrap();
    client
        .post(format!("{}/worker/heartbeat", coord_url))
        .json(&json!({ "worker_id": "worker-live", "load": 0.5 }))
        .send()
        .await
        .unwrap();

    let response = client
        .post(format!("{}/service/ocr", coord_url))
        .json(&json!({ "document": "page-1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["worker"], "worker-live");
}
