//! # Configuration
//!
//! TOML-backed configuration for the three Tidepool processes. Every
//! section has complete defaults so a process can start with no config file
//! at all; binaries layer CLI flags on top.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration shared by all binaries. Each binary reads the
/// section it needs and ignores the rest, so one file can describe a whole
/// deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TidepoolConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub edge: EdgeConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub dht: DhtSettings,
}

/// Coordinator process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Identifier announced to the edge registry. Generated if empty.
    pub coordinator_id: String,
    /// Publicly reachable endpoint announced to the edge and handed to
    /// workers for direct heartbeats.
    pub public_endpoint: String,
    /// Region this coordinator serves.
    pub region: String,
    /// Edge router base URL for self-announcement. Empty disables the
    /// announce loop (standalone / test mode).
    pub edge_url: String,
    /// Seconds without a heartbeat before a worker turns STALE.
    pub stale_after_secs: u64,
    /// Multiplier on `stale_after_secs` before a worker is EXPIRED and
    /// purged.
    pub expire_multiplier: u64,
    /// Background sweep interval.
    pub sweep_interval_secs: u64,
    /// Self-announcement interval.
    pub announce_interval_secs: u64,
    /// Timeout for forwarded worker calls. Worker calls are never retried
    /// against the same worker; failure triggers reselection.
    pub worker_call_timeout_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            coordinator_id: String::new(),
            public_endpoint: "http://127.0.0.1:8080".to_string(),
            region: "default".to_string(),
            edge_url: String::new(),
            stale_after_secs: 90,
            expire_multiplier: 10,
            sweep_interval_secs: 15,
            announce_interval_secs: 30,
            worker_call_timeout_secs: 5,
        }
    }
}

impl CoordinatorConfig {
    /// Seconds without a heartbeat before a worker is purged.
    pub fn expire_after_secs(&self) -> u64 {
        self.stale_after_secs * self.expire_multiplier
    }
}

/// Edge router process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Region used when a request does not name one.
    pub default_region: String,
    /// TTL for cached coordinator records and region lists.
    pub cache_ttl_secs: u64,
    /// Coordinator records older than this are excluded from routing.
    pub staleness_window_secs: u64,
    /// Write suppression: load delta (fraction of 1.0) that forces a
    /// durable write.
    pub write_load_delta: f64,
    /// Write suppression: maximum seconds between durable writes for an
    /// otherwise-unchanged coordinator.
    pub max_write_interval_secs: u64,
    /// Registry store call timeout. Store calls get a single retry.
    pub store_timeout_secs: u64,
    /// Interval for the background sweep that deletes long-dead records
    /// from the backing store.
    pub store_sweep_interval_secs: u64,
    /// Records unseen for this many staleness windows are deleted by the
    /// sweep.
    pub sweep_after_windows: u64,
    /// Timeout for proxied coordinator calls.
    pub proxy_timeout_secs: u64,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            default_region: "default".to_string(),
            cache_ttl_secs: 30,
            staleness_window_secs: 120,
            write_load_delta: 0.20,
            max_write_interval_secs: 300,
            store_timeout_secs: 10,
            store_sweep_interval_secs: 60,
            sweep_after_windows: 10,
            proxy_timeout_secs: 10,
        }
    }
}

/// Worker agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Worker identifier. Generated (and logged) if empty.
    pub worker_id: String,
    /// Edge router base URL used for registration and DHT bootstrap.
    pub edge_url: String,
    /// Endpoint at which this worker accepts forwarded service calls.
    pub endpoint: String,
    /// Service types this worker offers.
    pub services: Vec<String>,
    /// Heartbeat interval.
    pub heartbeat_interval_secs: u64,
    /// Initial registration backoff; doubles per attempt up to the cap.
    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
    /// Connect/request timeouts for coordinator calls.
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            edge_url: "http://127.0.0.1:8081".to_string(),
            endpoint: "http://127.0.0.1:9000".to_string(),
            services: vec![],
            heartbeat_interval_secs: 30,
            backoff_initial_secs: 1,
            backoff_max_secs: 60,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

/// DHT overlay settings, shared by coordinator (bootstrap node) and agent
/// (publishing peer). The coordinator path stays available regardless of
/// this flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtSettings {
    pub enabled: bool,
    /// Static bootstrap peers (endpoint URLs). The agent also pulls seeds
    /// from the edge bootstrap endpoint.
    pub bootstrap_peers: Vec<String>,
    /// Bind address for the agent's standalone DHT listener. Coordinators
    /// mount the message endpoint on their API server instead.
    pub listen_addr: String,
    /// Address peers should use to reach this node's DHT listener.
    pub public_endpoint: String,
    /// Lookup timeout; a consumer falls back to the coordinator path once
    /// this elapses.
    pub lookup_timeout_ms: u64,
    /// Announcements older than this are dropped by readers.
    pub record_staleness_secs: u64,
    /// Replication factor for published records.
    pub replication: usize,
}

impl Default for DhtSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            bootstrap_peers: vec![],
            listen_addr: "0.0.0.0:7790".to_string(),
            public_endpoint: "http://127.0.0.1:7790".to_string(),
            lookup_timeout_ms: 800,
            record_staleness_secs: 300,
            replication: 3,
        }
    }
}

/// Load configuration from a TOML file. A missing file yields defaults so
/// fresh checkouts run without setup.
pub fn load_config(path: &str) -> Result<TidepoolConfig> {
    if !Path::new(path).exists() {
        tracing::warn!("Config file {} not found, using defaults", path);
        return Ok(TidepoolConfig::default());
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: TidepoolConfig =
        toml::from_str(&raw).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}
