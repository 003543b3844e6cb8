//! # Core Types
//!
//! Fundamental types shared across the coordinator, edge router, worker
//! agent, and DHT subsystems.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a worker. Opaque and client-chosen; uniqueness is
/// enforced per coordinator, not globally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Unique identifier for a coordinator instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoordinatorId(String);

impl CoordinatorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CoordinatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CoordinatorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CoordinatorId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Capability tier assigned to a worker at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// GPU-backed worker, eligible for model inference workloads.
    Gpu,
    /// General service worker (CPU-bound extraction, parsing, embedding).
    Service,
    /// Storage/data worker for caching and shuttling artifacts.
    Data,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Gpu => write!(f, "gpu"),
            Tier::Service => write!(f, "service"),
            Tier::Data => write!(f, "data"),
        }
    }
}

/// Hardware descriptors reported by a worker at registration. Used only for
/// tier assignment; `extra` carries free-form descriptors that are stored
/// but never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    #[serde(default)]
    pub gpu_vram_gb: u32,
    #[serde(default)]
    pub cpu_cores: u32,
    #[serde(default)]
    pub ram_gb: u32,
    #[serde(default)]
    pub disk_gb: u32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Tier thresholds. VRAM >= 8 GB lands in the GPU tier regardless of CPU
/// shape; 2 cores + 4 GB RAM is enough for the service tier; anything that
/// still has a core and a gigabyte of disk can hold data. A report that
/// clears none of these is rejected.
pub const GPU_TIER_MIN_VRAM_GB: u32 = 8;
pub const SERVICE_TIER_MIN_CORES: u32 = 2;
pub const SERVICE_TIER_MIN_RAM_GB: u32 = 4;
pub const DATA_TIER_MIN_CORES: u32 = 1;
pub const DATA_TIER_MIN_DISK_GB: u32 = 1;

impl WorkerCapabilities {
    /// Deterministically assign a tier from the reported hardware.
    pub fn assign_tier(&self) -> TidepoolResult<Tier> {
        if self.gpu_vram_gb >= GPU_TIER_MIN_VRAM_GB {
            return Ok(Tier::Gpu);
        }
        if self.cpu_cores >= SERVICE_TIER_MIN_CORES && self.ram_gb >= SERVICE_TIER_MIN_RAM_GB {
            return Ok(Tier::Service);
        }
        if self.cpu_cores >= DATA_TIER_MIN_CORES && self.disk_gb >= DATA_TIER_MIN_DISK_GB {
            return Ok(Tier::Data);
        }
        Err(TidepoolError::InvalidCapabilities(format!(
            "no tier threshold met (vram={}GB cores={} ram={}GB disk={}GB)",
            self.gpu_vram_gb, self.cpu_cores, self.ram_gb, self.disk_gb
        )))
    }
}

/// Record describing a live coordinator, as held by the edge coordinator
/// registry. `last_seen` is unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorRecord {
    pub coordinator_id: CoordinatorId,
    pub endpoint: String,
    pub region: String,
    pub last_seen: u64,
}

/// Self-announcement a coordinator sends to the edge router. The trailing
/// fields exist only to feed the edge's write-suppression decision and are
/// not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorAnnounce {
    pub coordinator_id: CoordinatorId,
    pub endpoint: String,
    pub region: String,
    pub status: CoordinatorStatus,
    /// Aggregate load across the coordinator's active workers, [0, 1].
    pub load: f64,
    /// Service types currently offered by at least one active worker.
    pub services: Vec<String>,
}

/// Coarse health of a coordinator, carried on announcements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorStatus {
    Active,
    Draining,
}

/// Error types for the Tidepool coordination plane.
#[derive(Debug, thiserror::Error)]
pub enum TidepoolError {
    /// Registration payload met no tier threshold. Caller error; 422.
    #[error("invalid capabilities: {0}")]
    InvalidCapabilities(String),

    /// Heartbeat for a worker id the coordinator no longer holds. The
    /// caller must re-run full registration. 404.
    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    /// No ACTIVE worker currently offers the requested service. 503.
    #[error("no worker available for service '{0}'")]
    NoWorkerAvailable(String),

    /// No live coordinator for the target region, even after a forced
    /// registry refresh. 503.
    #[error("no coordinator available for region '{0}'")]
    ServiceUnavailable(String),

    /// Heartbeat carried an older logical timestamp than the stored record.
    /// Dropped silently at the API boundary; never user-facing.
    #[error("stale heartbeat for {worker}: sent {sent} < stored {stored}")]
    StaleHeartbeat {
        worker: WorkerId,
        sent: u64,
        stored: u64,
    },

    /// A downstream call (worker endpoint, coordinator, registry store)
    /// failed after candidate retry was exhausted. 502.
    #[error("upstream call failed: {0}")]
    Upstream(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type for Tidepool operations.
pub type TidepoolResult<T> = Result<T, TidepoolError>;

/// Current unix time in whole seconds.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_tier_assignment() {
        let caps = WorkerCapabilities {
            gpu_vram_gb: 12,
            cpu_cores: 1,
            ram_gb: 2,
            disk_gb: 0,
            ..Default::default()
        };
        assert_eq!(caps.assign_tier().unwrap(), Tier::Gpu);
    }

    #[test]
    fn test_service_tier_assignment() {
        let caps = WorkerCapabilities {
            gpu_vram_gb: 4, // below GPU threshold
            cpu_cores: 4,
            ram_gb: 8,
            disk_gb: 100,
            ..Default::default()
        };
        assert_eq!(caps.assign_tier().unwrap(), Tier::Service);
    }

    #[test]
    fn test_data_tier_assignment() {
        let caps = WorkerCapabilities {
            cpu_cores: 1,
            ram_gb: 1,
            disk_gb: 500,
            ..Default::default()
        };
        assert_eq!(caps.assign_tier().unwrap(), Tier::Data);
    }

    #[test]
    fn test_empty_capabilities_rejected() {
        let caps = WorkerCapabilities::default();
        assert!(matches!(
            caps.assign_tier(),
            Err(TidepoolError::InvalidCapabilities(_))
        ));
    }

    #[test]
    fn test_tier_boundary_is_inclusive() {
        let caps = WorkerCapabilities {
            gpu_vram_gb: GPU_TIER_MIN_VRAM_GB,
            ..Default::default()
        };
        assert_eq!(caps.assign_tier().unwrap(), Tier::Gpu);

        let caps = WorkerCapabilities {
            cpu_cores: SERVICE_TIER_MIN_CORES,
            ram_gb: SERVICE_TIER_MIN_RAM_GB,
            ..Default::default()
        };
        assert_eq!(caps.assign_tier().unwrap(), Tier::Service);
    }

    #[test]
    fn test_tier_serde_is_lowercase() {
        assert_eq!(serde_json::to_string(&Tier::Gpu).unwrap(), "\"gpu\"");
        let tier: Tier = serde_json::from_str("\"service\"").unwrap();
        assert_eq!(tier, Tier::Service);
    }

    #[test]
    fn test_worker_id_roundtrip() {
        let id = WorkerId::new("worker-1");
        assert_eq!(id.as_str(), "worker-1");
        assert_eq!(id.to_string(), "worker-1");
    }
}
