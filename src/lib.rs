//! # Tidepool Coordination Plane
//!
//! Worker coordination and service discovery for a donated-compute pool:
//! coordinators own an ephemeral in-memory worker registry and route
//! service requests; the edge tier fans public traffic out to coordinators
//! under a strict registry read/write budget; worker agents self-register
//! and heartbeat; an optional Kademlia-style DHT lets consumers resolve
//! services peer-to-peer with a coordinator-path fallback.

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod dht;
pub mod edge;
pub mod types;

// Re-export commonly used types
pub use types::{
    CoordinatorAnnounce, CoordinatorId, CoordinatorRecord, CoordinatorStatus, Tier,
    TidepoolError, TidepoolResult, WorkerCapabilities, WorkerId,
};

// Re-export the coordinator surface
pub use coordinator::{
    Coordinator, HeartbeatSnapshot, Registration, TierAssignment, WorkerRecord, WorkerRegistry,
    WorkerStatus,
};

// Re-export the edge surface
pub use edge::{EdgeRouter, EdgeService, MemoryStore};

// Re-export the agent
pub use agent::WorkerAgent;

// Re-export DHT components
pub use dht::{DhtNode, DhtResolver, HttpDhtTransport, NodeId, WorkerAnnouncement};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
