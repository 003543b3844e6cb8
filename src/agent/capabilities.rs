//! # Capability Detection
//!
//! One-shot hardware probe run at agent startup, plus the load probe
//! sampled on every heartbeat. GPU detection goes through NVML when the
//! `gpu-metrics` feature is enabled and falls back to the
//! `TIDEPOOL_GPU_VRAM_GB` override otherwise, so donated machines without
//! NVIDIA tooling can still declare a GPU.

use sysinfo::System;
use tracing::{debug, warn};

use crate::types::WorkerCapabilities;

const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Detect the machine's capabilities. Called once; capability changes
/// require an agent restart (and thus a re-registration).
pub fn detect() -> WorkerCapabilities {
    let mut system = System::new_all();
    system.refresh_memory();

    let cpu_cores = num_cpus::get() as u32;
    let ram_gb = (system.total_memory() / BYTES_PER_GB) as u32;

    let disks = sysinfo::Disks::new_with_refreshed_list();
    let disk_gb = (disks
        .iter()
        .map(|disk| disk.available_space())
        .sum::<u64>()
        / BYTES_PER_GB) as u32;

    let gpu_vram_gb = detect_gpu_vram_gb();

    let mut capabilities = WorkerCapabilities {
        gpu_vram_gb,
        cpu_cores,
        ram_gb,
        disk_gb,
        ..Default::default()
    };

    if let Some(hostname) = System::host_name() {
        capabilities
            .extra
            .insert("hostname".to_string(), serde_json::json!(hostname));
    }
    if let Some(os) = System::long_os_version() {
        capabilities
            .extra
            .insert("os".to_string(), serde_json::json!(os));
    }

    debug!(
        gpu_vram_gb,
        cpu_cores, ram_gb, disk_gb, "Detected capabilities"
    );
    capabilities
}

#[cfg(feature = "gpu-metrics")]
fn detect_gpu_vram_gb() -> u32 {
    match nvml_wrapper::Nvml::init() {
        Ok(nvml) => {
            let count = nvml.device_count().unwrap_or(0);
            let mut max_vram = 0u64;
            for index in 0..count {
                if let Ok(device) = nvml.device_by_index(index) {
                    if let Ok(memory) = device.memory_info() {
                        max_vram = max_vram.max(memory.total);
                    }
                }
            }
            (max_vram / BYTES_PER_GB) as u32
        }
        Err(e) => {
            warn!("NVML unavailable ({}), checking env override", e);
            gpu_vram_from_env()
        }
    }
}

#[cfg(not(feature = "gpu-metrics"))]
fn detect_gpu_vram_gb() -> u32 {
    gpu_vram_from_env()
}

fn gpu_vram_from_env() -> u32 {
    match std::env::var("TIDEPOOL_GPU_VRAM_GB") {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("Ignoring unparseable TIDEPOOL_GPU_VRAM_GB={}", value);
            0
        }),
        Err(_) => 0,
    }
}

/// Samples CPU load for heartbeat snapshots. Keeps the `sysinfo` handle
/// alive between samples so usage deltas are meaningful.
pub struct LoadProbe {
    system: System,
}

impl LoadProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self { system }
    }

    /// Current CPU utilization as (load fraction, percent).
    pub fn sample(&mut self) -> (f64, f64) {
        self.system.refresh_cpu_usage();
        let percent = self.system.global_cpu_usage() as f64;
        ((percent / 100.0).clamp(0.0, 1.0), percent)
    }
}

impl Default for LoadProbe {
    fn default() -> Self {
        Self::new()
    }
}
