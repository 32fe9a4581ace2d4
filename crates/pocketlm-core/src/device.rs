//! Live device telemetry consumed by the load planner.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

const MB: u64 = 1024 * 1024;

/// A point-in-time memory reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMemory {
    pub total_bytes: u64,
    pub available_bytes: u64,
    /// The platform's own low-memory verdict.
    pub low_memory: bool,
    pub cpu_cores: usize,
}

impl DeviceMemory {
    pub fn new(total_bytes: u64, available_bytes: u64, cpu_cores: usize) -> Self {
        Self {
            total_bytes,
            available_bytes,
            low_memory: false,
            cpu_cores,
        }
    }

    pub fn with_low_memory(mut self, low_memory: bool) -> Self {
        self.low_memory = low_memory;
        self
    }
}

impl std::fmt::Display for DeviceMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total {:.2} GB, available {:.2} GB, {} cores{}",
            self.total_bytes as f64 / 1_073_741_824.0,
            self.available_bytes as f64 / 1_073_741_824.0,
            self.cpu_cores,
            if self.low_memory { ", LOW MEMORY" } else { "" }
        )
    }
}

pub trait MemoryProbe: Send + Sync {
    fn probe(&self) -> DeviceMemory;
}

/// Reads memory and core counts from the OS through `sysinfo`.
///
/// Desktop platforms have no low-memory broadcast, so `low_memory` is derived
/// from `available < low_memory_threshold_bytes`.
pub struct SystemProbe {
    system: Mutex<sysinfo::System>,
    low_memory_threshold_bytes: u64,
}

impl SystemProbe {
    pub fn new(low_memory_threshold_bytes: u64) -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
            low_memory_threshold_bytes,
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new(512 * MB)
    }
}

impl std::fmt::Debug for SystemProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProbe")
            .field("low_memory_threshold_bytes", &self.low_memory_threshold_bytes)
            .finish_non_exhaustive()
    }
}

impl MemoryProbe for SystemProbe {
    fn probe(&self) -> DeviceMemory {
        let mut sys = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sys.refresh_memory();
        sys.refresh_cpu_all();

        let total = sys.total_memory();
        let available = sys.available_memory();
        let cpu_cores = match sys.cpus().len() {
            // Fallback for sandboxes that hide /proc/cpuinfo.
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        };

        let memory = DeviceMemory {
            total_bytes: total,
            available_bytes: available,
            low_memory: available < self.low_memory_threshold_bytes,
            cpu_cores,
        };
        debug!(%memory, "device memory probed");
        memory
    }
}

/// A probe that always reports the same reading.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub DeviceMemory);

impl MemoryProbe for FixedProbe {
    fn probe(&self) -> DeviceMemory {
        self.0
    }
}
