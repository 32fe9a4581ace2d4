//! Adaptive load planning.
//!
//! Turns a model file size plus a live [`DeviceMemory`] reading into the
//! engine parameters for one load, or refuses the load. The order of checks
//! matters: the total-RAM floor is evaluated before anything that depends on
//! currently free memory, so a device that can never hold the model is
//! rejected even while it happens to be idle.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::device::DeviceMemory;
use crate::engine::SamplingParams;

const MB: u64 = 1_000_000;
const GB: u64 = 1_000_000_000;

fn gb(bytes: &u64) -> f64 {
    *bytes as f64 / GB as f64
}

fn mb(bytes: &u64) -> f64 {
    *bytes as f64 / MB as f64
}

fn low_memory_note(low_memory: &bool) -> &'static str {
    if *low_memory {
        "; the system reports low memory"
    } else {
        ""
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error(
        "device has {:.2} GB of RAM but a {:.2} GB model needs at least {:.2} GB",
        gb(.total_bytes),
        gb(.model_bytes),
        gb(.required_bytes)
    )]
    InsufficientTotalMemory {
        model_bytes: u64,
        total_bytes: u64,
        required_bytes: u64,
    },

    #[error(
        "only {:.2} GB free (needs {:.2} GB){}",
        gb(.available_bytes),
        gb(.required_bytes),
        low_memory_note(.low_memory)
    )]
    InsufficientAvailableMemory {
        model_bytes: u64,
        available_bytes: u64,
        required_bytes: u64,
        low_memory: bool,
    },

    #[error(
        "{:.0} MB would remain after loading; at least {:.0} MB is required",
        mb(.effective_bytes),
        mb(.floor_bytes)
    )]
    BelowViabilityFloor { effective_bytes: u64, floor_bytes: u64 },
}

/// Models up to `max_model_bytes` need at least `min_total_bytes` of RAM.
/// A tier without `max_model_bytes` covers every larger model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalMemoryTier {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_model_bytes: Option<u64>,
    pub min_total_bytes: u64,
}

/// `value` applies once effective memory reaches `min_effective_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub min_effective_bytes: u64,
    pub value: u32,
}

/// Every threshold the planner uses. The defaults are field-tuned guesses,
/// not derived limits; override them per target device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Ascending by `max_model_bytes`. Models larger than every tier use the
    /// last tier's floor.
    pub total_memory_tiers: Vec<TotalMemoryTier>,
    pub fixed_headroom_bytes: u64,
    /// Fraction of the model size reserved on top of the model itself.
    pub proportional_headroom: f64,
    pub viability_floor_bytes: u64,
    pub max_threads: usize,
    /// Devices with less total RAM than this get at most
    /// `constrained_max_threads` threads.
    pub constrained_total_bytes: u64,
    pub constrained_max_threads: usize,
    /// Descending by `min_effective_bytes`.
    pub batch_steps: Vec<Step>,
    pub min_batch_size: u32,
    /// Descending by `min_effective_bytes`.
    pub context_steps: Vec<Step>,
    pub min_context_size: u32,
    pub kv_bytes_per_token: u64,
    pub sampling: SamplingParams,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            total_memory_tiers: vec![
                TotalMemoryTier {
                    max_model_bytes: Some(600 * MB),
                    min_total_bytes: 3 * GB,
                },
                TotalMemoryTier {
                    max_model_bytes: Some(2_500 * MB),
                    min_total_bytes: 6 * GB,
                },
                TotalMemoryTier {
                    max_model_bytes: Some(5 * GB),
                    min_total_bytes: 8 * GB,
                },
                TotalMemoryTier {
                    max_model_bytes: None,
                    min_total_bytes: 12 * GB,
                },
            ],
            fixed_headroom_bytes: 500 * MB,
            proportional_headroom: 0.25,
            viability_floor_bytes: 256 * MB,
            max_threads: 8,
            constrained_total_bytes: 8 * GB,
            constrained_max_threads: 4,
            batch_steps: vec![
                Step { min_effective_bytes: 2 * GB, value: 512 },
                Step { min_effective_bytes: GB, value: 256 },
                Step { min_effective_bytes: 512 * MB, value: 128 },
                Step { min_effective_bytes: 0, value: 64 },
            ],
            min_batch_size: 32,
            context_steps: vec![
                Step { min_effective_bytes: 3 * GB, value: 4096 },
                Step { min_effective_bytes: 1_500 * MB, value: 2048 },
                Step { min_effective_bytes: 768 * MB, value: 1024 },
                Step { min_effective_bytes: 0, value: 512 },
            ],
            min_context_size: 512,
            kv_bytes_per_token: 64 * 1024,
            sampling: SamplingParams::default(),
        }
    }
}

/// Engine parameters for one load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadConfig {
    pub context_size: u32,
    pub threads: u32,
    pub threads_batch: u32,
    pub batch_size: u32,
    pub kv_cache_budget_bytes: u64,
    pub effective_available_bytes: u64,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub sampling: SamplingParams,
}

#[derive(Debug, Clone, Default)]
pub struct LoadPlanner {
    config: PlannerConfig,
}

impl LoadPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Minimum total RAM for a model of `model_bytes`.
    pub fn required_total(&self, model_bytes: u64) -> u64 {
        self.config
            .total_memory_tiers
            .iter()
            .find(|tier| tier.max_model_bytes.is_none_or(|max| model_bytes <= max))
            .or(self.config.total_memory_tiers.last())
            .map_or(0, |tier| tier.min_total_bytes)
    }

    /// The free-memory check on its own, as run before every generation.
    pub fn preflight(&self, model_bytes: u64, memory: &DeviceMemory) -> Result<(), PlanError> {
        let required = model_bytes.saturating_add(self.config.fixed_headroom_bytes);
        if memory.low_memory || memory.available_bytes < required {
            return Err(PlanError::InsufficientAvailableMemory {
                model_bytes,
                available_bytes: memory.available_bytes,
                required_bytes: required,
                low_memory: memory.low_memory,
            });
        }
        Ok(())
    }

    pub fn plan(
        &self,
        model_bytes: u64,
        memory: &DeviceMemory,
        requested_context: Option<u32>,
    ) -> Result<LoadConfig, PlanError> {
        let result = self.plan_inner(model_bytes, memory, requested_context);
        match &result {
            Ok(config) => info!(
                model_bytes,
                context_size = config.context_size,
                batch_size = config.batch_size,
                threads = config.threads,
                effective_available = config.effective_available_bytes,
                "load planned"
            ),
            Err(e) => warn!(model_bytes, %memory, error = %e, "load rejected"),
        }
        result
    }

    fn plan_inner(
        &self,
        model_bytes: u64,
        memory: &DeviceMemory,
        requested_context: Option<u32>,
    ) -> Result<LoadConfig, PlanError> {
        let cfg = &self.config;

        let required_total = self.required_total(model_bytes);
        if memory.total_bytes < required_total {
            return Err(PlanError::InsufficientTotalMemory {
                model_bytes,
                total_bytes: memory.total_bytes,
                required_bytes: required_total,
            });
        }

        self.preflight(model_bytes, memory)?;

        let proportional = (model_bytes as f64 * cfg.proportional_headroom) as u64;
        let effective = memory
            .available_bytes
            .saturating_sub(model_bytes)
            .saturating_sub(proportional);
        if effective < cfg.viability_floor_bytes {
            return Err(PlanError::BelowViabilityFloor {
                effective_bytes: effective,
                floor_bytes: cfg.viability_floor_bytes,
            });
        }

        let mut threads = memory.cpu_cores.min(cfg.max_threads);
        if memory.total_bytes < cfg.constrained_total_bytes {
            threads = threads.min(cfg.constrained_max_threads);
        }
        let threads = u32::try_from(threads.max(1)).unwrap_or(1);

        let batch_size = step_value(&cfg.batch_steps, effective).max(cfg.min_batch_size);
        let tier_context = step_value(&cfg.context_steps, effective).max(cfg.min_context_size);
        let context_size = requested_context
            .unwrap_or(tier_context)
            .min(tier_context)
            .max(cfg.min_context_size);

        let kv_cache_budget_bytes =
            (u64::from(context_size) * cfg.kv_bytes_per_token).min(effective);

        Ok(LoadConfig {
            context_size,
            threads,
            threads_batch: threads,
            batch_size,
            kv_cache_budget_bytes,
            effective_available_bytes: effective,
            use_mmap: true,
            use_mlock: false,
            sampling: cfg.sampling.clone(),
        })
    }
}

/// First step whose threshold `effective` reaches; 0 when none does.
fn step_value(steps: &[Step], effective: u64) -> u32 {
    steps
        .iter()
        .find(|step| effective >= step.min_effective_bytes)
        .map_or(0, |step| step.value)
}
