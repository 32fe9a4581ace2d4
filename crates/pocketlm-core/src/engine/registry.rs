use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::InferenceEngine;

/// Whether an engine can be used on this build / device.
#[derive(Clone)]
pub enum EngineAvailability {
    Available(Arc<dyn InferenceEngine>),
    Unavailable { reason: String },
}

impl EngineAvailability {
    pub fn is_available(&self) -> bool {
        matches!(self, EngineAvailability::Available(_))
    }
}

impl std::fmt::Debug for EngineAvailability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineAvailability::Available(engine) => {
                f.debug_tuple("Available").field(&engine.name()).finish()
            }
            EngineAvailability::Unavailable { reason } => f
                .debug_struct("Unavailable")
                .field("reason", reason)
                .finish(),
        }
    }
}

/// Named engines known to the host.
///
/// Engines that failed to initialise are recorded as `Unavailable` with a
/// reason rather than left out, so callers can tell "not built in" from
/// "broken here".
#[derive(Debug, Default)]
pub struct EngineRegistry {
    slots: BTreeMap<String, EngineAvailability>,
    preferred: Option<String>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first available engine registered becomes the preferred one.
    pub fn register(&mut self, engine: Arc<dyn InferenceEngine>) {
        let name = engine.name().to_owned();
        info!(engine = %name, "inference engine registered");
        if self.preferred.is_none() {
            self.preferred = Some(name.clone());
        }
        self.slots.insert(name, EngineAvailability::Available(engine));
    }

    pub fn register_unavailable(&mut self, name: impl Into<String>, reason: impl Into<String>) {
        let name = name.into();
        let reason = reason.into();
        warn!(engine = %name, %reason, "inference engine unavailable");
        self.slots
            .insert(name, EngineAvailability::Unavailable { reason });
    }

    pub fn resolve(&self, name: &str) -> EngineAvailability {
        self.slots
            .get(name)
            .cloned()
            .unwrap_or_else(|| EngineAvailability::Unavailable {
                reason: format!("no engine named '{name}' is registered"),
            })
    }

    pub fn preferred(&self) -> EngineAvailability {
        match &self.preferred {
            Some(name) => self.resolve(name),
            None => EngineAvailability::Unavailable {
                reason: self.unavailable_summary(),
            },
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    fn unavailable_summary(&self) -> String {
        let reasons: Vec<String> = self
            .slots
            .iter()
            .filter_map(|(name, slot)| match slot {
                EngineAvailability::Unavailable { reason } => Some(format!("{name}: {reason}")),
                EngineAvailability::Available(_) => None,
            })
            .collect();
        if reasons.is_empty() {
            "no inference engine is registered".to_owned()
        } else {
            reasons.join("; ")
        }
    }
}
