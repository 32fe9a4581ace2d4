//! Loaded-model lifecycle and token generation.

mod host;
mod inference;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use host::{LoadRequest, ModelHost};
pub use inference::{Generation, GenerationStream, InferenceSession};

use crate::engine::EngineError;
use crate::planner::PlanError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no model is loaded")]
    NotLoaded,

    #[error("inference engine unavailable: {reason}")]
    EngineUnavailable { reason: String },

    #[error("model file {path} cannot be read")]
    ModelNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("model {model_id} is still being downloaded")]
    DownloadInProgress { model_id: String },

    #[error("insufficient memory: {0}")]
    Memory(#[from] PlanError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("another generation is running")]
    Busy,

    #[error("no token produced within {timeout_ms} ms of prefill")]
    PrefillTimeout { timeout_ms: u64 },

    #[error("generation cancelled before any token was produced")]
    Cancelled,
}

impl SessionError {
    /// The session was torn down and the model must be loaded again.
    pub fn requires_reload(&self) -> bool {
        matches!(self, SessionError::Engine(_) | SessionError::NotLoaded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Rough characters per token used to size the prompt budget.
    pub chars_per_token: f64,
    /// Fraction of the estimated budget actually used.
    pub prompt_safety_margin: f64,
    pub prefill_timeout_ms: u64,
    /// Emitted as the only token when the engine produces nothing.
    pub empty_output_placeholder: String,
    /// Caps `GenerateOptions::max_tokens` of every request.
    pub max_tokens: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chars_per_token: 4.0,
            prompt_safety_margin: 0.8,
            prefill_timeout_ms: 30_000,
            empty_output_placeholder:
                "[The model returned no text. Its prompt format may not match this model.]"
                    .to_owned(),
            max_tokens: 512,
        }
    }
}

impl SessionConfig {
    /// Character budget for the conversation content given a batch size.
    pub fn prompt_budget(&self, batch_size: u32) -> usize {
        (f64::from(batch_size) * self.chars_per_token * self.prompt_safety_margin) as usize
    }

    pub fn prefill_timeout(&self) -> Duration {
        Duration::from_millis(self.prefill_timeout_ms)
    }
}
