use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("engine unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("failed to load model from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Native state is unusable; the session must be rebuilt.
    #[error("engine corrupted: {message}")]
    Corrupted { message: String },

    #[error("generation failed: {message}")]
    Generation { message: String },

    #[error("operation not supported by this engine: {0}")]
    Unsupported(&'static str),
}

impl EngineError {
    pub fn is_corrupted(&self) -> bool {
        matches!(self, EngineError::Corrupted { .. })
    }
}
