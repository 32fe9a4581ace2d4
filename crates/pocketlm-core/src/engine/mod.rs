//! Boundary to the native inference engine.
//!
//! The engine is an opaque capability: it loads a GGUF file into a session,
//! streams tokens for a prompt, and can be told to stop. Everything native is
//! assumed fallible, and a [`EngineError::Corrupted`] session must be torn
//! down and reloaded rather than retried.

mod errors;
mod registry;
#[cfg(test)]
pub(crate) mod scripted;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use errors::EngineError;
pub use registry::{EngineAvailability, EngineRegistry};

use crate::planner::LoadConfig;

/// A chunk of streaming output from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// A piece of generated text.
    Token(String),
    /// Generation completed normally.
    Done,
    /// Generation terminated due to a native error. The session is no longer
    /// trustworthy after this.
    Error(String),
}

/// Yields [`StreamChunk`] items as tokens are produced. The stream ends with
/// [`StreamChunk::Done`] or [`StreamChunk::Error`], or by the sender being
/// dropped.
pub type StreamHandle = mpsc::Receiver<StreamChunk>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub top_k: u32,
    pub top_p: f32,
    pub temperature: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            top_k: 40,
            top_p: 0.9,
            temperature: 0.7,
        }
    }
}

/// Per-call generation knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions {
    pub max_tokens: u32,
    /// Overrides the sampling temperature chosen at load time.
    pub temperature: Option<f32>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: None,
        }
    }
}

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn load(
        &self,
        path: &Path,
        config: &LoadConfig,
    ) -> Result<Box<dyn EngineSession>, EngineError>;
}

/// One loaded model.
#[async_trait]
pub trait EngineSession: Send + Sync {
    async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<StreamHandle, EngineError>;

    /// Ask the running generation to stop after its current token.
    fn cancel_generation(&self);

    /// The chat template embedded in the model's metadata, if any.
    fn chat_template(&self) -> Option<String>;

    /// Render `messages_json` with the embedded template natively.
    fn apply_chat_template(
        &self,
        _messages_json: &str,
        _append_assistant: bool,
    ) -> Result<String, EngineError> {
        Err(EngineError::Unsupported("apply_chat_template"))
    }

    async fn unload(&self) -> Result<(), EngineError>;
}
