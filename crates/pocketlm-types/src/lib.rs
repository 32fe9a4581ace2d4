//! Shared data model for the pocketlm workspace.
//!
//! Everything here is plain data: descriptors sourced from the catalog,
//! per-model download state, chat messages and conversation summaries.
//! Behaviour lives in `pocketlm-fetch` and `pocketlm-core`.

pub mod chat;
pub mod download;
pub mod model;
pub mod summary;

pub use chat::{messages_json, ChatMessage, Role};
pub use download::{DownloadEvent, DownloadState, DownloadStatus};
pub use model::{LoadedModelInfo, ModelDescriptor};
pub use summary::ConversationSummary;

/// File extension of a completed model file.
pub const MODEL_EXTENSION: &str = "gguf";

/// File extension of an in-progress model download.
pub const TEMP_EXTENSION: &str = "gguf.tmp";
