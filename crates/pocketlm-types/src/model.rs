use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A downloadable model as published by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub download_url: String,
    pub size_bytes: u64,
    /// Free-text hint used for prompt-format detection, e.g. `"qwen2.5"`.
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub recommended: bool,
    /// Lower-case hex SHA-256 of the complete file, when the catalog knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, download_url: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            id: id.into(),
            download_url: download_url.into(),
            size_bytes,
            family: String::new(),
            recommended: false,
            sha256: None,
        }
    }

    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family = family.into();
        self
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }
}

/// The model currently held by the inference host.
///
/// `context_size` is the effective value the planner settled on, which may be
/// smaller than what the caller asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedModelInfo {
    pub model_id: String,
    pub path: PathBuf,
    pub context_size: u32,
    pub loaded_at: DateTime<Utc>,
}
