//! On-disk naming of model files.
//!
//! `<id>.gguf` is a finished model, `<id>.gguf.tmp` an in-progress one. The
//! existence of the final name is the only "is downloaded" signal.

use std::path::{Path, PathBuf};

use pocketlm_types::{MODEL_EXTENSION, TEMP_EXTENSION};

use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Complete,
    Partial,
}

/// A model file found by [`ModelLayout::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub model_id: String,
    pub kind: FileKind,
    pub path: PathBuf,
    pub len: u64,
}

#[derive(Debug, Clone)]
pub struct ModelLayout {
    dir: PathBuf,
}

impl ModelLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn final_path(&self, model_id: &str) -> PathBuf {
        self.dir.join(format!("{model_id}.{MODEL_EXTENSION}"))
    }

    pub fn temp_path(&self, model_id: &str) -> PathBuf {
        self.dir.join(format!("{model_id}.{TEMP_EXTENSION}"))
    }

    /// Ids become file names; reject anything that could escape the directory.
    pub fn validate_id(model_id: &str) -> Result<(), FetchError> {
        let bad = model_id.is_empty()
            || model_id == "."
            || model_id == ".."
            || model_id.contains(['/', '\\', '\0']);
        if bad {
            return Err(FetchError::InvalidModelId(model_id.to_owned()));
        }
        Ok(())
    }

    /// Map a file name to `(model_id, kind)` if it follows the layout.
    pub fn classify(file_name: &str) -> Option<(String, FileKind)> {
        let temp_suffix = format!(".{TEMP_EXTENSION}");
        let final_suffix = format!(".{MODEL_EXTENSION}");
        if let Some(id) = file_name.strip_suffix(&temp_suffix) {
            return (!id.is_empty()).then(|| (id.to_owned(), FileKind::Partial));
        }
        if let Some(id) = file_name.strip_suffix(&final_suffix) {
            return (!id.is_empty()).then(|| (id.to_owned(), FileKind::Complete));
        }
        None
    }

    /// List every complete and partial model file in the directory.
    ///
    /// A missing directory is an empty result, not an error.
    pub async fn scan(&self) -> Result<Vec<DiscoveredFile>, FetchError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some((model_id, kind)) = name.to_str().and_then(Self::classify) else {
                continue;
            };
            found.push(DiscoveredFile {
                model_id,
                kind,
                path: entry.path(),
                len: metadata.len(),
            });
        }
        found.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(found)
    }
}
