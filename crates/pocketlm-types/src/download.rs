use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lifecycle of a single model file on this device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DownloadStatus {
    #[default]
    NotDownloaded,
    Downloading,
    Paused,
    Downloaded,
    Error,
}

/// Observable per-model download state.
///
/// Only the download manager mutates these; observers receive clones.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownloadState {
    pub model_id: String,
    pub status: DownloadStatus,
    pub downloaded_bytes: u64,
    /// `None` until the server (or the catalog) has told us the full size.
    pub total_bytes: Option<u64>,
    /// Set only when `status == Downloaded`.
    pub local_path: Option<PathBuf>,
    pub error_message: Option<String>,
}

impl DownloadState {
    pub fn not_downloaded(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Default::default()
        }
    }

    pub fn downloaded(model_id: impl Into<String>, path: PathBuf, size: u64) -> Self {
        Self {
            model_id: model_id.into(),
            status: DownloadStatus::Downloaded,
            downloaded_bytes: size,
            total_bytes: Some(size),
            local_path: Some(path),
            error_message: None,
        }
    }

    /// Fraction in `[0.0, 1.0]`; `0.0` while the total is unknown.
    pub fn progress(&self) -> f64 {
        match self.total_bytes {
            Some(total) if total > 0 => (self.downloaded_bytes as f64 / total as f64).min(1.0),
            _ => 0.0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == DownloadStatus::Downloading
    }
}

/// Notifications pushed to the host UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownloadEvent {
    Progress {
        model_id: String,
        progress: f64,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
    },
    Completed {
        model_id: String,
    },
    Failed {
        model_id: String,
        message: String,
    },
}

impl DownloadEvent {
    pub fn model_id(&self) -> &str {
        match self {
            DownloadEvent::Progress { model_id, .. }
            | DownloadEvent::Completed { model_id }
            | DownloadEvent::Failed { model_id, .. } => model_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_zero_until_total_known() {
        let mut state = DownloadState::not_downloaded("m");
        state.downloaded_bytes = 10;
        assert_eq!(state.progress(), 0.0);

        state.total_bytes = Some(40);
        assert!((state.progress() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn status_round_trips_through_strings() {
        assert_eq!(DownloadStatus::NotDownloaded.to_string(), "not_downloaded");
        let parsed: DownloadStatus = "paused".parse().expect("parse status");
        assert_eq!(parsed, DownloadStatus::Paused);
    }
}
