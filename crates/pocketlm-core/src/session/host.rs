use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use pocketlm_types::{LoadedModelInfo, TEMP_EXTENSION};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use super::inference::InferenceSession;
use super::{SessionConfig, SessionError};
use crate::device::MemoryProbe;
use crate::engine::EngineAvailability;
use crate::planner::LoadPlanner;
use crate::prompt::{ModelMetadata, Templater};

/// What to load.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub model_id: String,
    pub path: PathBuf,
    /// Extra text for family detection, e.g. the catalog's `family` field.
    pub family_hint: String,
    /// Upper bound on the context window; the planner may pick less.
    pub context_size: Option<u32>,
}

impl LoadRequest {
    pub fn new(model_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            model_id: model_id.into(),
            path: path.into(),
            family_hint: String::new(),
            context_size: None,
        }
    }

    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family_hint = family.into();
        self
    }

    pub fn with_context_size(mut self, context_size: u32) -> Self {
        self.context_size = Some(context_size);
        self
    }
}

/// Holds at most one loaded model.
pub struct ModelHost {
    engine: EngineAvailability,
    probe: Arc<dyn MemoryProbe>,
    planner: LoadPlanner,
    templater: Templater,
    config: SessionConfig,
    current: Mutex<Option<Arc<InferenceSession>>>,
}

impl std::fmt::Debug for ModelHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHost")
            .field("engine", &self.engine)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ModelHost {
    pub fn new(
        engine: EngineAvailability,
        probe: Arc<dyn MemoryProbe>,
        planner: LoadPlanner,
        templater: Templater,
        config: SessionConfig,
    ) -> Self {
        Self {
            engine,
            probe,
            planner,
            templater,
            config,
            current: Mutex::new(None),
        }
    }

    pub fn planner(&self) -> &LoadPlanner {
        &self.planner
    }

    pub fn probe(&self) -> &Arc<dyn MemoryProbe> {
        &self.probe
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.config
    }

    /// Load `request`, replacing whatever was loaded before.
    ///
    /// The previous model is unloaded before memory is probed. On any error
    /// the host is left with nothing loaded.
    #[instrument(skip(self, request), fields(model_id = %request.model_id))]
    pub async fn load(&self, request: LoadRequest) -> Result<Arc<InferenceSession>, SessionError> {
        let engine = match &self.engine {
            EngineAvailability::Available(engine) => Arc::clone(engine),
            EngineAvailability::Unavailable { reason } => {
                return Err(SessionError::EngineUnavailable {
                    reason: reason.clone(),
                });
            }
        };

        if temp_path(&request.path).exists() {
            warn!(path = %request.path.display(), "partial download present; load refused");
            return Err(SessionError::DownloadInProgress {
                model_id: request.model_id,
            });
        }

        let metadata = tokio::fs::metadata(&request.path)
            .await
            .map_err(|source| SessionError::ModelNotFound {
                path: request.path.clone(),
                source,
            })?;
        if !metadata.is_file() {
            return Err(SessionError::ModelNotFound {
                path: request.path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            });
        }
        let model_bytes = metadata.len();

        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            info!(previous = %previous.info().model_id, "unloading previous model");
            previous.unload().await;
        }

        let memory = self.probe.probe();
        let load_config = self
            .planner
            .plan(model_bytes, &memory, request.context_size)?;

        let native = engine.load(&request.path, &load_config).await?;
        let native: Arc<dyn crate::engine::EngineSession> = Arc::from(native);

        let metadata = ModelMetadata {
            name: request.model_id.clone(),
            family_hint: request.family_hint,
            path: Some(request.path.clone()),
            chat_template: native.chat_template(),
        };
        let info = LoadedModelInfo {
            model_id: request.model_id,
            path: request.path,
            context_size: load_config.context_size,
            loaded_at: Utc::now(),
        };
        info!(
            engine = engine.name(),
            context_size = info.context_size,
            embedded_template = metadata.chat_template.is_some(),
            "model loaded"
        );

        let session = Arc::new(InferenceSession::new(
            info,
            model_bytes,
            load_config,
            metadata,
            native,
            Arc::clone(&self.probe),
            self.planner.clone(),
            self.templater.clone(),
            self.config.clone(),
        ));
        *current = Some(Arc::clone(&session));
        Ok(session)
    }

    /// The loaded session, if it is still usable.
    pub async fn session(&self) -> Option<Arc<InferenceSession>> {
        let mut current = self.current.lock().await;
        match current.as_ref() {
            Some(session) if session.is_loaded() => Some(Arc::clone(session)),
            Some(_) => {
                // Dropped after an engine failure.
                *current = None;
                None
            }
            None => None,
        }
    }

    pub async fn loaded(&self) -> Option<LoadedModelInfo> {
        self.session().await.map(|s| s.info().clone())
    }

    pub async fn unload(&self) {
        if let Some(session) = self.current.lock().await.take() {
            session.unload().await;
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_stem().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(TEMP_EXTENSION);
    path.with_file_name(name)
}
