//! Source of downloadable model descriptors.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use pocketlm_types::ModelDescriptor;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("catalog is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("catalog source unavailable: {0}")]
    Unavailable(String),
}

/// A versioned list of model descriptors.
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// Cheap check; a changed value means [`ModelCatalog::fetch`] must be
    /// called again.
    async fn version(&self) -> Result<String, CatalogError>;

    async fn fetch(&self) -> Result<Vec<ModelDescriptor>, CatalogError>;
}

/// On-disk catalog format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDocument {
    pub version: String,
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
}

/// Catalog read from a local JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileCatalog {
    path: PathBuf,
}

impl JsonFileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read(&self) -> Result<CatalogDocument, CatalogError> {
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|source| CatalogError::Read {
                path: self.path.clone(),
                source,
            })?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[async_trait]
impl ModelCatalog for JsonFileCatalog {
    async fn version(&self) -> Result<String, CatalogError> {
        Ok(self.read().await?.version)
    }

    async fn fetch(&self) -> Result<Vec<ModelDescriptor>, CatalogError> {
        Ok(self.read().await?.models)
    }
}

struct Cached {
    version: String,
    models: Arc<Vec<ModelDescriptor>>,
}

/// Memoizes a [`ModelCatalog`], refetching only when its version changes.
pub struct CatalogCache<C> {
    source: C,
    cached: Mutex<Option<Cached>>,
}

impl<C: ModelCatalog> CatalogCache<C> {
    pub fn new(source: C) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    pub async fn models(&self) -> Result<Arc<Vec<ModelDescriptor>>, CatalogError> {
        let version = self.source.version().await?;
        let mut cached = self.cached.lock().await;

        if let Some(hit) = cached.as_ref().filter(|c| c.version == version) {
            debug!(%version, "catalog cache hit");
            return Ok(Arc::clone(&hit.models));
        }

        let models = Arc::new(self.source.fetch().await?);
        info!(%version, count = models.len(), "catalog refreshed");
        *cached = Some(Cached {
            version,
            models: Arc::clone(&models),
        });
        Ok(models)
    }

    pub async fn find(&self, model_id: &str) -> Result<Option<ModelDescriptor>, CatalogError> {
        Ok(self
            .models()
            .await?
            .iter()
            .find(|m| m.id == model_id)
            .cloned())
    }

    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}
