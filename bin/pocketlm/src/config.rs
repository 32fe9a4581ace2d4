//! Host configuration, loaded from environment variables at startup.

use std::path::PathBuf;

/// Runtime configuration for the `pocketlm` CLI.
///
/// Every field has a default so the CLI works without any environment
/// variables set. Command-line flags override what is read here.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `<id>.gguf` files (default: `<data dir>/pocketlm/models`).
    pub models_dir: PathBuf,

    /// JSON catalog of downloadable models (default: `<models dir>/catalog.json`).
    pub catalog_path: PathBuf,

    /// Optional TOML file with planner, session, templater and summarizer tuning.
    pub runtime_config: Option<PathBuf>,

    /// `tracing` filter string, e.g. `"info"` or `"debug,reqwest=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Also write daily-rotated log files here.
    pub log_dir: Option<PathBuf>,

    /// Explicit proxy for model downloads.
    pub proxy: Option<String>,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let models_dir = std::env::var_os("POCKETLM_MODELS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_models_dir);
        let catalog_path = std::env::var_os("POCKETLM_CATALOG")
            .map(PathBuf::from)
            .unwrap_or_else(|| models_dir.join("catalog.json"));

        Self {
            catalog_path,
            models_dir,
            runtime_config: std::env::var_os("POCKETLM_CONFIG").map(PathBuf::from),
            log_level: env_or("POCKETLM_LOG", "info"),
            log_json: std::env::var("POCKETLM_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            log_dir: std::env::var_os("POCKETLM_LOG_DIR").map(PathBuf::from),
            proxy: std::env::var("HTTPS_PROXY")
                .or_else(|_| std::env::var("HTTP_PROXY"))
                .ok()
                .filter(|v| !v.is_empty()),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn default_models_dir() -> PathBuf {
    dirs_next::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pocketlm")
        .join("models")
}
