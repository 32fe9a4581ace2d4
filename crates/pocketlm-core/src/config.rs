//! File-backed tuning for the runtime.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::planner::PlannerConfig;
use crate::prompt::TemplaterConfig;
use crate::session::SessionConfig;
use crate::summarizer::SummarizerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("could not serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Every tunable of the runtime. Missing sections and keys keep their
/// defaults, so an empty file is a valid config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub planner: PlannerConfig,
    pub session: SessionConfig,
    pub templater: TemplaterConfig,
    pub summarizer: SummarizerConfig,
}

impl RuntimeConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::TemplateStrategy;

    #[test]
    fn empty_file_is_all_defaults() {
        assert_eq!(RuntimeConfig::from_toml_str("").unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn partial_sections_override_only_named_keys() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [planner]
            fixed_headroom_bytes = 750000000
            max_threads = 2

            [session]
            prefill_timeout_ms = 5000

            [summarizer]
            trigger_every = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.planner.fixed_headroom_bytes, 750_000_000);
        assert_eq!(config.planner.max_threads, 2);
        assert_eq!(
            config.planner.total_memory_tiers,
            PlannerConfig::default().total_memory_tiers
        );
        assert_eq!(config.session.prefill_timeout_ms, 5000);
        assert_eq!(config.session.max_tokens, SessionConfig::default().max_tokens);
        assert_eq!(config.summarizer.trigger_every, 10);
        assert_eq!(config.templater, TemplaterConfig::default());
    }

    #[test]
    fn family_table_can_be_replaced() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [[templater.families.rules]]
            keywords = ["granite"]
            strategy = "chat_ml"
            "#,
        )
        .unwrap();
        let rules = &config.templater.families.rules;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].strategy, TemplateStrategy::ChatMl);
    }

    #[test]
    fn unreadable_file_names_the_path() {
        let err = RuntimeConfig::load("/nonexistent/pocketlm.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/pocketlm.toml"));
    }
}
