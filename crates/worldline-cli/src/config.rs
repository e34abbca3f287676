//! Engine configuration file
//!
//! One TOML file with a table per component:
//!
//! ```toml
//! [pipeline]
//! stage_timeout_secs = 60
//! framing_guard = true
//!
//! [whatif]
//! k = 2
//! seed = 7
//!
//! [log]
//! path = "turns.jsonl"
//! ```
//!
//! No subcommand runs a pipeline. `[pipeline]` is only validated, so a host
//! that embeds the orchestrator can share this file with the tool.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use worldline_pipeline::{PipelineConfig, PipelineError};
use worldline_whatif::{WhatIfConfig, WhatIfError};

/// Turn log settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct LogConfig {
    /// JSON-lines log used when a command names none
    pub(crate) path: Option<PathBuf>,
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct EngineConfig {
    pub(crate) pipeline: PipelineConfig,
    pub(crate) whatif: WhatIfConfig,
    pub(crate) log: LogConfig,
}

impl EngineConfig {
    /// Create new config with defaults
    #[inline]
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// With what-if settings
    #[must_use]
    pub(crate) fn with_whatif(mut self, whatif: WhatIfConfig) -> Self {
        self.whatif = whatif;
        self
    }

    /// With default log file
    #[must_use]
    pub(crate) fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log.path = Some(path.into());
        self
    }

    /// Parse and validate
    ///
    /// # Errors
    /// Returns `ConfigError` on a parse failure or an invalid section
    pub(crate) fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed or validated
    pub(crate) fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check every section
    ///
    /// # Errors
    /// Returns the first section error
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline.validate()?;
        self.whatif.validate()?;
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    WhatIf(#[from] WhatIfError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::new());
        assert_eq!(config.pipeline.stage_timeout_secs, 120);
        assert_eq!(config.pipeline.pool_size, 4);
        assert!(config.pipeline.framing_guard);
        assert_eq!(config.pipeline.gate_timeout_secs, None);
        assert_eq!(config.whatif.k, 3);
        assert_eq!(config.whatif.seed, None);
        assert!(config.whatif.parallel);
        assert_eq!(config.log.path, None);
    }

    #[test]
    fn sections_parse() {
        let config = EngineConfig::from_toml_str(
            r#"
            [pipeline]
            stage_timeout_secs = 30
            gate_timeout_secs = 600

            [[pipeline.stage]]
            name = "observe"

            [[pipeline.stage]]
            name = "decide"
            mode = "gated"

            [whatif]
            k = 2
            seed = 7

            [log]
            path = "turns.jsonl"
            "#,
        )
        .unwrap();
        let expected = EngineConfig {
            pipeline: PipelineConfig::new()
                .with_stage_timeout(Duration::from_secs(30))
                .with_gate_timeout(Duration::from_secs(600))
                .with_stage(worldline_pipeline::StageDescriptor::advisory("observe"))
                .with_stage(worldline_pipeline::StageDescriptor::gated("decide")),
            ..EngineConfig::new()
        }
        .with_whatif(WhatIfConfig::new().with_k(2).with_seed(7))
        .with_log_path("turns.jsonl");
        assert_eq!(config, expected);
    }

    #[test]
    fn invalid_sections_rejected() {
        assert!(matches!(
            EngineConfig::from_toml_str("[whatif]\nk = 0"),
            Err(ConfigError::WhatIf(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[pipeline]\npool_size = 0"),
            Err(ConfigError::Pipeline(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[whatif]\nk = \"three\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = EngineConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }
}
