//! Pipeline configuration

use crate::error::PipelineError;
use crate::stage::StageDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Orchestrator configuration, loadable from the `[pipeline]` table of a TOML file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Default per-stage time limit
    pub stage_timeout_secs: u64,
    /// How long a gate may wait; `None` waits until answered or cancelled
    pub gate_timeout_secs: Option<u64>,
    /// Concurrent stage invocations across the pool
    pub pool_size: usize,
    /// Reject gate summaries phrased as directives
    pub framing_guard: bool,
    /// Stage order; implementations are bound by name
    #[serde(rename = "stage")]
    pub stages: Vec<StageDescriptor>,
}

impl PipelineConfig {
    /// Default stage time limit in seconds
    pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 120;

    /// Create new config with defaults
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With stage timeout
    #[inline]
    #[must_use]
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout_secs = timeout.as_secs();
        self
    }

    /// With gate timeout
    #[inline]
    #[must_use]
    pub fn with_gate_timeout(mut self, timeout: Duration) -> Self {
        self.gate_timeout_secs = Some(timeout.as_secs());
        self
    }

    /// With pool size
    #[inline]
    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// With framing guard on or off
    #[inline]
    #[must_use]
    pub fn with_framing_guard(mut self, enabled: bool) -> Self {
        self.framing_guard = enabled;
        self
    }

    /// With one more stage at the end
    #[inline]
    #[must_use]
    pub fn with_stage(mut self, stage: StageDescriptor) -> Self {
        self.stages.push(stage);
        self
    }

    /// Stage timeout as a duration
    #[inline]
    #[must_use]
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    /// Gate timeout as a duration
    #[inline]
    #[must_use]
    pub fn gate_timeout(&self) -> Option<Duration> {
        self.gate_timeout_secs.map(Duration::from_secs)
    }

    /// Parse from TOML
    ///
    /// # Errors
    /// Returns `PipelineError::Config` on a parse or validation failure
    pub fn from_toml_str(s: &str) -> Result<Self, PipelineError> {
        let config: Self = toml::from_str(s).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// Returns `PipelineError::Config` if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Check limits and stage names
    ///
    /// # Errors
    /// Returns `PipelineError::Config` describing the first problem
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.stage_timeout_secs == 0 {
            return Err(PipelineError::Config("stage_timeout_secs must be > 0".into()));
        }
        if self.pool_size == 0 {
            return Err(PipelineError::Config("pool_size must be > 0".into()));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.is_empty() {
                return Err(PipelineError::Config("stage name must not be empty".into()));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "duplicate stage '{}'",
                    stage.name
                )));
            }
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: Self::DEFAULT_STAGE_TIMEOUT_SECS,
            gate_timeout_secs: None,
            pool_size: 4,
            framing_guard: true,
            stages: Vec::new(),
        }
    }
}
