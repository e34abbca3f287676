//! Perturbation settings

use crate::error::WhatIfError;
use serde::{Deserialize, Serialize};

/// Settings for the perturbation engine, the `[whatif]` table of a TOML file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatIfConfig {
    /// Branches to generate per decision point
    pub k: usize,
    /// Fixed seed for reproducible selection
    pub seed: Option<u64>,
    /// Materialize branches on the rayon pool
    pub parallel: bool,
}

impl WhatIfConfig {
    /// Default branch count
    pub const DEFAULT_K: usize = 3;

    /// Create new config with defaults
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With branch count
    #[inline]
    #[must_use]
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    /// With seed
    #[inline]
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// With parallel materialization on or off
    #[inline]
    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Check limits
    ///
    /// # Errors
    /// Returns `WhatIfError::Config` if `k` is zero
    pub fn validate(&self) -> Result<(), WhatIfError> {
        if self.k == 0 {
            return Err(WhatIfError::Config("k must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for WhatIfConfig {
    fn default() -> Self {
        Self {
            k: Self::DEFAULT_K,
            seed: None,
            parallel: true,
        }
    }
}
