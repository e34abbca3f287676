//! Error types for what-if analysis and replay

use worldline_state::{AttributePath, Difference, LogError, StoreError, Version};

/// What-if, audit and replay errors
#[derive(Debug, thiserror::Error)]
pub enum WhatIfError {
    /// Underlying store failure (unknown version, rejected delta)
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Reading or parsing a log failed
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// Replay met an entry it cannot place
    #[error("log integrity violation at {version}: {reason}")]
    LogIntegrity { version: Version, reason: String },

    /// A derived world differs from its base in other than one path
    #[error("branch {derived} changed {} paths instead of one", differences.len())]
    NotSingleVariable {
        derived: Version,
        differences: Vec<Difference>,
    },

    /// Requested perturbation cannot change anything
    #[error("variable {path} is not perturbable at {base}: {reason}")]
    NotPerturbable {
        path: AttributePath,
        base: Version,
        reason: String,
    },

    /// A decision for this world and decision point already exists
    #[error("decision '{decision_point}' already recorded at {version}")]
    DuplicateDecision {
        version: Version,
        decision_point: String,
    },

    /// Option missing from the aggressiveness ranking
    #[error("option '{0}' has no aggressiveness rank")]
    UnrankedOption(String),

    /// Invalid catalog, rule table or configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl WhatIfError {
    /// Check if the error points at bad or tampered log data
    #[inline]
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::LogIntegrity { .. })
    }
}
