//! Error types for the turn pipeline
//!
//! Three layers:
//! - [`StageError`]: what a single stage invocation can fail with
//! - [`TurnError`]: why a turn stopped early (recorded in the report)
//! - [`PipelineError`]: failures the caller must handle (store, config, FSM)

use crate::phase::TurnPhase;
use worldline_state::{DeltaError, StoreError};

/// Failure of one stage invocation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    /// The stage reported a failure
    #[error("stage failed: {0}")]
    Failed(String),

    /// The stage exceeded its time limit
    #[error("stage timed out after {secs}s")]
    TimedOut { secs: u64 },

    /// The stage task panicked
    #[error("stage panicked: {0}")]
    Panicked(String),

    /// The turn was cancelled while the stage ran
    #[error("stage cancelled")]
    Cancelled,

    /// The stage pool no longer accepts work
    #[error("stage pool closed")]
    PoolClosed,
}

impl StageError {
    /// Shorthand for [`StageError::Failed`]
    #[inline]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    /// Check if a failure hook may ask for another attempt
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Failed(_) | Self::TimedOut { .. } | Self::Panicked(_)
        )
    }
}

/// How a gate ended without a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    /// Nobody is left to answer the request
    #[error("confirmation withdrawn")]
    Withdrawn,

    /// No answer within the configured window
    #[error("confirmation timed out after {secs}s")]
    TimedOut { secs: u64 },

    /// The turn was cancelled while waiting
    #[error("confirmation cancelled")]
    Cancelled,
}

/// Why a turn was aborted
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TurnError {
    /// A stage failed and the failure hook chose to abort
    #[error("stage '{stage}' failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: StageError,
    },

    /// A stage proposed a delta the store or policy refused
    #[error("delta from stage '{stage}' rejected: {source}")]
    DeltaRejected {
        stage: String,
        #[source]
        source: DeltaError,
    },

    /// A gate was withdrawn, timed out or cancelled
    #[error("gate on stage '{stage}' ended: {source}")]
    GateTimeoutOrCancelled {
        stage: String,
        #[source]
        source: GateError,
    },

    /// The turn was cancelled between or during stages
    #[error("turn cancelled at stage '{stage}'")]
    Cancelled { stage: String },
}

impl TurnError {
    /// Name of the stage the turn stopped at
    #[must_use]
    pub fn stage(&self) -> &str {
        match self {
            Self::StageFailed { stage, .. }
            | Self::DeltaRejected { stage, .. }
            | Self::GateTimeoutOrCancelled { stage, .. }
            | Self::Cancelled { stage } => stage,
        }
    }
}

/// Errors surfaced to the pipeline caller
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Store failure other than a rejected delta (stale parent, log sink)
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Phase machine refused a transition
    #[error("illegal phase transition {from:?} -> {to:?}")]
    IllegalTransition { from: TurnPhase, to: TurnPhase },

    /// Invalid pipeline definition or configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Check if another writer moved the head under the turn
    #[inline]
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_stale())
    }
}
