//! Stage contract
//!
//! A stage reads one immutable snapshot and proposes a [`Delta`]. It never
//! writes to the store itself; the orchestrator commits on its behalf.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use worldline_state::{Delta, Version, WorldState};

use crate::error::StageError;

/// Whether a stage may commit without an explicit human decision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageMode {
    /// Output commits directly
    #[default]
    Advisory,
    /// Output waits for a confirmer before it commits
    Gated,
}

/// Decision-cycle phase a stage belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OodaPhase {
    Observe,
    Orient,
    Decide,
    Act,
}

/// Static description of one pipeline position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Unique name within the pipeline
    pub name: String,
    /// Advisory or gated
    #[serde(default)]
    pub mode: StageMode,
    /// Optional decision-cycle tag, for reports only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<OodaPhase>,
    /// Per-stage override of the pipeline timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl StageDescriptor {
    /// Advisory stage
    #[inline]
    #[must_use]
    pub fn advisory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: StageMode::Advisory,
            phase: None,
            timeout_secs: None,
        }
    }

    /// Gated stage
    #[inline]
    #[must_use]
    pub fn gated(name: impl Into<String>) -> Self {
        Self {
            mode: StageMode::Gated,
            ..Self::advisory(name)
        }
    }

    /// With decision-cycle phase
    #[inline]
    #[must_use]
    pub fn with_phase(mut self, phase: OodaPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// With timeout override
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Check if the stage suspends for confirmation
    #[inline]
    #[must_use]
    pub fn is_gated(&self) -> bool {
        self.mode == StageMode::Gated
    }
}

/// Per-invocation information handed to a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageContext {
    /// Turn number
    pub turn: u64,
    /// Position in the pipeline
    pub index: usize,
    /// Stage name
    pub stage: String,
    /// Advisory or gated
    pub mode: StageMode,
    /// Decision-cycle tag
    pub phase: Option<OodaPhase>,
    /// Head when the turn began
    pub turn_start: Version,
    /// Version of the snapshot being read
    pub snapshot: Version,
    /// 1 on the first call, incremented on each retry
    pub attempt: u32,
}

/// Proposed change awaiting a confirmer
#[derive(Debug, Clone, PartialEq)]
pub struct GateRequest {
    /// Change that commits on approval
    pub delta: Delta,
    /// Human-readable recommendation shown to the confirmer
    pub summary: String,
}

impl GateRequest {
    /// Create new gate request
    #[inline]
    #[must_use]
    pub fn new(delta: Delta, summary: impl Into<String>) -> Self {
        Self {
            delta,
            summary: summary.into(),
        }
    }
}

/// What a stage hands back
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    /// Proposed change
    Delta(Delta),
    /// Proposed change plus a summary for the confirmer
    Gate(GateRequest),
}

impl StageOutput {
    /// Split into the delta and an optional summary
    #[must_use]
    pub fn into_parts(self) -> (Delta, Option<String>) {
        match self {
            Self::Delta(delta) => (delta, None),
            Self::Gate(GateRequest { delta, summary }) => (delta, Some(summary)),
        }
    }
}

impl From<Delta> for StageOutput {
    fn from(delta: Delta) -> Self {
        Self::Delta(delta)
    }
}

impl From<GateRequest> for StageOutput {
    fn from(request: GateRequest) -> Self {
        Self::Gate(request)
    }
}

/// One agent in the pipeline
#[async_trait]
pub trait Stage: Send + Sync {
    /// Read `snapshot` and propose a change
    ///
    /// # Errors
    /// Returns `StageError` when no proposal can be made
    async fn run(
        &self,
        snapshot: Arc<WorldState>,
        ctx: StageContext,
    ) -> Result<StageOutput, StageError>;
}

#[async_trait]
impl<T: Stage + ?Sized> Stage for Arc<T> {
    async fn run(
        &self,
        snapshot: Arc<WorldState>,
        ctx: StageContext,
    ) -> Result<StageOutput, StageError> {
        (**self).run(snapshot, ctx).await
    }
}

/// Stage backed by an async closure
pub struct FnStage<F>(F);

impl<F> std::fmt::Debug for FnStage<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnStage")
    }
}

/// Wrap an async closure as a [`Stage`]
pub fn stage_fn<F, Fut>(f: F) -> FnStage<F>
where
    F: Fn(Arc<WorldState>, StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutput, StageError>> + Send,
{
    FnStage(f)
}

#[async_trait]
impl<F, Fut> Stage for FnStage<F>
where
    F: Fn(Arc<WorldState>, StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutput, StageError>> + Send,
{
    async fn run(
        &self,
        snapshot: Arc<WorldState>,
        ctx: StageContext,
    ) -> Result<StageOutput, StageError> {
        (self.0)(snapshot, ctx).await
    }
}
