//! Failure policy for stage invocations
//!
//! Nothing is retried unless a hook says so.

use crate::error::StageError;
use crate::stage::StageContext;

/// What to do after a stage failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Stop the turn; committed stages stay committed
    Abort,
    /// Invoke the stage again on a fresh snapshot
    Retry,
}

/// Decides how the orchestrator reacts to a failed stage
pub trait FailureHook: Send + Sync + std::fmt::Debug {
    /// Called once per failed attempt; `ctx.attempt` counts from 1
    fn on_stage_failure(&self, ctx: &StageContext, error: &StageError) -> FailureAction;
}

/// Always aborts
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

impl FailureHook for NeverRetry {
    fn on_stage_failure(&self, _ctx: &StageContext, _error: &StageError) -> FailureAction {
        FailureAction::Abort
    }
}

/// Retries retryable failures up to a fixed number of extra attempts
#[derive(Debug, Clone, Copy)]
pub struct RetryLimit {
    retries: u32,
}

impl RetryLimit {
    /// Default number of extra attempts
    pub const DEFAULT_RETRIES: u32 = 2;

    /// Allow `retries` extra attempts per stage
    #[inline]
    #[must_use]
    pub fn new(retries: u32) -> Self {
        Self { retries }
    }

    /// Extra attempts allowed
    #[inline]
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

impl Default for RetryLimit {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RETRIES)
    }
}

impl FailureHook for RetryLimit {
    fn on_stage_failure(&self, ctx: &StageContext, error: &StageError) -> FailureAction {
        if error.is_retryable() && ctx.attempt <= self.retries {
            tracing::warn!(
                stage = %ctx.stage,
                attempt = ctx.attempt,
                error = %error,
                "retrying stage"
            );
            FailureAction::Retry
        } else {
            FailureAction::Abort
        }
    }
}
