//! Turn phase machine
//!
//! Each turn walks `AwaitingStage(0) -> StageRunning(0) -> ... -> TurnCommitted`.
//! Gated stages pass through `AwaitingConfirmation`. Any live phase may drop
//! to `Aborted`. Indices name the stage position in the pipeline.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};

/// Where the orchestrator is within a turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "phase", content = "stage", rename_all = "snake_case")]
pub enum TurnPhase {
    /// No turn has run yet
    #[default]
    Idle,
    /// About to invoke the stage at this index
    AwaitingStage(usize),
    /// Stage invocation in flight (re-entered on retry)
    StageRunning(usize),
    /// Gated stage suspended until a confirmer answers
    AwaitingConfirmation(usize),
    /// Stage resolved: committed, declined or produced nothing
    StageApplied(usize),
    /// Every stage resolved
    TurnCommitted,
    /// Turn stopped early; the store head is the last committed stage
    Aborted,
}

impl TurnPhase {
    /// True once the turn has ended either way
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::TurnCommitted | Self::Aborted)
    }

    /// Stage index carried by this phase, if any
    #[must_use]
    pub fn stage(self) -> Option<usize> {
        match self {
            Self::AwaitingStage(i)
            | Self::StageRunning(i)
            | Self::AwaitingConfirmation(i)
            | Self::StageApplied(i) => Some(i),
            _ => None,
        }
    }
}

/// Validate a phase transition
///
/// # Errors
/// Returns `PipelineError::IllegalTransition` if `to` is not reachable from `from`
pub fn validate_transition(from: TurnPhase, to: TurnPhase) -> Result<(), PipelineError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(PipelineError::IllegalTransition { from, to })
    }
}

/// Phases directly reachable from `from` in a pipeline of `stages` stages
#[must_use]
pub fn allowed_transitions(from: TurnPhase, stages: usize) -> Vec<TurnPhase> {
    use TurnPhase::*;
    let last = stages.saturating_sub(1);
    match from {
        Idle | TurnCommitted | Aborted => vec![AwaitingStage(0)],
        AwaitingStage(i) => vec![StageRunning(i), Aborted],
        StageRunning(i) => vec![StageRunning(i), AwaitingConfirmation(i), StageApplied(i), Aborted],
        AwaitingConfirmation(i) => vec![StageApplied(i), Aborted],
        StageApplied(i) if i >= last => vec![TurnCommitted, Aborted],
        StageApplied(i) => vec![AwaitingStage(i + 1), Aborted],
    }
}

fn allowed(from: TurnPhase, to: TurnPhase) -> bool {
    use TurnPhase::*;
    match (from, to) {
        (Idle | TurnCommitted | Aborted, AwaitingStage(0)) => true,
        (AwaitingStage(i), StageRunning(j)) => i == j,
        (StageRunning(i), StageRunning(j) | AwaitingConfirmation(j) | StageApplied(j)) => i == j,
        (AwaitingConfirmation(i), StageApplied(j)) => i == j,
        (StageApplied(i), AwaitingStage(j)) => j == i + 1,
        (StageApplied(_), TurnCommitted) => true,
        (AwaitingStage(_) | StageRunning(_) | AwaitingConfirmation(_) | StageApplied(_), Aborted) => {
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use super::TurnPhase::*;

    fn phase() -> impl Strategy<Value = TurnPhase> {
        let idx = 0usize..4;
        prop_oneof![
            Just(Idle),
            idx.clone().prop_map(AwaitingStage),
            idx.clone().prop_map(StageRunning),
            idx.clone().prop_map(AwaitingConfirmation),
            idx.prop_map(StageApplied),
            Just(TurnCommitted),
            Just(Aborted),
        ]
    }

    #[test]
    fn gated_happy_path() {
        let walk = [
            Idle,
            AwaitingStage(0),
            StageRunning(0),
            StageApplied(0),
            AwaitingStage(1),
            StageRunning(1),
            AwaitingConfirmation(1),
            StageApplied(1),
            TurnCommitted,
            AwaitingStage(0),
        ];
        for pair in walk.windows(2) {
            assert!(validate_transition(pair[0], pair[1]).is_ok(), "{pair:?}");
        }
    }

    #[test]
    fn cannot_skip_stages_or_commit_from_a_gate() {
        assert!(validate_transition(StageApplied(0), AwaitingStage(2)).is_err());
        assert!(validate_transition(AwaitingConfirmation(0), TurnCommitted).is_err());
        assert!(validate_transition(AwaitingStage(0), StageApplied(0)).is_err());
        assert!(validate_transition(Idle, Aborted).is_err());
    }

    #[test]
    fn terminal_phases() {
        assert!(TurnCommitted.is_terminal());
        assert!(Aborted.is_terminal());
        assert!(!AwaitingConfirmation(0).is_terminal());
        assert_eq!(StageRunning(3).stage(), Some(3));
    }

    proptest! {
        #[test]
        fn prop_listed_transitions_validate(from in phase(), stages in 1usize..5) {
            for to in allowed_transitions(from, stages) {
                prop_assert!(validate_transition(from, to).is_ok(), "{:?} -> {:?}", from, to);
            }
        }

        #[test]
        fn prop_terminal_phases_only_restart(from in phase(), to in phase()) {
            if from.is_terminal() && validate_transition(from, to).is_ok() {
                prop_assert_eq!(to, AwaitingStage(0));
            }
        }

        #[test]
        fn prop_stage_index_never_changes_mid_stage(i in 0usize..4, j in 0usize..4) {
            if i != j {
                prop_assert!(validate_transition(StageRunning(i), StageApplied(j)).is_err());
                prop_assert!(validate_transition(AwaitingConfirmation(i), StageApplied(j)).is_err());
            }
        }
    }
}
