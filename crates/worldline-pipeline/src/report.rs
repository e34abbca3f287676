//! Per-turn report
//!
//! Which stages committed, at which versions, and every evidence-cited
//! confidence change made since the turn started.

use crate::error::TurnError;
use crate::stage::OodaPhase;
use std::fmt;
use worldline_state::{EntityId, Version};

/// How one stage resolved
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Proposal committed as this version
    Committed { version: Version },
    /// Approved with edits; the edited delta committed as this version
    Edited { version: Version },
    /// Proposal was empty; nothing committed
    NoChange,
    /// Confirmer declined; nothing committed
    Declined { reason: String },
    /// Turn stopped here
    Aborted,
}

impl StageOutcome {
    /// Version created by the stage, if any
    #[inline]
    #[must_use]
    pub fn version(&self) -> Option<Version> {
        match self {
            Self::Committed { version } | Self::Edited { version } => Some(*version),
            _ => None,
        }
    }
}

/// One line of the report per stage reached
#[derive(Debug, Clone, PartialEq)]
pub struct StageRecord {
    pub name: String,
    pub phase: Option<OodaPhase>,
    /// Invocations made, retries included
    pub attempts: u32,
    pub outcome: StageOutcome,
}

/// A committed confidence update with its citation
#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceRecord {
    pub entity: EntityId,
    /// Version that carries the change
    pub version: Version,
    /// Previous confidence; `None` if the entity was created in the same delta
    pub from: Option<f64>,
    pub to: f64,
    pub evidence: String,
}

/// Final state of a turn
#[derive(Debug, Clone, PartialEq)]
pub enum TurnStatus {
    /// Every stage resolved
    Committed,
    /// Stopped early; committed stages stay committed
    Aborted(TurnError),
}

/// Summary handed back after each turn
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub turn: u64,
    /// Head when the turn began
    pub start_version: Version,
    /// Head when the turn ended
    pub end_version: Version,
    pub status: TurnStatus,
    pub stages: Vec<StageRecord>,
    pub confidence_changes: Vec<ConfidenceRecord>,
}

impl TurnReport {
    pub(crate) fn new(turn: u64, start_version: Version) -> Self {
        Self {
            turn,
            start_version,
            end_version: start_version,
            status: TurnStatus::Committed,
            stages: Vec::new(),
            confidence_changes: Vec::new(),
        }
    }

    /// Check if every stage resolved
    #[inline]
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self.status, TurnStatus::Committed)
    }

    /// Abort reason, if any
    #[inline]
    #[must_use]
    pub fn error(&self) -> Option<&TurnError> {
        match &self.status {
            TurnStatus::Aborted(err) => Some(err),
            TurnStatus::Committed => None,
        }
    }

    /// Versions created this turn, in commit order
    #[must_use]
    pub fn versions(&self) -> Vec<Version> {
        self.stages.iter().filter_map(|s| s.outcome.version()).collect()
    }

    /// Record for a stage by name
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }
}

impl fmt::Display for TurnReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match &self.status {
            TurnStatus::Committed => "committed".to_string(),
            TurnStatus::Aborted(err) => format!("aborted ({err})"),
        };
        writeln!(
            f,
            "turn {}: {} -> {} {status}",
            self.turn, self.start_version, self.end_version
        )?;
        for stage in &self.stages {
            let outcome = match &stage.outcome {
                StageOutcome::Committed { version } => format!("committed {version}"),
                StageOutcome::Edited { version } => format!("committed {version} (edited)"),
                StageOutcome::NoChange => "no change".to_string(),
                StageOutcome::Declined { reason } => format!("declined: {reason}"),
                StageOutcome::Aborted => "aborted".to_string(),
            };
            writeln!(f, "  {:<16} {outcome}", stage.name)?;
        }
        for c in &self.confidence_changes {
            let from = c.from.map_or_else(|| "new".to_string(), |v| format!("{v:.2}"));
            writeln!(
                f,
                "  {} {from} -> {:.2} at {}: {}",
                c.entity, c.to, c.version, c.evidence
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GateError;

    #[test]
    fn versions_skip_uncommitted_stages() {
        let mut report = TurnReport::new(3, Version(4));
        report.stages = vec![
            StageRecord {
                name: "observe".into(),
                phase: Some(OodaPhase::Observe),
                attempts: 1,
                outcome: StageOutcome::Committed { version: Version(5) },
            },
            StageRecord {
                name: "orient".into(),
                phase: None,
                attempts: 2,
                outcome: StageOutcome::NoChange,
            },
            StageRecord {
                name: "decide".into(),
                phase: None,
                attempts: 1,
                outcome: StageOutcome::Edited { version: Version(6) },
            },
        ];
        assert_eq!(report.versions(), vec![Version(5), Version(6)]);
        assert_eq!(report.stage("orient").unwrap().attempts, 2);
        assert!(report.is_committed());
    }

    #[test]
    fn display_mentions_abort_reason() {
        let mut report = TurnReport::new(1, Version(0));
        report.status = TurnStatus::Aborted(TurnError::GateTimeoutOrCancelled {
            stage: "decide".into(),
            source: GateError::Cancelled,
        });
        report.confidence_changes.push(ConfidenceRecord {
            entity: "fleet".into(),
            version: Version(1),
            from: Some(0.5),
            to: 0.75,
            evidence: "rpt-7 sighting".into(),
        });
        let text = report.to_string();
        assert!(text.contains("aborted"));
        assert!(text.contains("fleet 0.50 -> 0.75 at v1: rpt-7 sighting"));
        assert!(report.error().is_some());
    }
}
