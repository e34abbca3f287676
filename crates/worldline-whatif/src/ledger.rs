//! Decision ledger
//!
//! Append-only record of choices made against specific world versions.
//! At most one decision per `(world_version, decision_point)`.

use crate::error::WhatIfError;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use worldline_state::Version;

/// A choice made by a human or agent against one world version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub world_version: Version,
    pub decision_point: String,
    pub chosen_option: String,
    pub rationale: String,
    /// Who decided
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}

impl DecisionRecord {
    /// Create new record stamped now
    #[must_use]
    pub fn new(
        world_version: Version,
        decision_point: impl Into<String>,
        chosen_option: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            world_version,
            decision_point: decision_point.into(),
            chosen_option: chosen_option.into(),
            rationale: rationale.into(),
            actor: None,
            recorded_at: Utc::now(),
        }
    }

    /// With deciding actor
    #[inline]
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

type Key = (Version, String);

/// Thread-safe, append-only decision store
#[derive(Debug, Default)]
pub struct DecisionLedger {
    records: RwLock<IndexMap<Key, Arc<DecisionRecord>>>,
}

impl DecisionLedger {
    /// Empty ledger
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a decision; records are never replaced
    ///
    /// # Errors
    /// Returns `WhatIfError::DuplicateDecision` if this world already has a
    /// decision for the same decision point
    pub fn record(&self, record: DecisionRecord) -> Result<Arc<DecisionRecord>, WhatIfError> {
        let key = (record.world_version, record.decision_point.clone());
        let mut records = self.records.write();
        if records.contains_key(&key) {
            return Err(WhatIfError::DuplicateDecision {
                version: key.0,
                decision_point: key.1,
            });
        }
        let record = Arc::new(record);
        tracing::debug!(
            version = %record.world_version,
            decision_point = %record.decision_point,
            option = %record.chosen_option,
            "decision recorded"
        );
        records.insert(key, Arc::clone(&record));
        Ok(record)
    }

    /// Decision for one world and decision point
    #[must_use]
    pub fn get(&self, version: Version, decision_point: &str) -> Option<Arc<DecisionRecord>> {
        self.records
            .read()
            .get(&(version, decision_point.to_string()))
            .cloned()
    }

    /// Every decision for `decision_point`, in recording order
    #[must_use]
    pub fn for_decision_point(&self, decision_point: &str) -> Vec<Arc<DecisionRecord>> {
        self.records
            .read()
            .values()
            .filter(|r| r.decision_point == decision_point)
            .cloned()
            .collect()
    }

    /// Number of decisions
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True if nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
