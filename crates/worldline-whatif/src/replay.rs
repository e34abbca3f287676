//! Replay engine
//!
//! Rebuilds a fresh [`WorldStore`] from a recorded log by issuing the same
//! `commit`/`branch` calls in log order. The rebuilt store can then be
//! inspected at any version or branched for after-action what-ifs.

use crate::error::WhatIfError;
use crate::perturbation::{Perturbation, PerturbationEngine};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use worldline_state::{
    AttributePath, EntryKind, LogEntry, LogSink, StoreError, TurnLog, Version, WorldState,
    WorldStore,
};

/// A store rebuilt from a log
#[derive(Debug, Clone)]
pub struct ReplayEngine {
    engine: PerturbationEngine,
}

impl ReplayEngine {
    /// Replay `entries` into a fresh in-memory store
    ///
    /// # Errors
    /// - `WhatIfError::LogIntegrity` if the first entry is not genesis, a
    ///   parent is missing, a linear entry no longer extends the head, or a
    ///   rebuilt version or hash disagrees with the entry
    /// - `WhatIfError::Store` if a logged delta no longer applies
    pub fn replay(entries: &[LogEntry]) -> Result<Self, WhatIfError> {
        Self::rebuild(entries, Persist::None)
    }

    /// Replay while persisting every rebuilt entry to `sink`
    ///
    /// # Errors
    /// Same as [`ReplayEngine::replay`], plus sink failures
    pub fn replay_to(entries: &[LogEntry], sink: Arc<dyn LogSink>) -> Result<Self, WhatIfError> {
        Self::rebuild(entries, Persist::All(sink))
    }

    /// Replay in memory, then send only later writes to `sink`
    ///
    /// With `sink` appending to the log `entries` came from, branches made on
    /// the returned engine extend that log and are numbered after its last
    /// version.
    ///
    /// # Errors
    /// As [`ReplayEngine::replay`]
    pub fn resume(entries: &[LogEntry], sink: Arc<dyn LogSink>) -> Result<Self, WhatIfError> {
        Self::rebuild(entries, Persist::After(sink))
    }

    /// Load a JSON-lines log and replay it
    ///
    /// # Errors
    /// `WhatIfError::Log` if the file cannot be read, otherwise as [`ReplayEngine::replay`]
    pub fn from_jsonl(path: impl AsRef<Path>) -> Result<Self, WhatIfError> {
        let log = TurnLog::read_jsonl(path)?;
        Self::replay(log.entries())
    }

    #[tracing::instrument(skip_all, fields(entries = entries.len(), persist = persist.label()))]
    fn rebuild(entries: &[LogEntry], persist: Persist) -> Result<Self, WhatIfError> {
        let Some((genesis, rest)) = entries.split_first() else {
            return Err(integrity(Version::GENESIS, "log is empty"));
        };
        if genesis.kind != EntryKind::Genesis
            || genesis.version != Version::GENESIS
            || genesis.parent_version.is_some()
        {
            return Err(integrity(genesis.version, "first entry must be genesis v0"));
        }

        let mut builder = WorldStore::builder().genesis(genesis.delta.clone());
        if let Persist::All(sink) = &persist {
            builder = builder.sink(Arc::clone(sink));
        }
        let mut store = builder.build()?;
        check(genesis, &store.current())?;

        for entry in rest {
            let state = apply(&store, entry)?;
            check(entry, &state)?;
        }
        tracing::info!(versions = store.len(), head = %store.head(), "replay complete");

        if let Persist::After(sink) = persist {
            store = store.with_sink(sink);
        }
        Ok(Self {
            engine: PerturbationEngine::new(Arc::new(store)),
        })
    }

    /// Rebuilt store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<WorldStore> {
        self.engine.store()
    }

    /// Snapshot at `version`
    ///
    /// # Errors
    /// Returns `WhatIfError::Store` if the version was not in the log
    pub fn at(&self, version: Version) -> Result<Arc<WorldState>, WhatIfError> {
        Ok(self.store().get(version)?)
    }

    /// Branch off a historical version with one changed variable
    ///
    /// The branch is labelled with decision point `replay@<version>`.
    ///
    /// # Errors
    /// As [`PerturbationEngine::perturb_one`]
    pub fn branch_from(
        &self,
        version: Version,
        path: &AttributePath,
        value: Value,
    ) -> Result<Perturbation, WhatIfError> {
        self.engine
            .perturb_one(version, &format!("replay@{version}"), path, value)
    }
}

/// Which writes reach a durable sink
enum Persist {
    None,
    /// Every rebuilt entry, genesis included
    All(Arc<dyn LogSink>),
    /// Only writes made after the replay
    After(Arc<dyn LogSink>),
}

impl Persist {
    fn label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::All(_) => "all",
            Self::After(_) => "after",
        }
    }
}

fn integrity(version: Version, reason: impl Into<String>) -> WhatIfError {
    WhatIfError::LogIntegrity {
        version,
        reason: reason.into(),
    }
}

fn apply(store: &WorldStore, entry: &LogEntry) -> Result<Arc<WorldState>, WhatIfError> {
    let Some(parent) = entry.parent_version else {
        return Err(integrity(entry.version, "entry has no parent"));
    };
    if !store.contains(parent) {
        return Err(integrity(entry.version, format!("dangling parent {parent}")));
    }
    match entry.kind {
        EntryKind::Genesis => Err(integrity(entry.version, "genesis after v0")),
        EntryKind::Linear => store.commit(parent, &entry.delta).map_err(|e| match e {
            StoreError::StaleParent { parent, head } => integrity(
                entry.version,
                format!("linear parent {parent} is not the head {head}"),
            ),
            other => other.into(),
        }),
        EntryKind::Branch => Ok(store.branch(parent, &entry.delta)?),
    }
}

fn check(entry: &LogEntry, state: &WorldState) -> Result<(), WhatIfError> {
    if state.version() != entry.version {
        return Err(integrity(
            entry.version,
            format!("rebuilt as {}", state.version()),
        ));
    }
    if let Some(expected) = entry.state_hash {
        let actual = state.state_hash().map_err(StoreError::from)?;
        if actual != expected {
            tracing::warn!(version = %entry.version, %expected, %actual, "hash mismatch");
            return Err(integrity(
                entry.version,
                format!("state hash {} != logged {}", actual.short(), expected.short()),
            ));
        }
    }
    Ok(())
}
