//! Versioned world store
//!
//! An arena of immutable snapshots indexed by [`Version`], a linear head
//! pointer, and the turn log. Linear commits compare-and-swap the head;
//! branches write against any existing version and never touch the head.
//!
//! # Concurrency
//! - `commit` holds the head lock for its whole duration, so two commits
//!   against the same parent serialize and the second sees `StaleParent`.
//! - `branch` only takes the arena lock while publishing, so branches run
//!   alongside commits and alongside each other.
//! - Publishing (version allocation, log append, arena push) happens under
//!   one arena write lock; log order therefore equals version order.

use crate::delta::Delta;
use crate::log::{EntryKind, LogEntry, LogError, LogSink, TurnLog};
use crate::world::{Version, WorldState};
use crate::DeltaError;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use ulid::Ulid;

#[derive(Debug, Default)]
struct Arena {
    states: Vec<Arc<WorldState>>,
    log: TurnLog,
}

/// Append-only, versioned store of world snapshots
#[derive(Debug)]
pub struct WorldStore {
    id: Ulid,
    head: Mutex<Version>,
    arena: RwLock<Arena>,
    sink: Option<Arc<dyn LogSink>>,
}

impl WorldStore {
    /// Store whose genesis is the empty world
    #[must_use]
    pub fn new() -> Self {
        let genesis = WorldState::empty();
        let entry = LogEntry {
            version: Version::GENESIS,
            parent_version: None,
            kind: EntryKind::Genesis,
            delta: Delta::new(),
            timestamp: Utc::now(),
            state_hash: genesis.state_hash().ok(),
        };
        let mut log = TurnLog::new();
        log.push(entry);
        Self {
            id: Ulid::new(),
            head: Mutex::new(Version::GENESIS),
            arena: RwLock::new(Arena {
                states: vec![Arc::new(genesis)],
                log,
            }),
            sink: None,
        }
    }

    /// Start a builder
    #[inline]
    #[must_use]
    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    /// Persist writes made from now on to `sink`
    ///
    /// Versions already in the store are not sent; use this to keep extending
    /// a log the store was rebuilt from.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Store instance id
    #[inline]
    #[must_use]
    pub fn id(&self) -> Ulid {
        self.id
    }

    /// Latest linear version number
    #[inline]
    #[must_use]
    pub fn head(&self) -> Version {
        *self.head.lock()
    }

    /// Latest linear snapshot
    #[must_use]
    pub fn current(&self) -> Arc<WorldState> {
        let head = self.head.lock();
        let arena = self.arena.read();
        // The head always indexes a published state.
        Arc::clone(&arena.states[head.get() as usize])
    }

    /// Snapshot at `version`
    ///
    /// # Errors
    /// Returns `NotFound` if the version was never created
    pub fn get(&self, version: Version) -> Result<Arc<WorldState>, StoreError> {
        let arena = self.arena.read();
        usize::try_from(version.get())
            .ok()
            .and_then(|idx| arena.states.get(idx))
            .cloned()
            .ok_or(StoreError::NotFound { version })
    }

    /// True if `version` exists
    #[inline]
    #[must_use]
    pub fn contains(&self, version: Version) -> bool {
        (version.get() as usize) < self.len()
    }

    /// Number of versions, including genesis
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.arena.read().states.len()
    }

    /// Always false; genesis exists from construction
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Apply `delta` as the next linear version
    ///
    /// # Errors
    /// - `StaleParent` if `parent` is not the current head
    /// - `NotFound` if `parent` does not exist
    /// - `DeltaRejected` if the delta fails validation
    #[tracing::instrument(skip(self, delta), fields(store = %self.id, author = delta.author.as_deref()))]
    pub fn commit(&self, parent: Version, delta: &Delta) -> Result<Arc<WorldState>, StoreError> {
        let mut head = self.head.lock();
        if *head != parent {
            tracing::debug!(%parent, head = %*head, "rejecting stale commit");
            return Err(StoreError::StaleParent {
                parent,
                head: *head,
            });
        }
        let base = self.get(parent)?;
        let state = self.publish(EntryKind::Linear, &base, delta)?;
        *head = state.version();
        tracing::debug!(version = %state.version(), "committed");
        Ok(state)
    }

    /// Apply `delta` to any existing version as a sibling branch
    ///
    /// # Errors
    /// - `NotFound` if `parent` does not exist
    /// - `DeltaRejected` if the delta fails validation
    #[tracing::instrument(skip(self, delta), fields(store = %self.id, author = delta.author.as_deref()))]
    pub fn branch(&self, parent: Version, delta: &Delta) -> Result<Arc<WorldState>, StoreError> {
        let base = self.get(parent)?;
        let state = self.publish(EntryKind::Branch, &base, delta)?;
        tracing::debug!(version = %state.version(), "branched");
        Ok(state)
    }

    fn publish(
        &self,
        kind: EntryKind,
        base: &WorldState,
        delta: &Delta,
    ) -> Result<Arc<WorldState>, StoreError> {
        // Validation and application run outside the arena lock; the
        // version number is assigned only once the write is certain.
        let mut state = delta.apply(base, base.version(), Some(base.version()))?;

        let mut arena = self.arena.write();
        let version = Version(arena.states.len() as u64);
        state.version = version;
        let entry = LogEntry {
            version,
            parent_version: Some(base.version()),
            kind,
            delta: delta.clone(),
            timestamp: Utc::now(),
            state_hash: Some(state.state_hash()?),
        };
        if let Some(sink) = &self.sink {
            sink.append(&entry)?;
        }
        arena.log.push(entry);
        let state = Arc::new(state);
        arena.states.push(Arc::clone(&state));
        Ok(state)
    }

    /// Copy of the full log
    #[must_use]
    pub fn log(&self) -> TurnLog {
        self.arena.read().log.clone()
    }

    /// Log entry that created `version`
    ///
    /// # Errors
    /// Returns `NotFound` if the version was never created
    pub fn entry(&self, version: Version) -> Result<LogEntry, StoreError> {
        self.arena
            .read()
            .log
            .entry(version)
            .cloned()
            .ok_or(StoreError::NotFound { version })
    }

    /// Parent chain of `version`, genesis first
    ///
    /// # Errors
    /// Returns `NotFound` if the version was never created
    pub fn lineage(&self, version: Version) -> Result<Vec<Version>, StoreError> {
        let arena = self.arena.read();
        let mut chain = Vec::new();
        let mut cursor = Some(version);
        while let Some(v) = cursor {
            let state = arena
                .states
                .get(v.get() as usize)
                .ok_or(StoreError::NotFound { version: v })?;
            chain.push(v);
            cursor = state.parent_version();
        }
        chain.reverse();
        Ok(chain)
    }

    /// Direct descendants of `version`, linear and branch
    #[must_use]
    pub fn children(&self, version: Version) -> Vec<Version> {
        self.arena
            .read()
            .states
            .iter()
            .filter(|s| s.parent_version() == Some(version))
            .map(|s| s.version())
            .collect()
    }

    /// Rebuild `version` by folding logged deltas along its lineage
    ///
    /// # Errors
    /// Returns `NotFound` for unknown versions, or any error replaying a delta
    pub fn reconstruct(&self, version: Version) -> Result<WorldState, StoreError> {
        let lineage = self.lineage(version)?;
        let arena = self.arena.read();
        let mut state = WorldState::empty();
        for v in lineage {
            let entry = arena
                .log
                .entry(v)
                .ok_or(StoreError::NotFound { version: v })?;
            state = entry.delta.apply(&state, v, entry.parent_version)?;
        }
        Ok(state)
    }
}

impl Default for WorldStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for stores with a genesis delta or a durable sink
#[derive(Debug, Default)]
pub struct StoreBuilder {
    genesis: Delta,
    sink: Option<Arc<dyn LogSink>>,
}

impl StoreBuilder {
    /// Delta applied to the empty world to form version 0
    #[must_use]
    pub fn genesis(mut self, delta: Delta) -> Self {
        self.genesis = delta;
        self
    }

    /// Persist every write, including genesis, to `sink`
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Create the store
    ///
    /// # Errors
    /// Returns error if the genesis delta is rejected or cannot be logged
    pub fn build(self) -> Result<WorldStore, StoreError> {
        let genesis = self
            .genesis
            .apply(&WorldState::empty(), Version::GENESIS, None)?;
        let entry = LogEntry {
            version: Version::GENESIS,
            parent_version: None,
            kind: EntryKind::Genesis,
            delta: self.genesis,
            timestamp: Utc::now(),
            state_hash: Some(genesis.state_hash()?),
        };
        if let Some(sink) = &self.sink {
            sink.append(&entry)?;
        }
        let mut log = TurnLog::new();
        log.push(entry);
        Ok(WorldStore {
            id: Ulid::new(),
            head: Mutex::new(Version::GENESIS),
            arena: RwLock::new(Arena {
                states: vec![Arc::new(genesis)],
                log,
            }),
            sink: self.sink,
        })
    }
}

/// Store-level errors; these always surface to the caller
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Unknown version requested
    #[error("version {version} not found")]
    NotFound { version: Version },

    /// Linear commit against a parent that is no longer the head
    #[error("stale parent {parent}: head is {head}")]
    StaleParent { parent: Version, head: Version },

    /// Delta failed validation
    #[error("delta rejected: {0}")]
    DeltaRejected(#[from] DeltaError),

    /// Durable log write failed
    #[error("log write failed: {0}")]
    Log(#[from] LogError),

    /// Snapshot could not be encoded
    #[error("snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// True for optimistic-concurrency conflicts
    #[inline]
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleParent { .. })
    }

    /// True when the caller's delta was at fault rather than the store
    #[inline]
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::DeltaRejected(_))
    }
}
