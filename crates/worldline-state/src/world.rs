//! World snapshots
//!
//! A [`WorldState`] is one immutable version of the shared situational model:
//! entities with attributes and confidence, an append-only timeline, and the
//! set of open questions. Snapshots are produced only by the store.

use crate::hash::StateHash;
use crate::path::AttributePath;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Marker carried by every exported snapshot
pub const SYNTHETIC_DISCLAIMER: &str =
    "All data is artificially generated for research and educational purposes only.";

/// Snapshot version number, unique per store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    /// The genesis snapshot
    pub const GENESIS: Self = Self(0);

    /// Raw number
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Following version number
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Entity identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Create from any string
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// What an entity represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A participant (unit, cell, person)
    Actor,
    /// A place
    Location,
    /// Something that happened or is happening
    Event,
    /// A flagged unknown
    Uncertainty,
}

/// One entity record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity kind
    pub kind: EntityKind,
    /// Belief in this record, in `[0, 1]`
    pub confidence: f64,
    /// Free-form attributes, sorted for canonical encoding
    pub attributes: BTreeMap<String, Value>,
}

impl Entity {
    /// New entity without attributes
    #[inline]
    #[must_use]
    pub fn new(kind: EntityKind, confidence: f64) -> Self {
        Self {
            kind,
            confidence,
            attributes: BTreeMap::new(),
        }
    }

    /// Add an attribute
    #[inline]
    #[must_use]
    pub fn with_attribute(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(field.into(), value.into());
        self
    }

    /// Attribute lookup
    #[inline]
    #[must_use]
    pub fn attribute(&self, field: &str) -> Option<&Value> {
        self.attributes.get(field)
    }
}

/// Timeline record, never mutated after the turn that created it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Turn that produced the event
    pub turn: u64,
    /// What happened
    pub description: String,
    /// Citations supporting the event
    #[serde(default)]
    pub evidence_refs: Vec<String>,
    /// Net confidence movement attributed to the event
    #[serde(default)]
    pub confidence_delta: f64,
}

impl TimelineEvent {
    /// Event without evidence or confidence movement
    #[must_use]
    pub fn new(turn: u64, description: impl Into<String>) -> Self {
        Self {
            turn,
            description: description.into(),
            evidence_refs: Vec::new(),
            confidence_delta: 0.0,
        }
    }

    /// Attach an evidence reference
    #[must_use]
    pub fn with_evidence(mut self, reference: impl Into<String>) -> Self {
        self.evidence_refs.push(reference.into());
        self
    }

    /// Set the confidence movement
    #[must_use]
    pub fn with_confidence_delta(mut self, delta: f64) -> Self {
        self.confidence_delta = delta;
        self
    }
}

/// Outstanding information gap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenQuestion {
    /// Stable question id
    pub id: String,
    /// What is unknown
    pub description: String,
    /// Higher is more urgent
    pub priority: u8,
}

/// One difference between two snapshots, ignoring version metadata
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Difference {
    /// Entity exists in only one snapshot
    Presence(EntityId),
    /// Entity kind changed
    Kind(EntityId),
    /// Entity confidence changed
    Confidence(EntityId),
    /// One attribute value changed, appeared or disappeared
    Attribute(AttributePath),
    /// Timeline contents differ
    Timeline,
    /// Open question added, removed or changed
    Question(String),
}

impl Display for Difference {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Presence(id) => write!(f, "entities.{id}"),
            Self::Kind(id) => write!(f, "entities.{id}.kind"),
            Self::Confidence(id) => write!(f, "entities.{id}.confidence"),
            Self::Attribute(path) => write!(f, "entities.{path}"),
            Self::Timeline => f.write_str("timeline"),
            Self::Question(id) => write!(f, "open_questions.{id}"),
        }
    }
}

/// Immutable snapshot of the shared world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    pub(crate) version: Version,
    pub(crate) parent_version: Option<Version>,
    pub(crate) entities: BTreeMap<EntityId, Entity>,
    pub(crate) timeline: Vec<TimelineEvent>,
    pub(crate) open_questions: BTreeMap<String, OpenQuestion>,
}

impl WorldState {
    /// World with nothing in it, the base that genesis deltas apply to
    #[must_use]
    pub(crate) fn empty() -> Self {
        Self {
            version: Version::GENESIS,
            parent_version: None,
            entities: BTreeMap::new(),
            timeline: Vec::new(),
            open_questions: BTreeMap::new(),
        }
    }

    /// Snapshot version
    #[inline]
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Version this snapshot was derived from (`None` for genesis)
    #[inline]
    #[must_use]
    pub fn parent_version(&self) -> Option<Version> {
        self.parent_version
    }

    /// All entities
    #[inline]
    #[must_use]
    pub fn entities(&self) -> &BTreeMap<EntityId, Entity> {
        &self.entities
    }

    /// Single entity lookup
    #[inline]
    #[must_use]
    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    /// Timeline, oldest first
    #[inline]
    #[must_use]
    pub fn timeline(&self) -> &[TimelineEvent] {
        &self.timeline
    }

    /// Open questions by id
    #[inline]
    #[must_use]
    pub fn open_questions(&self) -> &BTreeMap<String, OpenQuestion> {
        &self.open_questions
    }

    /// Value at an attribute path
    #[must_use]
    pub fn value_at(&self, path: &AttributePath) -> Option<&Value> {
        self.entities
            .get(path.entity().as_str())
            .and_then(|e| e.attribute(path.field()))
    }

    /// Turn of the latest timeline event
    #[must_use]
    pub fn last_turn(&self) -> Option<u64> {
        self.timeline.last().map(|e| e.turn)
    }

    /// Deterministic encoding; equal snapshots yield equal bytes
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Blake3 hash of [`Self::canonical_bytes`]
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn state_hash(&self) -> Result<StateHash, serde_json::Error> {
        Ok(StateHash::compute(&self.canonical_bytes()?))
    }

    /// Every difference between `self` and `other`, content only
    #[must_use]
    pub fn differences(&self, other: &Self) -> Vec<Difference> {
        let mut out = Vec::new();

        for (id, mine) in &self.entities {
            let Some(theirs) = other.entities.get(id) else {
                out.push(Difference::Presence(id.clone()));
                continue;
            };
            if mine.kind != theirs.kind {
                out.push(Difference::Kind(id.clone()));
            }
            if mine.confidence.to_bits() != theirs.confidence.to_bits() {
                out.push(Difference::Confidence(id.clone()));
            }
            let fields = mine.attributes.keys().chain(theirs.attributes.keys());
            let mut seen = std::collections::BTreeSet::new();
            for field in fields {
                if seen.insert(field) && mine.attributes.get(field) != theirs.attributes.get(field) {
                    out.push(Difference::Attribute(AttributePath::new(id.clone(), field.clone())));
                }
            }
        }
        for id in other.entities.keys() {
            if !self.entities.contains_key(id) {
                out.push(Difference::Presence(id.clone()));
            }
        }

        if self.timeline != other.timeline {
            out.push(Difference::Timeline);
        }

        let question_ids = self.open_questions.keys().chain(other.open_questions.keys());
        let mut seen = std::collections::BTreeSet::new();
        for id in question_ids {
            if seen.insert(id) && self.open_questions.get(id) != other.open_questions.get(id) {
                out.push(Difference::Question(id.clone()));
            }
        }

        out.sort();
        out
    }

    /// Wrap for export with the synthetic-data marker
    #[inline]
    #[must_use]
    pub fn envelope(&self) -> SnapshotEnvelope<'_> {
        SnapshotEnvelope {
            synthetic: true,
            disclaimer: SYNTHETIC_DISCLAIMER,
            state: self,
        }
    }
}

/// Export form of a snapshot
#[derive(Debug, Serialize)]
pub struct SnapshotEnvelope<'a> {
    /// Always `true`
    pub synthetic: bool,
    /// Fixed disclaimer text
    pub disclaimer: &'static str,
    /// The snapshot itself
    pub state: &'a WorldState,
}
