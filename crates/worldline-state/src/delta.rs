//! Deltas: atomic proposed changes to a world
//!
//! A [`Delta`] is validated in full against its base snapshot before any of
//! it is applied, so it either produces the next snapshot or is rejected
//! with a [`DeltaError`] and leaves nothing behind.

use crate::path::AttributePath;
use crate::world::{Entity, EntityId, EntityKind, OpenQuestion, TimelineEvent, Version, WorldState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Change to a single entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EntityPatch {
    /// Introduce a new entity; fails if the id exists
    Create {
        kind: EntityKind,
        confidence: f64,
        #[serde(default)]
        attributes: BTreeMap<String, Value>,
    },
    /// Set fields on an existing entity; fails if the id is unknown
    Update { fields: BTreeMap<String, Value> },
}

/// New confidence for an entity, with its one-line citation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceChange {
    /// Target entity
    pub entity: EntityId,
    /// New confidence, in `[0, 1]`
    pub confidence: f64,
    /// Single-line evidence citation
    pub evidence: String,
}

/// Change to the open-question set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QuestionChange {
    /// Add a new gap
    Raise(OpenQuestion),
    /// Close an existing gap
    Resolve { id: String },
}

/// Atomic unit of change proposed by a stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Stage or actor that proposed the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Entity creations and field updates
    #[serde(default)]
    pub entities: BTreeMap<EntityId, EntityPatch>,
    /// Events appended to the timeline
    #[serde(default)]
    pub timeline: Vec<TimelineEvent>,
    /// Evidence-cited confidence updates
    #[serde(default)]
    pub confidence: Vec<ConfidenceChange>,
    /// Open-question changes
    #[serde(default)]
    pub questions: Vec<QuestionChange>,
}

impl Delta {
    /// Empty delta
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a builder
    #[inline]
    #[must_use]
    pub fn builder() -> DeltaBuilder {
        DeltaBuilder::default()
    }

    /// Delta setting exactly one attribute
    #[must_use]
    pub fn set(path: &AttributePath, value: Value) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(path.field().to_string(), value);
        let mut entities = BTreeMap::new();
        entities.insert(path.entity().clone(), EntityPatch::Update { fields });
        Self {
            entities,
            ..Self::default()
        }
    }

    /// True if applying would change nothing but the version
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.timeline.is_empty()
            && self.confidence.is_empty()
            && self.questions.is_empty()
    }

    /// Check every operation against `base` without applying anything
    ///
    /// # Errors
    /// Returns the first violation found
    pub fn validate(&self, base: &WorldState) -> Result<(), DeltaError> {
        let mut created = BTreeSet::new();
        for (id, patch) in &self.entities {
            let exists = base.entities.contains_key(id);
            match patch {
                EntityPatch::Create { confidence, .. } => {
                    if exists {
                        return Err(DeltaError::EntityExists(id.clone()));
                    }
                    check_confidence(id, *confidence)?;
                    created.insert(id);
                }
                EntityPatch::Update { fields } => {
                    if !exists {
                        return Err(DeltaError::UnknownEntity(id.clone()));
                    }
                    if fields.is_empty() {
                        return Err(DeltaError::EmptyUpdate(id.clone()));
                    }
                }
            }
        }

        let mut last_turn = base.last_turn();
        for event in &self.timeline {
            if let Some(last) = last_turn {
                if event.turn < last {
                    return Err(DeltaError::TimelineRegression {
                        turn: event.turn,
                        last,
                    });
                }
            }
            if !event.confidence_delta.is_finite() {
                return Err(DeltaError::NonFinite("timeline.confidence_delta"));
            }
            last_turn = Some(event.turn);
        }

        for change in &self.confidence {
            if !base.entities.contains_key(&change.entity) && !created.contains(&change.entity) {
                return Err(DeltaError::UnknownEntity(change.entity.clone()));
            }
            check_confidence(&change.entity, change.confidence)?;
            let evidence = change.evidence.trim();
            if evidence.is_empty() || evidence.contains('\n') {
                return Err(DeltaError::BadEvidence(change.entity.clone()));
            }
        }

        let mut raised = BTreeSet::new();
        let mut resolved = BTreeSet::new();
        for change in &self.questions {
            match change {
                QuestionChange::Raise(q) => {
                    let open = (base.open_questions.contains_key(&q.id) && !resolved.contains(&q.id))
                        || raised.contains(&q.id);
                    if open {
                        return Err(DeltaError::QuestionExists(q.id.clone()));
                    }
                    raised.insert(q.id.clone());
                }
                QuestionChange::Resolve { id } => {
                    let open = (base.open_questions.contains_key(id) && !resolved.contains(id))
                        || raised.contains(id);
                    if !open {
                        return Err(DeltaError::UnknownQuestion(id.clone()));
                    }
                    raised.remove(id);
                    resolved.insert(id.clone());
                }
            }
        }

        Ok(())
    }

    /// Produce the snapshot that results from applying `self` to `base`
    ///
    /// # Errors
    /// Returns error if validation fails; `base` is never modified
    pub fn apply(
        &self,
        base: &WorldState,
        version: Version,
        parent: Option<Version>,
    ) -> Result<WorldState, DeltaError> {
        self.validate(base)?;

        let mut next = base.clone();
        next.version = version;
        next.parent_version = parent;

        for (id, patch) in &self.entities {
            match patch {
                EntityPatch::Create {
                    kind,
                    confidence,
                    attributes,
                } => {
                    let mut entity = Entity::new(*kind, *confidence);
                    entity.attributes = attributes.clone();
                    next.entities.insert(id.clone(), entity);
                }
                EntityPatch::Update { fields } => {
                    if let Some(entity) = next.entities.get_mut(id) {
                        entity
                            .attributes
                            .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                }
            }
        }

        next.timeline.extend(self.timeline.iter().cloned());

        for change in &self.confidence {
            if let Some(entity) = next.entities.get_mut(&change.entity) {
                entity.confidence = change.confidence;
            }
        }

        for change in &self.questions {
            match change {
                QuestionChange::Raise(q) => {
                    next.open_questions.insert(q.id.clone(), q.clone());
                }
                QuestionChange::Resolve { id } => {
                    next.open_questions.remove(id);
                }
            }
        }

        Ok(next)
    }
}

fn check_confidence(id: &EntityId, value: f64) -> Result<(), DeltaError> {
    if !value.is_finite() {
        return Err(DeltaError::NonFinite("confidence"));
    }
    if !(0.0..=1.0).contains(&value) {
        return Err(DeltaError::ConfidenceOutOfRange {
            entity: id.clone(),
            value,
        });
    }
    Ok(())
}

/// Reasons a delta is rejected in full
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeltaError {
    /// Update or confidence change names a missing entity
    #[error("unknown entity: {0}")]
    UnknownEntity(EntityId),

    /// Create names an entity that already exists
    #[error("entity already exists: {0}")]
    EntityExists(EntityId),

    /// Update without fields
    #[error("update for {0} sets no fields")]
    EmptyUpdate(EntityId),

    /// Confidence outside `[0, 1]`
    #[error("confidence {value} for {entity} outside [0, 1]")]
    ConfidenceOutOfRange { entity: EntityId, value: f64 },

    /// NaN or infinite number
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),

    /// Missing or multi-line evidence citation
    #[error("confidence change for {0} needs a one-line evidence citation")]
    BadEvidence(EntityId),

    /// Timeline event older than the last recorded one
    #[error("timeline event for turn {turn} precedes recorded turn {last}")]
    TimelineRegression { turn: u64, last: u64 },

    /// Raise of an already open question
    #[error("question already open: {0}")]
    QuestionExists(String),

    /// Resolve of a question that is not open
    #[error("question not open: {0}")]
    UnknownQuestion(String),

    /// Rejected by a policy check outside the world model
    #[error("policy violation: {0}")]
    Policy(String),
}

/// Builder for constructing deltas
#[derive(Debug, Default)]
pub struct DeltaBuilder {
    delta: Delta,
}

impl DeltaBuilder {
    /// Set the author
    #[must_use]
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.delta.author = Some(author.into());
        self
    }

    /// Create an entity
    #[must_use]
    pub fn create(mut self, id: impl Into<EntityId>, entity: Entity) -> Self {
        self.delta.entities.insert(
            id.into(),
            EntityPatch::Create {
                kind: entity.kind,
                confidence: entity.confidence,
                attributes: entity.attributes,
            },
        );
        self
    }

    /// Set one field on an existing entity; repeated calls merge
    #[must_use]
    pub fn set(mut self, id: impl Into<EntityId>, field: impl Into<String>, value: impl Into<Value>) -> Self {
        let id = id.into();
        let field = field.into();
        let value = value.into();
        match self.delta.entities.get_mut(&id) {
            Some(EntityPatch::Update { fields }) => {
                fields.insert(field, value);
            }
            Some(EntityPatch::Create { attributes, .. }) => {
                attributes.insert(field, value);
            }
            None => {
                let mut fields = BTreeMap::new();
                fields.insert(field, value);
                self.delta.entities.insert(id, EntityPatch::Update { fields });
            }
        }
        self
    }

    /// Append a timeline event
    #[must_use]
    pub fn event(mut self, event: TimelineEvent) -> Self {
        self.delta.timeline.push(event);
        self
    }

    /// Change an entity's confidence
    #[must_use]
    pub fn confidence(
        mut self,
        id: impl Into<EntityId>,
        confidence: f64,
        evidence: impl Into<String>,
    ) -> Self {
        self.delta.confidence.push(ConfidenceChange {
            entity: id.into(),
            confidence,
            evidence: evidence.into(),
        });
        self
    }

    /// Raise an open question
    #[must_use]
    pub fn raise(mut self, id: impl Into<String>, description: impl Into<String>, priority: u8) -> Self {
        self.delta.questions.push(QuestionChange::Raise(OpenQuestion {
            id: id.into(),
            description: description.into(),
            priority,
        }));
        self
    }

    /// Resolve an open question
    #[must_use]
    pub fn resolve(mut self, id: impl Into<String>) -> Self {
        self.delta
            .questions
            .push(QuestionChange::Resolve { id: id.into() });
        self
    }

    /// Finish
    #[must_use]
    pub fn build(self) -> Delta {
        self.delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> WorldState {
        Delta::builder()
            .create(
                "weather",
                Entity::new(EntityKind::Event, 0.9).with_attribute("value", "clear"),
            )
            .create("fleet", Entity::new(EntityKind::Actor, 0.6))
            .event(TimelineEvent::new(1, "fleet sortie"))
            .raise("q1", "adversary intent", 3)
            .build()
            .apply(&WorldState::empty(), Version::GENESIS, None)
            .unwrap()
    }

    #[test]
    fn apply_produces_next_version() {
        let delta = Delta::builder()
            .set("weather", "value", "storm")
            .confidence("fleet", 0.8, "sensor report 14")
            .build();
        let next = delta.apply(&base(), Version(1), Some(Version(0))).unwrap();

        assert_eq!(next.version(), Version(1));
        assert_eq!(next.parent_version(), Some(Version(0)));
        assert_eq!(next.value_at(&"weather".parse().unwrap()), Some(&json!("storm")));
        assert_eq!(next.entity("fleet").unwrap().confidence, 0.8);
    }

    #[test]
    fn update_unknown_entity_rejected() {
        let delta = Delta::builder().set("ghost", "value", 1).build();
        assert_eq!(
            delta.validate(&base()),
            Err(DeltaError::UnknownEntity("ghost".into()))
        );
    }

    #[test]
    fn create_existing_entity_rejected() {
        let delta = Delta::builder()
            .create("fleet", Entity::new(EntityKind::Actor, 0.5))
            .build();
        assert_eq!(
            delta.validate(&base()),
            Err(DeltaError::EntityExists("fleet".into()))
        );
    }

    #[test]
    fn confidence_on_created_entity_allowed() {
        let delta = Delta::builder()
            .create("port", Entity::new(EntityKind::Location, 0.5))
            .confidence("port", 0.9, "imagery pass 3")
            .build();
        let next = delta.apply(&base(), Version(1), Some(Version(0))).unwrap();
        assert_eq!(next.entity("port").unwrap().confidence, 0.9);
    }

    #[test]
    fn confidence_needs_single_line_evidence() {
        let multi = Delta::builder()
            .confidence("fleet", 0.5, "line one\nline two")
            .build();
        assert!(matches!(multi.validate(&base()), Err(DeltaError::BadEvidence(_))));

        let blank = Delta::builder().confidence("fleet", 0.5, "  ").build();
        assert!(matches!(blank.validate(&base()), Err(DeltaError::BadEvidence(_))));
    }

    #[test]
    fn confidence_range_checked() {
        let delta = Delta::builder().confidence("fleet", 1.5, "report").build();
        assert!(matches!(
            delta.validate(&base()),
            Err(DeltaError::ConfidenceOutOfRange { .. })
        ));
        let nan = Delta::builder().confidence("fleet", f64::NAN, "report").build();
        assert!(matches!(nan.validate(&base()), Err(DeltaError::NonFinite(_))));
    }

    #[test]
    fn timeline_cannot_go_backwards() {
        let delta = Delta::builder().event(TimelineEvent::new(0, "late")).build();
        assert_eq!(
            delta.validate(&base()),
            Err(DeltaError::TimelineRegression { turn: 0, last: 1 })
        );
    }

    #[test]
    fn rejected_delta_applies_nothing() {
        let base = base();
        let before = base.clone();
        let delta = Delta::builder()
            .set("weather", "value", "storm")
            .set("ghost", "value", 1)
            .build();
        assert!(delta.apply(&base, Version(1), Some(Version(0))).is_err());
        assert_eq!(base, before);
    }

    #[test]
    fn question_lifecycle() {
        let resolve = Delta::builder().resolve("q1").build();
        let next = resolve.apply(&base(), Version(1), Some(Version(0))).unwrap();
        assert!(next.open_questions().is_empty());

        let twice = Delta::builder().raise("q1", "again", 1).build();
        assert_eq!(
            twice.validate(&base()),
            Err(DeltaError::QuestionExists("q1".into()))
        );

        let unknown = Delta::builder().resolve("q9").build();
        assert_eq!(
            unknown.validate(&base()),
            Err(DeltaError::UnknownQuestion("q9".into()))
        );

        let reopen = Delta::builder().resolve("q1").raise("q1", "reopened", 5).build();
        let next = reopen.apply(&base(), Version(1), Some(Version(0))).unwrap();
        assert_eq!(next.open_questions()["q1"].priority, 5);
    }

    #[test]
    fn set_builds_single_field_update() {
        let path: AttributePath = "fleet.readiness".parse().unwrap();
        let delta = Delta::set(&path, json!("degraded"));
        assert_eq!(delta.entities.len(), 1);
        assert!(matches!(
            &delta.entities[&EntityId::new("fleet")],
            EntityPatch::Update { fields } if fields.len() == 1
        ));
    }

    #[test]
    fn delta_serde_shape() {
        let delta = Delta::builder()
            .author("analyst")
            .set("fleet", "readiness", "degraded")
            .build();
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json["author"], json!("analyst"));
        assert_eq!(json["entities"]["fleet"]["op"], json!("update"));
        let back: Delta = serde_json::from_value(json).unwrap();
        assert_eq!(back, delta);
    }
}
