//! Attribute paths for addressing single variables within a world
//!
//! Provides [`AttributePath`], the `entity.field` address that perturbations
//! change and that snapshot diffs report.

use crate::world::EntityId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Field addressed when a path names only an entity
pub const DEFAULT_FIELD: &str = "value";

/// Address of one attribute of one entity
///
/// # Examples
/// - `weather` → entity `weather`, field `value`
/// - `blue_fleet.readiness` → entity `blue_fleet`, field `readiness`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AttributePath {
    entity: EntityId,
    field: String,
}

impl AttributePath {
    /// Create a path from its parts
    #[inline]
    #[must_use]
    pub fn new(entity: impl Into<EntityId>, field: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            field: field.into(),
        }
    }

    /// Path to an entity's default field
    #[inline]
    #[must_use]
    pub fn entity_value(entity: impl Into<EntityId>) -> Self {
        Self::new(entity, DEFAULT_FIELD)
    }

    /// Entity part
    #[inline]
    #[must_use]
    pub fn entity(&self) -> &EntityId {
        &self.entity
    }

    /// Field part
    #[inline]
    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }
}

impl Display for AttributePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity, self.field)
    }
}

impl FromStr for AttributePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments = s
            .split('.')
            .map(validate_segment)
            .collect::<Result<Vec<_>, _>>()?;

        match segments.as_slice() {
            [entity] => Ok(Self::entity_value(*entity)),
            [entity, field] => Ok(Self::new(*entity, *field)),
            _ => Err(PathError::TooManySegments(s.to_string())),
        }
    }
}

fn validate_segment(seg: &str) -> Result<&str, PathError> {
    if seg.is_empty() {
        Err(PathError::EmptySegment)
    } else if seg.contains(|c: char| !c.is_alphanumeric() && c != '_' && c != '-') {
        Err(PathError::InvalidSegment(seg.to_string()))
    } else {
        Ok(seg)
    }
}

impl TryFrom<String> for AttributePath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AttributePath> for String {
    fn from(path: AttributePath) -> Self {
        path.to_string()
    }
}

/// Errors related to attribute paths
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// Empty segment in path
    #[error("path contains empty segment")]
    EmptySegment,

    /// Invalid segment characters
    #[error("invalid segment: {0} (must be alphanumeric, '_' or '-')")]
    InvalidSegment(String),

    /// More than `entity.field`
    #[error("path '{0}' has more than two segments")]
    TooManySegments(String),
}
