//! Catalog of perturbable variables
//!
//! Each entry names one attribute path, the alternate values it may take,
//! and an optional profile the auditor uses to label divergences.

use crate::error::WhatIfError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use worldline_state::{AttributePath, WorldState};

/// What kind of cue a variable is, for bias labelling
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableCategory {
    /// A prior commitment or sunk investment
    Commitment,
    /// The adversary's assumed state or intent
    Adversary,
    /// An early reference figure
    Anchor,
    /// The latest report
    Recent,
    /// A vivid, easily recalled cue
    Salient,
    #[default]
    Other,
}

/// How changing the variable moves objective risk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskEffect {
    Increases,
    #[default]
    Neutral,
    Decreases,
}

impl fmt::Display for VariableCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Commitment => "commitment",
            Self::Adversary => "adversary",
            Self::Anchor => "anchor",
            Self::Recent => "recent",
            Self::Salient => "salient",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

impl fmt::Display for RiskEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Increases => "increases",
            Self::Neutral => "neutral",
            Self::Decreases => "decreases",
        };
        f.write_str(s)
    }
}

/// Auditor-facing description of a variable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariableProfile {
    #[serde(default)]
    pub category: VariableCategory,
    #[serde(default)]
    pub risk: RiskEffect,
}

impl VariableProfile {
    /// Create new profile
    #[inline]
    #[must_use]
    pub fn new(category: VariableCategory, risk: RiskEffect) -> Self {
        Self { category, risk }
    }
}

/// Alternates and optional profile for one path
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSpec {
    pub alternates: Vec<Value>,
    pub profile: Option<VariableProfile>,
}

/// One path that can be perturbed at a given base, with its usable alternates
#[derive(Debug, Clone, PartialEq)]
pub struct EligibleVariable {
    pub path: AttributePath,
    pub current: Option<Value>,
    pub alternates: Vec<Value>,
}

/// Insertion-ordered variable catalog
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableCatalog {
    variables: IndexMap<AttributePath, VariableSpec>,
}

#[derive(Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "variable")]
    variables: Vec<CatalogEntry>,
}

#[derive(Serialize, Deserialize)]
struct CatalogEntry {
    path: AttributePath,
    alternates: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    category: Option<VariableCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    risk: Option<RiskEffect>,
}

impl VariableCatalog {
    /// Empty catalog
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With an unprofiled variable
    #[must_use]
    pub fn with_variable<I, V>(mut self, path: AttributePath, alternates: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.insert(path, alternates.into_iter().map(Into::into).collect(), None);
        self
    }

    /// With a profiled variable
    #[must_use]
    pub fn with_profiled<I, V>(
        mut self,
        path: AttributePath,
        alternates: I,
        profile: VariableProfile,
    ) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.insert(
            path,
            alternates.into_iter().map(Into::into).collect(),
            Some(profile),
        );
        self
    }

    /// Add or replace a variable, keeping its original position on replace
    pub fn insert(
        &mut self,
        path: AttributePath,
        alternates: Vec<Value>,
        profile: Option<VariableProfile>,
    ) {
        self.variables.insert(
            path,
            VariableSpec {
                alternates,
                profile,
            },
        );
    }

    /// Number of variables
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    /// True if no variables are listed
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Variables in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&AttributePath, &VariableSpec)> {
        self.variables.iter()
    }

    /// Spec for one path
    #[must_use]
    pub fn get(&self, path: &AttributePath) -> Option<&VariableSpec> {
        self.variables.get(path)
    }

    /// Profile for `path`; unlisted or unprofiled paths are `other`/`neutral`
    #[must_use]
    pub fn profile(&self, path: &AttributePath) -> VariableProfile {
        self.variables
            .get(path)
            .and_then(|spec| spec.profile)
            .unwrap_or_default()
    }

    /// Variables that can change something at `base`, in catalog order
    ///
    /// A variable is skipped if its entity does not exist at `base` or every
    /// alternate equals the current value.
    #[must_use]
    pub fn eligible(&self, base: &WorldState) -> Vec<EligibleVariable> {
        self.variables
            .iter()
            .filter_map(|(path, spec)| {
                if base.entity(path.entity().as_str()).is_none() {
                    tracing::debug!(%path, "entity missing at base; not eligible");
                    return None;
                }
                let current = base.value_at(path).cloned();
                let mut alternates: Vec<Value> = Vec::with_capacity(spec.alternates.len());
                for alt in &spec.alternates {
                    if current.as_ref() != Some(alt) && !alternates.contains(alt) {
                        alternates.push(alt.clone());
                    }
                }
                if alternates.is_empty() {
                    tracing::debug!(%path, "no alternate differs from base; not eligible");
                    return None;
                }
                Some(EligibleVariable {
                    path: path.clone(),
                    current,
                    alternates,
                })
            })
            .collect()
    }

    /// Parse from TOML `[[variable]]` tables
    ///
    /// # Errors
    /// Returns `WhatIfError::Config` on a parse failure or duplicate path
    pub fn from_toml_str(s: &str) -> Result<Self, WhatIfError> {
        let file: CatalogFile = toml::from_str(s).map_err(|e| WhatIfError::Config(e.to_string()))?;
        let mut catalog = Self::new();
        for entry in file.variables {
            if catalog.variables.contains_key(&entry.path) {
                return Err(WhatIfError::Config(format!(
                    "variable {} listed twice",
                    entry.path
                )));
            }
            let profile = match (entry.category, entry.risk) {
                (None, None) => None,
                (category, risk) => Some(VariableProfile::new(
                    category.unwrap_or_default(),
                    risk.unwrap_or_default(),
                )),
            };
            catalog.insert(entry.path, entry.alternates, profile);
        }
        Ok(catalog)
    }

    /// Render as TOML `[[variable]]` tables
    ///
    /// # Errors
    /// Returns `WhatIfError::Config` if a value has no TOML form (e.g. null)
    pub fn to_toml_string(&self) -> Result<String, WhatIfError> {
        let file = CatalogFile {
            variables: self
                .variables
                .iter()
                .map(|(path, spec)| CatalogEntry {
                    path: path.clone(),
                    alternates: spec.alternates.clone(),
                    category: spec.profile.map(|p| p.category),
                    risk: spec.profile.map(|p| p.risk),
                })
                .collect(),
        };
        toml::to_string(&file).map_err(|e| WhatIfError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use worldline_state::{Delta, Entity, EntityKind, WorldStore};

    fn path(s: &str) -> AttributePath {
        s.parse().unwrap()
    }

    fn base() -> std::sync::Arc<WorldState> {
        WorldStore::builder()
            .genesis(
                Delta::builder()
                    .create(
                        "weather",
                        Entity::new(EntityKind::Event, 0.9).with_attribute("value", "clear"),
                    )
                    .build(),
            )
            .build()
            .unwrap()
            .current()
    }

    #[test]
    fn eligibility_filters_missing_entities_and_no_op_values() {
        let catalog = VariableCatalog::new()
            .with_variable(path("weather"), ["clear", "storm", "storm"])
            .with_variable(path("ghost.value"), ["anything"])
            .with_variable(path("weather.wind"), [json!(30)])
            .with_variable(path("weather.value"), ["clear"]);

        let eligible = catalog.eligible(&base());
        assert_eq!(eligible.len(), 2);
        assert_eq!(eligible[0].path, path("weather"));
        assert_eq!(eligible[0].current, Some(json!("clear")));
        assert_eq!(eligible[0].alternates, vec![json!("storm")]);
        assert_eq!(eligible[1].path, path("weather.wind"));
        assert_eq!(eligible[1].current, None);
    }

    #[test]
    fn unprofiled_defaults_to_other_neutral() {
        let catalog = VariableCatalog::new().with_profiled(
            path("weather"),
            ["storm"],
            VariableProfile::new(VariableCategory::Salient, RiskEffect::Increases),
        );
        assert_eq!(catalog.profile(&path("weather")).category, VariableCategory::Salient);
        assert_eq!(
            catalog.profile(&path("readiness")),
            VariableProfile::new(VariableCategory::Other, RiskEffect::Neutral)
        );
    }

    #[test]
    fn toml_catalog() {
        let catalog = VariableCatalog::from_toml_str(
            r#"
            [[variable]]
            path = "weather"
            alternates = ["storm", "fog"]
            category = "salient"
            risk = "increases"

            [[variable]]
            path = "adversary.strength"
            alternates = [1, 5]
            category = "adversary"
            "#,
        )
        .unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(
            catalog.profile(&path("adversary.strength")),
            VariableProfile::new(VariableCategory::Adversary, RiskEffect::Neutral)
        );
        let order: Vec<_> = catalog.iter().map(|(p, _)| p.to_string()).collect();
        assert_eq!(order, ["weather.value", "adversary.strength"]);

        let again = VariableCatalog::from_toml_str(&catalog.to_toml_string().unwrap()).unwrap();
        assert_eq!(again, catalog);
    }

    #[test]
    fn duplicate_paths_rejected() {
        let err = VariableCatalog::from_toml_str(
            r#"
            [[variable]]
            path = "weather"
            alternates = ["storm"]

            [[variable]]
            path = "weather.value"
            alternates = ["fog"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, WhatIfError::Config(m) if m.contains("twice")));
    }
}
