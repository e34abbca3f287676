//! Perturbation engine
//!
//! Derives sibling worlds from a base version, each changing exactly one
//! catalog variable. Every sibling is a `branch()` off the base, so the
//! head and the linear turn history are never touched.

use crate::catalog::{EligibleVariable, VariableCatalog};
use crate::config::WhatIfConfig;
use crate::error::WhatIfError;
use rand::rngs::StdRng;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use worldline_state::{AttributePath, Delta, Difference, Version, WorldState, WorldStore};

/// One derived sibling and the single change that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Perturbation {
    pub base_version: Version,
    pub decision_point: String,
    pub changed_variable: AttributePath,
    /// Value at the base; `None` if the field was unset
    pub old_value: Option<Value>,
    pub new_value: Value,
    pub derived_version: Version,
}

/// A chosen change not yet written to the store
#[derive(Debug, Clone, PartialEq)]
struct Plan {
    path: AttributePath,
    old_value: Option<Value>,
    new_value: Value,
}

/// Generates single-variable sibling branches
#[derive(Debug, Clone)]
pub struct PerturbationEngine {
    store: Arc<WorldStore>,
    config: WhatIfConfig,
}

impl PerturbationEngine {
    /// Create new engine over `store` with default settings
    #[inline]
    #[must_use]
    pub fn new(store: Arc<WorldStore>) -> Self {
        Self::with_config(store, WhatIfConfig::default())
    }

    /// Create new engine with explicit settings
    #[inline]
    #[must_use]
    pub fn with_config(store: Arc<WorldStore>, config: WhatIfConfig) -> Self {
        Self { store, config }
    }

    /// Store branches are written to
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<WorldStore> {
        &self.store
    }

    /// Active settings
    #[inline]
    #[must_use]
    pub fn config(&self) -> &WhatIfConfig {
        &self.config
    }

    /// Generate up to `k` siblings of `base` for `decision_point`
    ///
    /// Variables are drawn without replacement; a catalog with fewer
    /// eligible variables than `k` yields all of them. Results follow
    /// selection order.
    ///
    /// # Errors
    /// - `WhatIfError::Store` if `base` does not exist or a branch fails
    /// - `WhatIfError::NotSingleVariable` if a sibling changed more than one path
    /// - `WhatIfError::Config` if `k` is zero
    #[tracing::instrument(skip(self, catalog), fields(k = self.config.k, seed = ?self.config.seed))]
    pub fn perturb(
        &self,
        base: Version,
        decision_point: &str,
        catalog: &VariableCatalog,
    ) -> Result<Vec<Perturbation>, WhatIfError> {
        self.config.validate()?;
        let base_state = self.store.get(base)?;
        let eligible = catalog.eligible(&base_state);
        let plans = select(eligible, self.config.k, self.config.seed);
        tracing::info!(
            eligible = catalog.len(),
            selected = plans.len(),
            "perturbing {base}"
        );

        let materialize = |plan: &Plan| self.materialize(&base_state, decision_point, plan);
        if self.config.parallel {
            plans.par_iter().map(materialize).collect()
        } else {
            plans.iter().map(materialize).collect()
        }
    }

    /// Branch `base` with one explicit change
    ///
    /// # Errors
    /// - `WhatIfError::NotPerturbable` if the entity is missing or the value is unchanged
    /// - `WhatIfError::Store` if `base` does not exist
    pub fn perturb_one(
        &self,
        base: Version,
        decision_point: &str,
        path: &AttributePath,
        value: Value,
    ) -> Result<Perturbation, WhatIfError> {
        let base_state = self.store.get(base)?;
        if base_state.entity(path.entity().as_str()).is_none() {
            return Err(WhatIfError::NotPerturbable {
                path: path.clone(),
                base,
                reason: "entity does not exist".into(),
            });
        }
        let old_value = base_state.value_at(path).cloned();
        if old_value.as_ref() == Some(&value) {
            return Err(WhatIfError::NotPerturbable {
                path: path.clone(),
                base,
                reason: "value already set".into(),
            });
        }
        let plan = Plan {
            path: path.clone(),
            old_value,
            new_value: value,
        };
        self.materialize(&base_state, decision_point, &plan)
    }

    fn materialize(
        &self,
        base: &WorldState,
        decision_point: &str,
        plan: &Plan,
    ) -> Result<Perturbation, WhatIfError> {
        let mut delta = Delta::set(&plan.path, plan.new_value.clone());
        delta.author = Some(format!("perturbation:{decision_point}"));

        let derived = self.store.branch(base.version(), &delta)?;
        let differences = base.differences(&derived);
        if differences != [Difference::Attribute(plan.path.clone())] {
            return Err(WhatIfError::NotSingleVariable {
                derived: derived.version(),
                differences,
            });
        }
        tracing::debug!(
            path = %plan.path,
            derived = %derived.version(),
            "sibling materialized"
        );

        Ok(Perturbation {
            base_version: base.version(),
            decision_point: decision_point.to_string(),
            changed_variable: plan.path.clone(),
            old_value: plan.old_value.clone(),
            new_value: plan.new_value.clone(),
            derived_version: derived.version(),
        })
    }
}

/// Pick up to `k` variables without replacement, one alternate each
fn select(mut eligible: Vec<EligibleVariable>, k: usize, seed: Option<u64>) -> Vec<Plan> {
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_rng(&mut rand::rng()),
    };
    eligible.shuffle(&mut rng);
    eligible.truncate(k);
    eligible
        .into_iter()
        .filter_map(|var| {
            let new_value = var.alternates.choose(&mut rng)?.clone();
            Some(Plan {
                path: var.path,
                old_value: var.current,
                new_value,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn var(path: &str, alternates: &[&str]) -> EligibleVariable {
        EligibleVariable {
            path: path.parse().unwrap(),
            current: None,
            alternates: alternates.iter().map(|a| json!(a)).collect(),
        }
    }

    fn pool() -> Vec<EligibleVariable> {
        vec![
            var("weather", &["storm", "fog"]),
            var("readiness", &["degraded"]),
            var("adversary.intent", &["hostile", "probe"]),
            var("strait.mined", &["true"]),
        ]
    }

    #[test]
    fn seeded_selection_is_reproducible() {
        assert_eq!(select(pool(), 3, Some(11)), select(pool(), 3, Some(11)));
    }

    #[test]
    fn selection_is_without_replacement() {
        for seed in 0..32 {
            let plans = select(pool(), 3, Some(seed));
            assert_eq!(plans.len(), 3);
            let mut paths: Vec<_> = plans.iter().map(|p| p.path.clone()).collect();
            paths.sort();
            paths.dedup();
            assert_eq!(paths.len(), 3);
        }
    }

    #[test]
    fn small_catalog_returns_everything() {
        let plans = select(pool(), 10, None);
        assert_eq!(plans.len(), 4);
    }
}
