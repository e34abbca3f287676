//! Worldline What-If - counterfactual branches, audit and replay
//!
//! Everything here sits on the [`worldline_state::WorldStore`] versioning
//! primitive and never bypasses it:
//! - [`PerturbationEngine`] derives sibling worlds that each change one variable
//! - [`DecisionLedger`] records the choice made against each world
//! - [`ConsistencyAuditor`] compares sibling choices and labels divergences
//! - [`ReplayEngine`] rebuilds a store from a recorded log
//!
//! # Example
//!
//! ```rust,ignore
//! use worldline_whatif::{
//!     ConsistencyAuditor, DecisionLedger, DecisionRecord, OptionRanking, PerturbationEngine,
//!     VariableCatalog, WhatIfConfig,
//! };
//!
//! let catalog = VariableCatalog::new()
//!     .with_variable("weather".parse()?, ["storm"])
//!     .with_variable("readiness".parse()?, ["degraded"]);
//! let engine = PerturbationEngine::with_config(store, WhatIfConfig::new().with_k(2).with_seed(7));
//! let siblings = engine.perturb(base, "dp-strike", &catalog)?;
//!
//! // ...record one decision per world in `ledger`...
//!
//! let auditor = ConsistencyAuditor::new(OptionRanking::ordered(["hold", "deliberate", "aggressive"]));
//! let report = auditor.audit(base, "dp-strike", &siblings, &catalog, &ledger)?;
//! for finding in report.divergent() {
//!     println!("{} -> {} ({})", finding.changed_variable, finding.sibling_option, finding.bias);
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod audit;
pub mod catalog;
pub mod config;
pub mod error;
pub mod ledger;
pub mod perturbation;
pub mod replay;

pub use audit::{
    AuditReport, AuditStatus, Bias, ConsistencyAuditor, Finding, OptionRanking, Rule, RuleTable,
    Shift,
};
pub use catalog::{
    EligibleVariable, RiskEffect, VariableCatalog, VariableCategory, VariableProfile, VariableSpec,
};
pub use config::WhatIfConfig;
pub use error::WhatIfError;
pub use ledger::{DecisionLedger, DecisionRecord};
pub use perturbation::{Perturbation, PerturbationEngine};
pub use replay::ReplayEngine;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use worldline_state::{Delta, Entity, EntityKind, Version, WorldStore};

    #[test]
    fn storm_and_degraded_readiness() {
        let store = Arc::new(
            WorldStore::builder()
                .genesis(
                    Delta::builder()
                        .create(
                            "weather",
                            Entity::new(EntityKind::Event, 0.9).with_attribute("value", "clear"),
                        )
                        .create(
                            "readiness",
                            Entity::new(EntityKind::Actor, 0.8).with_attribute("value", "full"),
                        )
                        .build(),
                )
                .build()
                .unwrap(),
        );
        let catalog = VariableCatalog::new()
            .with_variable("weather".parse().unwrap(), ["storm"])
            .with_variable("readiness".parse().unwrap(), ["degraded"]);
        let engine =
            PerturbationEngine::with_config(Arc::clone(&store), WhatIfConfig::new().with_k(2));

        let siblings = engine.perturb(Version(0), "dp-1", &catalog).unwrap();
        assert_eq!(siblings.len(), 2);
        assert!(siblings
            .iter()
            .all(|p| store.get(p.derived_version).unwrap().parent_version() == Some(Version(0))));
        assert_eq!(store.head(), Version(0));

        let by_path = |path: &str| {
            let path = path.parse::<worldline_state::AttributePath>().unwrap();
            siblings
                .iter()
                .find(|p| p.changed_variable == path)
                .unwrap()
                .clone()
        };
        let storm = by_path("weather");
        let degraded = by_path("readiness");
        assert_eq!(storm.new_value, json!("storm"));
        assert_eq!(degraded.old_value, Some(json!("full")));

        let ledger = DecisionLedger::new();
        for (version, option) in [
            (Version(0), "aggressive"),
            (storm.derived_version, "aggressive"),
            (degraded.derived_version, "deliberate"),
        ] {
            ledger
                .record(DecisionRecord::new(version, "dp-1", option, "commander's call"))
                .unwrap();
        }

        let auditor =
            ConsistencyAuditor::new(OptionRanking::ordered(["hold", "deliberate", "aggressive"]));
        let report = auditor
            .audit(Version(0), "dp-1", &siblings, &catalog, &ledger)
            .unwrap();
        assert_eq!(report.status, AuditStatus::Complete);
        assert_eq!(report.base_option.as_deref(), Some("aggressive"));

        let a = report.finding(storm.derived_version).unwrap();
        assert!(!a.divergence);
        assert_eq!(a.bias, Bias::None);

        let b = report.finding(degraded.derived_version).unwrap();
        assert!(b.divergence);
        assert_eq!(b.shift, Some(Shift::DeEscalated));
        assert_ne!(b.bias, Bias::None);
        assert_eq!(b.bias, Bias::AvailabilityHeuristic);
        assert_eq!(b.rule, Some(7));
    }
}
