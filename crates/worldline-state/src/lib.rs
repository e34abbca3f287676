//! Worldline State
//!
//! Versioned, append-only storage for the shared world that agents read and
//! write turn by turn.
//!
//! # Core Concepts
//!
//! - [`WorldState`]: Immutable snapshot (entities, timeline, open questions)
//! - [`Delta`]: Atomic proposed change, applied in full or rejected in full
//! - [`WorldStore`]: Arena of versions with linear `commit` and sibling `branch`
//! - [`TurnLog`]: Ordered record of every write, enough to rebuild a store
//! - [`AttributePath`]: `entity.field` address of a single variable
//!
//! # Example
//!
//! ```rust,ignore
//! use worldline_state::{Delta, Entity, EntityKind, Version, WorldStore};
//!
//! let store = WorldStore::builder()
//!     .genesis(
//!         Delta::builder()
//!             .create("weather", Entity::new(EntityKind::Event, 0.9).with_attribute("value", "clear"))
//!             .build(),
//!     )
//!     .build()?;
//!
//! let next = store.commit(Version::GENESIS, &Delta::builder().set("weather", "value", "fog").build())?;
//! let what_if = store.branch(Version::GENESIS, &Delta::builder().set("weather", "value", "storm").build())?;
//! assert_eq!(what_if.parent_version(), Some(Version::GENESIS));
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod delta;
mod hash;
mod log;
mod path;
mod store;
mod world;

pub use delta::{ConfidenceChange, Delta, DeltaBuilder, DeltaError, EntityPatch, QuestionChange};
pub use hash::{HashError, StateHash};
pub use log::{EntryKind, JsonLinesSink, LogEntry, LogError, LogSink, TurnLog};
pub use path::{AttributePath, PathError, DEFAULT_FIELD};
pub use store::{StoreBuilder, StoreError, WorldStore};
pub use world::{
    Difference, Entity, EntityId, EntityKind, OpenQuestion, SnapshotEnvelope, TimelineEvent,
    Version, WorldState, SYNTHETIC_DISCLAIMER,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commit_branch_and_rebuild() {
        let store = WorldStore::builder()
            .genesis(
                Delta::builder()
                    .create(
                        "fleet",
                        Entity::new(EntityKind::Actor, 0.6).with_attribute("readiness", "full"),
                    )
                    .build(),
            )
            .build()
            .unwrap();

        let v1 = store
            .commit(
                Version::GENESIS,
                &Delta::builder()
                    .event(TimelineEvent::new(1, "contact reported").with_evidence("rpt-1"))
                    .confidence("fleet", 0.7, "rpt-1 corroborates position")
                    .build(),
            )
            .unwrap();

        let path: AttributePath = "fleet.readiness".parse().unwrap();
        let branch = store
            .branch(v1.version(), &Delta::set(&path, json!("degraded")))
            .unwrap();

        assert_eq!(
            v1.differences(&branch),
            vec![Difference::Attribute(path)]
        );
        assert_eq!(&store.reconstruct(branch.version()).unwrap(), branch.as_ref());
        assert!(store.log().verify().is_ok());
    }
}
