//! Worldline Pipeline - turn orchestration
//!
//! Runs an ordered list of agent stages against a [`worldline_state::WorldStore`]:
//! - Each stage reads the current snapshot and proposes a delta
//! - Advisory stages commit directly; gated stages wait for a [`Confirmer`]
//! - A [`CancelSignal`] stops the turn at any point without rolling back
//! - A [`FailureHook`] decides whether a failed stage is retried
//!
//! # Example
//!
//! ```rust,ignore
//! use worldline_pipeline::{CancelSignal, ChannelConfirmer, Orchestrator, StageDescriptor};
//!
//! # async fn example(store: std::sync::Arc<worldline_state::WorldStore>) -> Result<(), Box<dyn std::error::Error>> {
//! let (confirmer, mut gates) = ChannelConfirmer::new(8);
//! let orchestrator = Orchestrator::builder(store)
//!     .stage(StageDescriptor::advisory("observe"), observe_stage)
//!     .stage(StageDescriptor::gated("decide"), decide_stage)
//!     .confirmer(confirmer)
//!     .build()?;
//!
//! tokio::spawn(async move {
//!     while let Some(gate) = gates.recv().await {
//!         gate.approve();
//!     }
//! });
//!
//! let report = orchestrator.run_turn(1, &CancelSignal::new()).await?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod config;
pub mod error;
pub mod gate;
pub mod hook;
pub mod orchestrator;
pub mod phase;
pub mod pool;
pub mod report;
pub mod stage;

pub use config::PipelineConfig;
pub use error::{GateError, PipelineError, StageError, TurnError};
pub use gate::{
    check_framing, CancelSignal, ChannelConfirmer, Confirmation, Confirmer, PendingGate,
    DIRECTIVE_VERBS,
};
pub use hook::{FailureAction, FailureHook, NeverRetry, RetryLimit};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use phase::{allowed_transitions, validate_transition, TurnPhase};
pub use pool::{PoolStats, StagePool};
pub use report::{ConfidenceRecord, StageOutcome, StageRecord, TurnReport, TurnStatus};
pub use stage::{
    stage_fn, FnStage, GateRequest, OodaPhase, Stage, StageContext, StageDescriptor, StageMode,
    StageOutput,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for building pipelines
    pub use crate::{
        CancelSignal, ChannelConfirmer, Confirmation, GateRequest, Orchestrator, PipelineConfig,
        Stage, StageContext, StageDescriptor, StageError, StageOutput, TurnReport,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
