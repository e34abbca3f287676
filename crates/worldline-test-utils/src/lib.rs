//! Testing utilities for the Worldline workspace
//!
//! Shared fixtures: a small maritime scenario, scripted stages and
//! confirmers that answer without a human.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use worldline_pipeline::{
    Confirmation, Confirmer, GateError, GateRequest, PendingGate, Stage, StageContext,
    StageError, StageOutput,
};
use worldline_state::{Delta, Entity, EntityKind, WorldState, WorldStore};

/// Genesis for the test scenario: clear weather, a fully ready fleet,
/// an adversary of uncertain intent and one open question
pub fn scenario_genesis() -> Delta {
    Delta::builder()
        .author("scenario")
        .create(
            "weather",
            Entity::new(EntityKind::Event, 0.9).with_attribute("value", "clear"),
        )
        .create(
            "readiness",
            Entity::new(EntityKind::Actor, 0.8).with_attribute("value", "full"),
        )
        .create(
            "adversary",
            Entity::new(EntityKind::Actor, 0.4)
                .with_attribute("intent", "unknown")
                .with_attribute("strength", 3),
        )
        .create(
            "strait",
            Entity::new(EntityKind::Location, 1.0).with_attribute("mined", false),
        )
        .raise("q-intent", "What is the adversary's intent?", 1)
        .build()
}

pub fn scenario_store() -> Arc<WorldStore> {
    Arc::new(
        WorldStore::builder()
            .genesis(scenario_genesis())
            .build()
            .unwrap(),
    )
}

/// Returns queued outputs in order, then empty deltas; counts calls
#[derive(Debug, Default)]
pub struct ScriptedStage {
    outputs: Mutex<VecDeque<Result<StageOutput, StageError>>>,
    calls: AtomicU32,
}

impl ScriptedStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delta(self, delta: Delta) -> Self {
        self.outputs.lock().push_back(Ok(StageOutput::Delta(delta)));
        self
    }

    pub fn gate(self, delta: Delta, summary: &str) -> Self {
        self.outputs
            .lock()
            .push_back(Ok(StageOutput::Gate(GateRequest::new(delta, summary))));
        self
    }

    pub fn fail(self, reason: &str) -> Self {
        self.outputs.lock().push_back(Err(StageError::failed(reason)));
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    async fn run(
        &self,
        _snapshot: Arc<WorldState>,
        _ctx: StageContext,
    ) -> Result<StageOutput, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outputs
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(StageOutput::Delta(Delta::new())))
    }
}

/// Sleeps far longer than any test waits
#[derive(Debug, Clone, Copy, Default)]
pub struct HangingStage;

#[async_trait]
impl Stage for HangingStage {
    async fn run(
        &self,
        _snapshot: Arc<WorldState>,
        _ctx: StageContext,
    ) -> Result<StageOutput, StageError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(StageOutput::Delta(Delta::new()))
    }
}

/// Panics on every call
#[derive(Debug, Clone, Copy, Default)]
pub struct PanickingStage;

#[async_trait]
impl Stage for PanickingStage {
    async fn run(
        &self,
        _snapshot: Arc<WorldState>,
        _ctx: StageContext,
    ) -> Result<StageOutput, StageError> {
        panic!("stage blew up")
    }
}

/// Answers every gate with the same decision
#[derive(Debug, Clone)]
pub struct FixedConfirmer {
    decision: Confirmation,
    seen: Arc<Mutex<Vec<GateRequest>>>,
}

impl FixedConfirmer {
    pub fn new(decision: Confirmation) -> Self {
        Self {
            decision,
            seen: Arc::default(),
        }
    }

    pub fn approve() -> Self {
        Self::new(Confirmation::Approve)
    }

    pub fn decline(reason: &str) -> Self {
        Self::new(Confirmation::Decline {
            reason: reason.to_string(),
        })
    }

    /// Requests seen so far, shared across clones
    pub fn seen(&self) -> Vec<GateRequest> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Confirmer for FixedConfirmer {
    async fn confirm(
        &self,
        request: &GateRequest,
        _ctx: &StageContext,
    ) -> Result<Confirmation, GateError> {
        self.seen.lock().push(request.clone());
        Ok(self.decision.clone())
    }
}

/// Approve everything arriving on a [`worldline_pipeline::ChannelConfirmer`] queue
pub fn auto_approve(mut gates: mpsc::Receiver<PendingGate>) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        let mut answered = 0;
        while let Some(gate) = gates.recv().await {
            gate.approve();
            answered += 1;
        }
        answered
    })
}
