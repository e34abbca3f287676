//! Turn orchestrator
//!
//! Runs the configured stages in order, one committed version per stage
//! that changes something. Gated stages suspend until a confirmer answers.
//! Aborting a turn never rolls anything back: the store head stays at the
//! last stage that committed.

use crate::config::PipelineConfig;
use crate::error::{GateError, PipelineError, StageError, TurnError};
use crate::gate::{check_framing, CancelSignal, Confirmation, Confirmer};
use crate::hook::{FailureAction, FailureHook, NeverRetry};
use crate::phase::{validate_transition, TurnPhase};
use crate::pool::StagePool;
use crate::report::{ConfidenceRecord, StageOutcome, StageRecord, TurnReport, TurnStatus};
use crate::stage::{GateRequest, Stage, StageContext, StageDescriptor, StageOutput};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use worldline_state::{Delta, StoreError, Version, WorldState, WorldStore};

struct Binding {
    descriptor: StageDescriptor,
    stage: Arc<dyn Stage>,
}

/// Ends a turn whose future is dropped mid-stage, so the next turn can start
struct TurnGuard<'a>(&'a watch::Sender<TurnPhase>);

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        let live = self.0.borrow().stage();
        if let Some(stage) = live {
            tracing::warn!(stage, "turn dropped before finishing");
            self.0.send_replace(TurnPhase::Aborted);
        }
    }
}

enum Resolution {
    Resolved,
    Abort(TurnError),
}

/// Drives turns through the stage pipeline against one store
pub struct Orchestrator {
    store: Arc<WorldStore>,
    stages: Vec<Binding>,
    pool: Arc<StagePool>,
    confirmer: Option<Arc<dyn Confirmer>>,
    hook: Arc<dyn FailureHook>,
    config: PipelineConfig,
    phase: watch::Sender<TurnPhase>,
    /// Serializes turns on this orchestrator
    turn_lock: Mutex<()>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("store", &self.store.id())
            .field("stages", &self.descriptors().collect::<Vec<_>>())
            .field("phase", &*self.phase.borrow())
            .field("hook", &self.hook)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Start building an orchestrator over `store`
    #[inline]
    #[must_use]
    pub fn builder(store: Arc<WorldStore>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(store)
    }

    /// Store this orchestrator commits to
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<WorldStore> {
        &self.store
    }

    /// Stage descriptors in pipeline order
    pub fn descriptors(&self) -> impl Iterator<Item = &StageDescriptor> {
        self.stages.iter().map(|b| &b.descriptor)
    }

    /// Shared stage pool
    #[inline]
    #[must_use]
    pub fn pool(&self) -> &Arc<StagePool> {
        &self.pool
    }

    /// Current phase
    #[inline]
    #[must_use]
    pub fn phase(&self) -> TurnPhase {
        *self.phase.borrow()
    }

    /// Watch phase changes
    #[must_use]
    pub fn phases(&self) -> watch::Receiver<TurnPhase> {
        self.phase.subscribe()
    }

    /// Run one turn through every stage
    ///
    /// An aborted turn is still `Ok`: the report carries the reason and the
    /// stages that committed before it. Dropping the returned future also
    /// aborts the turn; versions committed so far stay.
    ///
    /// # Errors
    /// - `PipelineError::Store` if the head moved under the turn or the log sink failed
    /// - `PipelineError::IllegalTransition` on an internal sequencing bug
    #[tracing::instrument(skip(self, cancel), fields(store = %self.store.id()))]
    pub async fn run_turn(
        &self,
        turn: u64,
        cancel: &CancelSignal,
    ) -> Result<TurnReport, PipelineError> {
        let _turn = self.turn_lock.lock().await;
        let _guard = TurnGuard(&self.phase);
        let mut report = TurnReport::new(turn, self.store.head());
        tracing::info!(start = %report.start_version, stages = self.stages.len(), "turn started");

        let result = self.drive(turn, &mut report, cancel).await;
        report.end_version = report
            .versions()
            .last()
            .copied()
            .unwrap_or(report.start_version);

        match result {
            Ok(None) => {
                self.advance(TurnPhase::TurnCommitted)?;
                tracing::info!(end = %report.end_version, "turn committed");
            }
            Ok(Some(error)) => {
                self.advance(TurnPhase::Aborted)?;
                tracing::warn!(end = %report.end_version, %error, "turn aborted");
                report.status = TurnStatus::Aborted(error);
            }
            Err(error) => {
                self.phase.send_replace(TurnPhase::Aborted);
                tracing::error!(%error, "turn failed");
                return Err(error);
            }
        }
        Ok(report)
    }

    async fn drive(
        &self,
        turn: u64,
        report: &mut TurnReport,
        cancel: &CancelSignal,
    ) -> Result<Option<TurnError>, PipelineError> {
        for (index, binding) in self.stages.iter().enumerate() {
            self.advance(TurnPhase::AwaitingStage(index))?;
            match self.run_stage(turn, index, binding, report, cancel).await? {
                Resolution::Resolved => self.advance(TurnPhase::StageApplied(index))?,
                Resolution::Abort(error) => return Ok(Some(error)),
            }
        }
        Ok(None)
    }

    async fn run_stage(
        &self,
        turn: u64,
        index: usize,
        binding: &Binding,
        report: &mut TurnReport,
        cancel: &CancelSignal,
    ) -> Result<Resolution, PipelineError> {
        let descriptor = &binding.descriptor;
        let name = descriptor.name.clone();
        let mut record = StageRecord {
            name: name.clone(),
            phase: descriptor.phase,
            attempts: 0,
            outcome: StageOutcome::Aborted,
        };

        let (snapshot, ctx, output) = loop {
            if cancel.is_cancelled() {
                return Ok(abort(report, record, TurnError::Cancelled { stage: name }));
            }
            record.attempts += 1;
            let snapshot = self.store.current();
            let ctx = StageContext {
                turn,
                index,
                stage: name.clone(),
                mode: descriptor.mode,
                phase: descriptor.phase,
                turn_start: report.start_version,
                snapshot: snapshot.version(),
                attempt: record.attempts,
            };
            self.advance(TurnPhase::StageRunning(index))?;
            tracing::debug!(stage = %name, attempt = ctx.attempt, snapshot = %ctx.snapshot, "invoking stage");

            match self.invoke(binding, Arc::clone(&snapshot), ctx.clone(), cancel).await {
                Ok(output) => break (snapshot, ctx, output),
                Err(StageError::Cancelled) => {
                    return Ok(abort(report, record, TurnError::Cancelled { stage: name }));
                }
                Err(error) => match self.hook.on_stage_failure(&ctx, &error) {
                    FailureAction::Retry => continue,
                    FailureAction::Abort => {
                        let error = TurnError::StageFailed {
                            stage: name,
                            source: error,
                        };
                        return Ok(abort(report, record, error));
                    }
                },
            }
        };

        let (delta, summary) = output.into_parts();
        if self.config.framing_guard {
            if let Some(Err(source)) = summary.as_deref().map(check_framing) {
                let error = TurnError::DeltaRejected { stage: name, source };
                return Ok(abort(report, record, error));
            }
        }

        let mut edited = false;
        let mut delta = if descriptor.is_gated() {
            self.advance(TurnPhase::AwaitingConfirmation(index))?;
            let request = GateRequest::new(delta, summary.unwrap_or_default());
            tracing::info!(stage = %name, summary = %request.summary, "awaiting confirmation");
            match self.await_confirmation(&request, &ctx, cancel).await {
                Ok(Confirmation::Approve) => request.delta,
                Ok(Confirmation::ApproveWithEdits(replacement)) => {
                    edited = true;
                    replacement
                }
                Ok(Confirmation::Decline { reason }) => {
                    tracing::info!(stage = %name, %reason, "gate declined");
                    record.outcome = StageOutcome::Declined { reason };
                    report.stages.push(record);
                    return Ok(Resolution::Resolved);
                }
                Err(source) => {
                    let error = TurnError::GateTimeoutOrCancelled { stage: name, source };
                    return Ok(abort(report, record, error));
                }
            }
        } else {
            delta
        };

        if delta.is_empty() {
            record.outcome = StageOutcome::NoChange;
            report.stages.push(record);
            return Ok(Resolution::Resolved);
        }
        delta.author.get_or_insert_with(|| name.clone());

        match self.store.commit(snapshot.version(), &delta) {
            Ok(state) => {
                let version = state.version();
                report
                    .confidence_changes
                    .extend(confidence_records(&snapshot, &delta, version));
                record.outcome = if edited {
                    StageOutcome::Edited { version }
                } else {
                    StageOutcome::Committed { version }
                };
                report.stages.push(record);
                Ok(Resolution::Resolved)
            }
            Err(StoreError::DeltaRejected(source)) => {
                tracing::warn!(stage = %name, %source, "delta rejected");
                let error = TurnError::DeltaRejected { stage: name, source };
                Ok(abort(report, record, error))
            }
            Err(other) => {
                report.stages.push(record);
                Err(other.into())
            }
        }
    }

    async fn invoke(
        &self,
        binding: &Binding,
        snapshot: Arc<WorldState>,
        ctx: StageContext,
        cancel: &CancelSignal,
    ) -> Result<StageOutput, StageError> {
        let limit = binding
            .descriptor
            .timeout_secs
            .map_or_else(|| self.config.stage_timeout(), Duration::from_secs);
        let run = self.pool.run(Arc::clone(&binding.stage), snapshot, ctx);

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(StageError::Cancelled),
            res = tokio::time::timeout(limit, run) => {
                res.unwrap_or(Err(StageError::TimedOut { secs: limit.as_secs() }))
            }
        }
    }

    async fn await_confirmation(
        &self,
        request: &GateRequest,
        ctx: &StageContext,
        cancel: &CancelSignal,
    ) -> Result<Confirmation, GateError> {
        let Some(confirmer) = &self.confirmer else {
            return Err(GateError::Withdrawn);
        };
        let wait = async {
            match self.config.gate_timeout() {
                Some(limit) => tokio::time::timeout(limit, confirmer.confirm(request, ctx))
                    .await
                    .unwrap_or(Err(GateError::TimedOut {
                        secs: limit.as_secs(),
                    })),
                None => confirmer.confirm(request, ctx).await,
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(GateError::Cancelled),
            res = wait => res,
        }
    }

    fn advance(&self, to: TurnPhase) -> Result<(), PipelineError> {
        let from = *self.phase.borrow();
        validate_transition(from, to)?;
        self.phase.send_replace(to);
        tracing::trace!(?from, ?to, "phase");
        Ok(())
    }
}

fn abort(report: &mut TurnReport, record: StageRecord, error: TurnError) -> Resolution {
    report.stages.push(record);
    Resolution::Abort(error)
}

fn confidence_records(before: &WorldState, delta: &Delta, version: Version) -> Vec<ConfidenceRecord> {
    delta
        .confidence
        .iter()
        .map(|change| ConfidenceRecord {
            entity: change.entity.clone(),
            version,
            from: before.entity(change.entity.as_str()).map(|e| e.confidence),
            to: change.confidence,
            evidence: change.evidence.clone(),
        })
        .collect()
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    store: Arc<WorldStore>,
    config: PipelineConfig,
    bound: HashMap<String, Arc<dyn Stage>>,
    appended: Vec<Binding>,
    confirmer: Option<Arc<dyn Confirmer>>,
    hook: Arc<dyn FailureHook>,
    pool: Option<Arc<StagePool>>,
}

impl OrchestratorBuilder {
    fn new(store: Arc<WorldStore>) -> Self {
        Self {
            store,
            config: PipelineConfig::default(),
            bound: HashMap::new(),
            appended: Vec::new(),
            confirmer: None,
            hook: Arc::new(NeverRetry),
            pool: None,
        }
    }

    /// Use `config`; its stage list comes first, in order
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Supply the implementation for a stage named in the config
    #[must_use]
    pub fn bind(mut self, name: impl Into<String>, stage: impl Stage + 'static) -> Self {
        self.bound.insert(name.into(), Arc::new(stage));
        self
    }

    /// Append a stage after the configured ones
    #[must_use]
    pub fn stage(mut self, descriptor: StageDescriptor, stage: impl Stage + 'static) -> Self {
        self.appended.push(Binding {
            descriptor,
            stage: Arc::new(stage),
        });
        self
    }

    /// Who answers gates
    #[must_use]
    pub fn confirmer(mut self, confirmer: impl Confirmer + 'static) -> Self {
        self.confirmer = Some(Arc::new(confirmer));
        self
    }

    /// Failure policy; defaults to [`NeverRetry`]
    #[must_use]
    pub fn hook(mut self, hook: impl FailureHook + 'static) -> Self {
        self.hook = Arc::new(hook);
        self
    }

    /// Share a pool with other orchestrators
    #[must_use]
    pub fn pool(mut self, pool: Arc<StagePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Finish building
    ///
    /// # Errors
    /// Returns `PipelineError::Config` if the pipeline is empty, a stage is
    /// unbound or duplicated, or a gated stage has no confirmer
    pub fn build(mut self) -> Result<Orchestrator, PipelineError> {
        self.config.validate()?;

        let mut stages = Vec::with_capacity(self.config.stages.len() + self.appended.len());
        for descriptor in &self.config.stages {
            let stage = self.bound.remove(&descriptor.name).ok_or_else(|| {
                PipelineError::Config(format!("no implementation bound for stage '{}'", descriptor.name))
            })?;
            stages.push(Binding {
                descriptor: descriptor.clone(),
                stage,
            });
        }
        if let Some(name) = self.bound.keys().next() {
            return Err(PipelineError::Config(format!(
                "stage '{name}' is bound but not configured"
            )));
        }
        stages.append(&mut self.appended);

        if stages.is_empty() {
            return Err(PipelineError::Config("pipeline has no stages".into()));
        }
        let mut seen = HashSet::new();
        for binding in &stages {
            let name = &binding.descriptor.name;
            if !seen.insert(name.clone()) {
                return Err(PipelineError::Config(format!("duplicate stage '{name}'")));
            }
            if binding.descriptor.is_gated() && self.confirmer.is_none() {
                return Err(PipelineError::Config(format!(
                    "gated stage '{name}' needs a confirmer"
                )));
            }
        }

        let pool = self
            .pool
            .unwrap_or_else(|| Arc::new(StagePool::new(self.config.pool_size)));
        let (phase, _) = watch::channel(TurnPhase::Idle);

        Ok(Orchestrator {
            store: self.store,
            stages,
            pool,
            confirmer: self.confirmer,
            hook: self.hook,
            config: self.config,
            phase,
            turn_lock: Mutex::new(()),
        })
    }
}
