//! The orchestrator and its tick loop.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::plan::{artifacts_from, build_prompt, find_step, next_step, PhaseStep, StepKind};
use super::{
    OrchestratorError, RunSummary, StatusReport, StopReason, TickAction, TickResult,
    RESOLVE_ABORT, RESOLVE_RETRY, RESOLVE_REWIND,
};
use crate::blocking::{check_timeout, BlockingManager, BlockingRecord, TimeoutAction};
use crate::checkpoint::{CheckpointStore, CleanStartReason, PersistenceError, ResumeOutcome, StateSnapshot};
use crate::config::ProtocolConfig;
use crate::escalation::{
    apply_decision, classify_failure, record_attempt, reset_syntax_hint, EscalationAction,
    EscalationEngine, FunctionAttempts, ModelTier,
};
use crate::ledger::{Confidence, DecisionCategory, DecisionLedger, DecisionSource, InMemoryLedger, NewDecision};
use crate::operations::{ExternalOperations, OperationFailure};
use crate::phase::{
    failure_route, transition_rule, validate_transition, ArtifactTag,
    ProtocolPhase, ProtocolState, ProtocolSubstate, SubstateKind,
};
use crate::telemetry::{NoOpTelemetrySink, TelemetryAccumulator, TelemetrySink};

/// Failure code for a circuit break without human review.
const CIRCUIT_BREAK_CODE: &str = "CIRCUIT_BREAK";
/// Failure code for transport-level errors.
const TRANSIENT_CODE: &str = "TRANSIENT_FAILURE";
/// Failure code for an operator abort.
const ABORTED_CODE: &str = "ABORTED";

/// How the orchestrator obtained its starting snapshot.
#[derive(Debug)]
pub enum StartMode {
    /// No checkpoint existed.
    Fresh,
    Resumed { warnings: Vec<String> },
    /// The checkpoint was unusable and the run starts over.
    Recovered {
        error: PersistenceError,
        quarantined: Option<PathBuf>,
    },
}

/// Drives one protocol run.
pub struct Orchestrator<O, L = InMemoryLedger> {
    ops: O,
    ledger: L,
    store: CheckpointStore,
    snapshot: StateSnapshot,
    engine: EscalationEngine,
    blocking: BlockingManager,
    telemetry: TelemetryAccumulator,
    sink: Box<dyn TelemetrySink>,
}

impl<O: ExternalOperations, L: DecisionLedger> Orchestrator<O, L> {
    /// Start from a fresh `Ignition/Active` snapshot.
    pub fn new(ops: O, ledger: L, store: CheckpointStore, config: &ProtocolConfig) -> Self {
        Self {
            ops,
            ledger,
            store,
            snapshot: StateSnapshot::initial(),
            engine: EscalationEngine::with_config(config.escalation.clone()),
            blocking: BlockingManager::new(config.blocking.clone()),
            telemetry: TelemetryAccumulator::new(),
            sink: Box::new(NoOpTelemetrySink),
        }
    }

    /// Start from whatever the checkpoint store can resume.
    pub fn resume(ops: O, ledger: L, store: CheckpointStore, config: &ProtocolConfig) -> (Self, StartMode) {
        let (snapshot, mode) = match store.resume() {
            ResumeOutcome::Resumed { snapshot, warnings } => (snapshot, StartMode::Resumed { warnings }),
            ResumeOutcome::CleanStart {
                reason: CleanStartReason::NoPriorState,
            } => (StateSnapshot::initial(), StartMode::Fresh),
            ResumeOutcome::CleanStart {
                reason: CleanStartReason::Recovered { error, quarantined },
            } => (StateSnapshot::initial(), StartMode::Recovered { error, quarantined }),
        };
        (Self::new(ops, ledger, store, config).with_snapshot(snapshot), mode)
    }

    pub fn with_snapshot(mut self, snapshot: StateSnapshot) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn with_telemetry_sink(mut self, sink: Box<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn state(&self) -> &ProtocolState {
        &self.snapshot.state
    }

    pub fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn telemetry(&self) -> &TelemetryAccumulator {
        &self.telemetry
    }

    pub fn status(&self) -> StatusReport {
        StatusReport::from_snapshot(&self.snapshot, self.telemetry.snapshot())
    }

    /// Tick until a stop reason, `max_ticks`, or cancellation.
    ///
    /// Cancellation is checked between ticks only; a tick in flight always
    /// completes and persists.
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        max_ticks: Option<u64>,
    ) -> Result<RunSummary, OrchestratorError> {
        let mut summary = RunSummary {
            ticks: 0,
            cancelled: false,
            last: None,
        };
        loop {
            if cancel.is_cancelled() {
                info!(ticks = summary.ticks, phase = %self.snapshot.state.phase, "Run cancelled");
                summary.cancelled = true;
                break;
            }
            if max_ticks.is_some_and(|max| summary.ticks >= max) {
                info!(ticks = summary.ticks, "Tick budget reached");
                break;
            }

            let result = self.tick().await?;
            summary.ticks += 1;
            let stop = !result.should_continue;
            summary.last = Some(result);
            if stop {
                break;
            }
        }
        Ok(summary)
    }

    /// Perform one unit of work and persist.
    pub async fn tick(&mut self) -> Result<TickResult, OrchestratorError> {
        let action = match self.snapshot.state.substate.clone() {
            ProtocolSubstate::Blocking { .. } => self.tick_blocking().await?,
            ProtocolSubstate::Failed {
                recoverable: false, ..
            } => TickAction::Idle,
            ProtocolSubstate::Failed {
                recoverable: true,
                error,
                ..
            } => {
                info!(phase = %self.snapshot.state.phase, %error, "Clearing recoverable failure");
                self.snapshot.state = ProtocolState::active(self.snapshot.state.phase);
                self.tick_active().await?
            }
            ProtocolSubstate::Active => self.tick_active().await?,
        };

        self.persist()?;
        let result = self.result(action);
        debug!(
            phase = %result.phase,
            substate = %result.substate,
            action = ?result.action,
            "Tick complete"
        );
        Ok(result)
    }

    /// Answer the pending blocking query and persist.
    pub fn resolve_blocking(
        &mut self,
        selection: &str,
        rationale: Option<&str>,
    ) -> Result<TickAction, OrchestratorError> {
        let record = self
            .snapshot
            .pending_blocking()
            .cloned()
            .ok_or(OrchestratorError::NothingToResolve {
                phase: self.snapshot.state.phase,
            })?;

        let resolution = self.blocking.resolve_blocking(
            &self.snapshot.state,
            &record,
            selection,
            rationale,
            &mut self.ledger,
        )?;
        self.snapshot.state = resolution.state;
        self.snapshot.upsert_blocking(resolution.record.clone());

        let action = self
            .apply_circuit_resolution(&resolution.record, selection)?
            .unwrap_or_else(|| TickAction::Resolved {
                selection: selection.to_string(),
            });
        self.persist()?;
        Ok(action)
    }

    /// Clear a Failed substate.
    ///
    /// Takes the phase's failure route when its report is available,
    /// otherwise restarts the current unit's attempt counts.
    pub fn recover(&mut self) -> Result<TickAction, OrchestratorError> {
        let phase = self.snapshot.state.phase;
        match &self.snapshot.state.substate {
            ProtocolSubstate::Active => return Ok(TickAction::Idle),
            ProtocolSubstate::Blocking { .. } => return Err(OrchestratorError::Blocked { phase }),
            ProtocolSubstate::Failed { error, .. } => {
                info!(%phase, %error, "Recovering from failure");
            }
        }

        self.snapshot.state = ProtocolState::active(phase);
        let action = match failure_route(phase) {
            Some(rule) if self.snapshot.artifacts.contains_all(rule.required) => self.rewind(rule.to)?,
            _ => {
                self.reset_current_unit();
                TickAction::Recovered
            }
        };
        self.persist()?;
        Ok(action)
    }

    /// Discard the checkpoint and start over. The ledger is kept.
    pub fn reset(&mut self) -> Result<(), OrchestratorError> {
        self.store.clear()?;
        self.snapshot = StateSnapshot::initial();
        self.telemetry.reset();
        Ok(())
    }

    /// Decisions go to disk before the state they explain.
    fn persist(&self) -> Result<(), OrchestratorError> {
        self.ledger.flush()?;
        self.store.save(&self.snapshot)?;
        Ok(())
    }

    fn result(&self, action: TickAction) -> TickResult {
        let state = &self.snapshot.state;
        let stop_reason = if state.is_complete() {
            Some(StopReason::Complete)
        } else {
            match state.substate.kind() {
                SubstateKind::Active => None,
                SubstateKind::Blocking => Some(StopReason::Blocked),
                SubstateKind::Failed => Some(StopReason::Failed),
            }
        };
        TickResult {
            should_continue: stop_reason.is_none(),
            stop_reason,
            phase: state.phase,
            substate: state.substate.kind(),
            action,
        }
    }

    async fn tick_blocking(&mut self) -> Result<TickAction, OrchestratorError> {
        let now = Utc::now();
        let Some(record) = self.snapshot.pending_blocking().cloned() else {
            warn!(phase = %self.snapshot.state.phase, "Blocking without a pending record");
            return Ok(TickAction::Idle);
        };
        match check_timeout(&record, now) {
            Some(status) if status.expired => {}
            _ => return Ok(TickAction::Idle),
        }

        let outcome = self
            .blocking
            .handle_timeout(&self.snapshot.state, &record, now, &mut self.ledger)?;
        self.snapshot.state = outcome.state;
        self.snapshot.upsert_blocking(outcome.record.clone());

        match outcome.action {
            TimeoutAction::Escalated => {
                self.persist()?;
                self.ops.send_blocking_notification(&outcome.record).await;
                Ok(TickAction::TimeoutEscalated {
                    query: outcome.record.query,
                })
            }
            TimeoutAction::DefaultApplied { selection, .. } => {
                self.apply_circuit_resolution(&outcome.record, &selection)?;
                Ok(TickAction::TimeoutDefaulted { selection })
            }
            TimeoutAction::Failed => Ok(TickAction::Failed {
                error: format!("Blocking query timed out: {}", outcome.record.query),
                recoverable: false,
            }),
        }
    }

    async fn tick_active(&mut self) -> Result<TickAction, OrchestratorError> {
        let phase = self.snapshot.state.phase;
        if phase.is_terminal() {
            return Ok(TickAction::Idle);
        }

        let Some(step) = next_step(phase, &self.snapshot.artifacts) else {
            // Outputs already present, e.g. resumed between a step and its transition.
            return self.advance(phase).await;
        };

        let unit = self
            .snapshot
            .attempts
            .get(step.id)
            .cloned()
            .unwrap_or_else(|| FunctionAttempts::new(step.id));
        let tier = unit.current_tier;
        let prompt = build_prompt(step, Some(&unit));

        debug!(unit = step.id, %phase, %tier, attempts = unit.total_attempts, "Running step");
        match self.execute_step(step, tier, &prompt).await {
            Ok(produced) => self.on_step_success(step, unit, produced).await,
            Err(failure) => self.on_step_failure(step, unit, tier, failure).await,
        }
    }

    async fn execute_step(
        &mut self,
        step: &PhaseStep,
        tier: ModelTier,
        prompt: &str,
    ) -> Result<Vec<ArtifactTag>, OperationFailure> {
        let mut produced = Vec::new();
        if step.kind.calls_model() {
            let response = self.ops.execute_model_call(tier, prompt).await?;
            let mut metrics = response.metrics;
            metrics.tier = tier;
            self.telemetry.record_model_call(step.phase, &metrics);
            self.sink.record(step.phase, &metrics);
            produced.extend(response.artifacts);
        }
        match step.kind {
            StepKind::Generate => {}
            StepKind::GenerateAndCompile => produced.extend(self.ops.run_compilation().await?.artifacts),
            StepKind::Test => produced.extend(self.ops.run_tests().await?.artifacts),
        }
        Ok(produced)
    }

    async fn on_step_success(
        &mut self,
        step: &PhaseStep,
        unit: FunctionAttempts,
        produced: Vec<ArtifactTag>,
    ) -> Result<TickAction, OrchestratorError> {
        let phase = step.phase;
        self.snapshot
            .attempts
            .insert(step.id.to_string(), reset_syntax_hint(&unit));

        if let Some(rule) = failure_route(phase) {
            if rule.required.iter().all(|tag| produced.contains(tag)) {
                warn!(unit = step.id, %phase, to = %rule.to, "Failure report produced");
                self.snapshot.artifacts.extend(rule.required.iter().copied());
                return self.rewind(rule.to);
            }
        }

        self.snapshot.artifacts.extend(step.outputs.iter().copied());
        for tag in produced {
            if tag.is_report() {
                warn!(unit = step.id, %phase, artifact = %tag, "Ignoring report with no route from this phase");
            } else {
                self.snapshot.artifacts.insert(tag);
            }
        }
        info!(unit = step.id, %phase, "Step completed");

        if next_step(phase, &self.snapshot.artifacts).is_none() {
            return self.advance(phase).await;
        }
        Ok(TickAction::StepCompleted {
            unit: step.id.to_string(),
        })
    }

    async fn on_step_failure(
        &mut self,
        step: &PhaseStep,
        unit: FunctionAttempts,
        tier: ModelTier,
        failure: OperationFailure,
    ) -> Result<TickAction, OrchestratorError> {
        let phase = step.phase;
        self.telemetry.record_failure(phase);

        if failure.transient {
            warn!(unit = step.id, %phase, error = %failure, "Transient failure; attempt not counted");
            let error = failure.to_string();
            self.snapshot.state = self.snapshot.state.with_substate(ProtocolSubstate::failed(
                error.clone(),
                Some(TRANSIENT_CODE),
                true,
            ));
            return Ok(TickAction::Failed {
                error,
                recoverable: true,
            });
        }

        let classification = classify_failure(&failure);
        let recorded = record_attempt(&unit, tier, Some(&classification));
        let decision = self.engine.determine_escalation(&classification, &recorded, tier);
        self.snapshot
            .attempts
            .insert(step.id.to_string(), apply_decision(&recorded, &decision));

        match decision.action {
            EscalationAction::RetrySame { with_hint, .. } => {
                info!(unit = step.id, %tier, with_hint, failure = %classification.kind(), "Retrying at same tier");
                Ok(TickAction::Retried {
                    unit: step.id.to_string(),
                    tier,
                    with_hint,
                })
            }
            EscalationAction::Escalate { to_tier } => {
                self.telemetry.record_escalation(phase);
                info!(unit = step.id, from = %tier, to = %to_tier, reason = %decision.reason, "Escalating");
                Ok(TickAction::Escalated {
                    unit: step.id.to_string(),
                    to_tier,
                })
            }
            EscalationAction::CircuitBreak {
                reason,
                requires_human_review,
            } => self.circuit_break(step, reason, requires_human_review).await,
        }
    }

    async fn circuit_break(
        &mut self,
        step: &PhaseStep,
        reason: String,
        requires_human_review: bool,
    ) -> Result<TickAction, OrchestratorError> {
        let phase = step.phase;
        self.telemetry.record_circuit_break(phase);
        warn!(unit = step.id, %phase, %reason, requires_human_review, "Circuit break");

        if phase == ProtocolPhase::Injection {
            self.snapshot.artifacts.insert(ArtifactTag::StructuralDefectReport);
        }

        self.ledger.append(NewDecision {
            category: DecisionCategory::Escalation,
            source: DecisionSource::Orchestrator,
            phase,
            confidence: Confidence::Canonical,
            summary: format!("Circuit break on {}", step.id),
            rationale: Some(reason.clone()),
        })?;

        if requires_human_review {
            let mut options = vec![RESOLVE_RETRY.to_string()];
            if failure_route(phase).is_some_and(|r| self.snapshot.artifacts.contains_all(r.required)) {
                options.push(RESOLVE_REWIND.to_string());
            }
            options.push(RESOLVE_ABORT.to_string());

            let query = format!(
                "Circuit break on {}: {}. How should the protocol proceed?",
                step.id, reason
            );
            let (state, record) =
                self.blocking
                    .enter_blocking(&self.snapshot.state, &query, Some(options), None)?;
            self.snapshot.state = state;
            self.snapshot.upsert_blocking(record.clone());
            // Persist before anyone is told about the halt.
            self.persist()?;
            self.ops.send_blocking_notification(&record).await;
            Ok(TickAction::Blocked { query })
        } else {
            let error = format!("Circuit break on {}: {}", step.id, reason);
            let context = BTreeMap::from([
                ("unit".to_string(), step.id.to_string()),
                ("reason".to_string(), reason),
            ]);
            self.snapshot.state = self.snapshot.state.with_substate(ProtocolSubstate::Failed {
                error: error.clone(),
                code: Some(CIRCUIT_BREAK_CODE.to_string()),
                failed_at: Utc::now(),
                recoverable: false,
                context: Some(context),
            });
            Ok(TickAction::Failed {
                error,
                recoverable: false,
            })
        }
    }

    /// Apply the operator's answer to a circuit-break query.
    ///
    /// Returns `None` for queries that are not circuit breaks.
    fn apply_circuit_resolution(
        &mut self,
        record: &BlockingRecord,
        selection: &str,
    ) -> Result<Option<TickAction>, OrchestratorError> {
        if !is_circuit_break_query(record) {
            return Ok(None);
        }
        let phase = self.snapshot.state.phase;
        let action = match selection {
            RESOLVE_RETRY => {
                self.snapshot.artifacts.remove(ArtifactTag::StructuralDefectReport);
                self.reset_current_unit();
                TickAction::Recovered
            }
            RESOLVE_REWIND => match failure_route(phase) {
                Some(rule) => self.rewind(rule.to)?,
                None => TickAction::Idle,
            },
            RESOLVE_ABORT => {
                let error = "Aborted by operator".to_string();
                self.snapshot.state = self.snapshot.state.with_substate(ProtocolSubstate::failed(
                    error.clone(),
                    Some(ABORTED_CODE),
                    false,
                ));
                TickAction::Failed {
                    error,
                    recoverable: false,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(action))
    }

    /// Forward transition out of a finished phase.
    async fn advance(&mut self, phase: ProtocolPhase) -> Result<TickAction, OrchestratorError> {
        let Some(target) = phase.next() else {
            return Ok(TickAction::Idle);
        };
        let transition = validate_transition(&self.snapshot.state, target, &self.snapshot.artifacts)?;
        self.snapshot.state = transition.state;
        info!(from = %phase, to = %target, "Phase advanced");

        if let Err(e) = self.ops.archive_phase_artifacts(phase).await {
            warn!(%phase, error = %e, "Failed to archive phase artifacts");
        }
        Ok(TickAction::Advanced {
            from: phase,
            to: target,
        })
    }

    /// Failure transition; drops artifacts and attempt histories from `target` onward.
    fn rewind(&mut self, target: ProtocolPhase) -> Result<TickAction, OrchestratorError> {
        let from = self.snapshot.state.phase;
        let transition = validate_transition(&self.snapshot.state, target, &self.snapshot.artifacts)?;
        self.snapshot.state = transition.state;

        for tag in artifacts_from(target) {
            self.snapshot.artifacts.remove(tag);
        }
        if let Some(rule) = transition_rule(from, target) {
            for tag in rule.required {
                self.snapshot.artifacts.remove(*tag);
            }
        }
        self.snapshot
            .attempts
            .retain(|id, _| find_step(id).map_or(true, |step| step.phase < target));
        warn!(%from, to = %target, "Phase rewound");
        Ok(TickAction::Rewound { from, to: target })
    }

    /// Restart attempt counts for the current unit, keeping its tier.
    fn reset_current_unit(&mut self) {
        let Some(step) = next_step(self.snapshot.state.phase, &self.snapshot.artifacts) else {
            return;
        };
        if let Some(unit) = self.snapshot.attempts.get_mut(step.id) {
            *unit = FunctionAttempts {
                current_tier: unit.current_tier,
                ..FunctionAttempts::new(step.id)
            };
        }
    }
}

fn is_circuit_break_query(record: &BlockingRecord) -> bool {
    record.options.as_ref().is_some_and(|options| {
        options.iter().any(|o| o == RESOLVE_RETRY) && options.iter().any(|o| o == RESOLVE_ABORT)
    })
}
