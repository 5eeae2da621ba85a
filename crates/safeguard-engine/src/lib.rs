#![forbid(unsafe_code)]

mod checkpoint;
mod config;
mod error;
mod events;
mod executor;
mod gate;
mod rollback;

use std::collections::BTreeMap;

use anyhow::Context;
use safeguard_domain::{
    hash_json, now_utc, ApplyMode, ChangeSet, FailureKind, ResourceOutcome, ResourceOutcomeKind,
    ResourceRef, RunId, RunRecord, RunStatus, RunStatusReport, Scope, StepCode, StepId,
    StepRecord, StepStatus, TraceEventType, VersionId,
};
use safeguard_policy::{check_resources_in_scope, DEFAULT_PIPELINE};
use safeguard_target::TargetSystem;
use safeguard_trace_core::RunStore;
use serde_json::{json, Value};

pub use config::{CheckpointConfig, EngineConfig, RollbackConfig, RunConfig, DEFAULT_ENGINE_VERSION};
pub use error::{EngineError, EngineResult};
pub use events::{replay_audit, ChannelEventListener, EventListener, ReplayReport};

use events::EventChain;

/// Drives change sets through the fixed pipeline. Holds no run state of its
/// own: every call loads the run from the store, so a suspended run can be
/// resumed by any instance sharing that store.
pub struct Engine<'a> {
    store: &'a dyn RunStore,
    target: &'a dyn TargetSystem,
    config: EngineConfig,
    listeners: Vec<&'a dyn EventListener>,
}

/// One run loaded for the duration of a single engine call.
pub(crate) struct RunSession {
    pub(crate) run: RunRecord,
    pub(crate) steps: Vec<StepRecord>,
    pub(crate) chain: EventChain,
}

impl RunSession {
    fn next_step_index(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|step| matches!(step.status, StepStatus::Pending | StepStatus::Running))
    }

    fn step_index_of(&self, code: StepCode) -> Option<usize> {
        self.steps.iter().position(|step| step.step_code == code)
    }

    fn touched_resources(&self) -> Vec<ResourceRef> {
        self.run.change_set.touched_resources()
    }
}

impl<'a> Engine<'a> {
    #[must_use]
    pub fn new(store: &'a dyn RunStore, target: &'a dyn TargetSystem, config: EngineConfig) -> Self {
        Self {
            store,
            target,
            config,
            listeners: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_listener(mut self, listener: &'a dyn EventListener) -> Self {
        self.listeners.push(listener);
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Admit a change set and instantiate its pipeline. Nothing runs until `advance`.
    ///
    /// # Errors
    /// `InvalidScope` when the scope is empty, the plan has no operations or an
    /// operation targets a resource outside the scope; `Store` on persistence failure.
    pub fn start_run(
        &self,
        change_set: &ChangeSet,
        scope: &Scope,
        mode: ApplyMode,
        run_config: &RunConfig,
    ) -> EngineResult<RunId> {
        self.store.migrate()?;

        let admission = check_resources_in_scope(scope, change_set);
        let mut violations: Vec<String> = admission
            .findings()
            .into_iter()
            .map(|finding| finding.message)
            .collect();
        if change_set.operations.is_empty() {
            violations.push("change set has no operations".to_string());
        }
        if !violations.is_empty() {
            tracing::warn!(
                change_set = %change_set.change_set_name,
                violations = violations.len(),
                "change set rejected at admission"
            );
            return Err(EngineError::InvalidScope { violations });
        }

        let run_id = run_config.run_id.unwrap_or_default();
        let plan_value =
            serde_json::to_value(change_set).context("failed to serialize change set")?;
        let plan_hash = hash_json(&plan_value)?;
        let touched = change_set.touched_resources();

        let manifest = json!({
            "schema": "run_manifest.v1",
            "run_id": run_id.to_string(),
            "plan_hash": plan_hash,
            "scope": scope,
            "mode": mode,
            "engine_version": self.config.engine_version,
            "requested_by": run_config.requested_by,
            "external_correlation_id": run_config.external_correlation_id,
            "cli_args_json": run_config.cli_args_json,
        });
        let manifest_hash = hash_json(&manifest)?;

        let run = RunRecord {
            run_id,
            change_set_name: change_set.change_set_name.clone(),
            plan_hash: plan_hash.clone(),
            scope: scope.clone(),
            mode,
            change_set: change_set.clone(),
            status: RunStatus::Running,
            failure_kind: None,
            reason: None,
            manual_intervention_required: false,
            warnings: Vec::new(),
            outcomes: Vec::new(),
            checkpoint_id: None,
            gate_timeout_ms: self.config.gate_timeout_ms,
            started_at: now_utc(),
            ended_at: None,
            external_correlation_id: run_config.external_correlation_id.clone(),
            requested_by: run_config.requested_by.clone(),
            engine_version: self.config.engine_version.clone(),
            cli_args_json: run_config.cli_args_json.clone(),
            manifest_hash: Some(manifest_hash.clone()),
            pending_rollback: None,
        };
        self.store.insert_run(&run)?;

        let mut steps = Vec::with_capacity(DEFAULT_PIPELINE.len());
        for (step_index, definition) in DEFAULT_PIPELINE.iter().enumerate() {
            let step = StepRecord {
                step_id: StepId::new(),
                run_id,
                step_index,
                step_code: definition.code,
                status: StepStatus::Pending,
                requires_gate: definition.requires_gate,
                checkpoint_required: definition.checkpoint_required,
                started_at: None,
                ended_at: None,
                input_summary: json!({
                    "step_code": definition.code,
                    "mode": mode,
                    "operations": change_set.operations.len(),
                    "resources": touched,
                }),
                output_summary: None,
                affected_resources: touched.clone(),
                error_json: None,
            };
            self.store.insert_step(&step)?;
            steps.push(step);
        }

        let mut session = RunSession {
            run,
            steps,
            chain: EventChain::default(),
        };
        self.emit_as(
            &mut session,
            None,
            TraceEventType::RunStarted,
            "user",
            &run_config.requested_by,
            json!({
                "change_set_name": change_set.change_set_name,
                "plan_hash": plan_hash,
                "mode": mode,
                "resources": touched,
                "manifest_hash": manifest_hash,
                "gate_timeout_ms": self.config.gate_timeout_ms,
            }),
        )?;

        tracing::info!(
            %run_id,
            change_set = %change_set.change_set_name,
            mode = mode.as_str(),
            resources = touched.len(),
            "run started"
        );
        Ok(run_id)
    }

    /// Execute steps in order until the run suspends at a gate or terminates.
    /// Idempotent on suspended and terminal runs.
    ///
    /// # Errors
    /// `RunNotFound` for an unknown run; `Store` on persistence failure.
    pub fn advance(&self, run_id: RunId) -> EngineResult<RunStatus> {
        let mut session = self.load_session(run_id)?;
        match session.run.status {
            status if status.is_terminal() => return Ok(status),
            RunStatus::WaitingGate => {
                self.expire_gate_if_due(&mut session)?;
                return Ok(session.run.status);
            }
            _ => {}
        }

        self.drive(&mut session)?;
        Ok(session.run.status)
    }

    /// Full picture of a run. An expired gate is settled first.
    ///
    /// # Errors
    /// `RunNotFound` for an unknown run; `Store` on persistence failure.
    pub fn get_run_status(&self, run_id: RunId) -> EngineResult<RunStatusReport> {
        let mut session = self.load_session(run_id)?;
        self.expire_gate_if_due(&mut session)?;
        self.status_report(session)
    }

    /// Abort a run that has not reached Apply.
    ///
    /// # Errors
    /// `RunTerminal` for a finished run; `CannotCancel` once Apply has started.
    pub fn cancel_run(
        &self,
        run_id: RunId,
        cancelled_by: &str,
        reason: Option<&str>,
    ) -> EngineResult<RunStatus> {
        let mut session = self.load_session(run_id)?;
        self.expire_gate_if_due(&mut session)?;
        if session.run.status.is_terminal() {
            return Err(EngineError::RunTerminal {
                run_id,
                status: session.run.status.as_str(),
            });
        }

        let apply_started = session
            .step_index_of(StepCode::Apply)
            .map(|index| &session.steps[index])
            .is_some_and(|step| step.status != StepStatus::Pending);
        if apply_started {
            return Err(EngineError::CannotCancel {
                run_id,
                reason: "apply_in_progress".to_string(),
            });
        }

        let reason = reason.map_or_else(
            || format!("cancelled by {cancelled_by}"),
            |text| format!("cancelled by {cancelled_by}: {text}"),
        );
        self.cancel_pending_gate(&mut session, cancelled_by, &reason)?;
        self.emit_as(
            &mut session,
            None,
            TraceEventType::RunCancelled,
            "user",
            cancelled_by,
            json!({ "reason": reason }),
        )?;
        self.fail_run(&mut session, FailureKind::Cancelled, reason)?;
        Ok(session.run.status)
    }

    fn load_session(&self, run_id: RunId) -> EngineResult<RunSession> {
        let run = self
            .store
            .get_run(run_id)?
            .ok_or(EngineError::RunNotFound { run_id })?;
        let steps = self.store.get_step_records(run_id)?;
        let chain = EventChain {
            prev_event_hash: self.store.last_event_hash(run_id)?,
        };
        Ok(RunSession { run, steps, chain })
    }

    fn status_report(&self, session: RunSession) -> EngineResult<RunStatusReport> {
        let run_id = session.run.run_id;
        Ok(RunStatusReport {
            gate_requests: self.store.list_gate_requests(run_id)?,
            revisions: self.store.list_revisions(run_id)?,
            run: session.run,
            steps: session.steps,
        })
    }

    pub(crate) fn start_step(&self, session: &mut RunSession, index: usize) -> anyhow::Result<()> {
        let step = &mut session.steps[index];
        step.status = StepStatus::Running;
        if step.started_at.is_none() {
            step.started_at = Some(now_utc());
        }
        self.store.update_step(step)?;
        let (step_id, payload) = (
            step.step_id,
            json!({"step_index": step.step_index, "step_code": step.step_code}),
        );
        tracing::info!(
            run_id = %session.run.run_id,
            step = step.step_code.as_str(),
            "step started"
        );
        self.emit(session, Some(step_id), TraceEventType::StepStarted, payload)?;
        Ok(())
    }

    pub(crate) fn complete_step(
        &self,
        session: &mut RunSession,
        index: usize,
        output: Value,
    ) -> anyhow::Result<()> {
        let step = &mut session.steps[index];
        step.status = StepStatus::Completed;
        step.ended_at = Some(now_utc());
        step.output_summary = Some(output.clone());
        self.store.update_step(step)?;
        let (step_id, payload) = (
            step.step_id,
            json!({
                "step_index": step.step_index,
                "step_code": step.step_code,
                "output": output,
            }),
        );
        tracing::info!(
            run_id = %session.run.run_id,
            step = step.step_code.as_str(),
            "step completed"
        );
        self.emit(session, Some(step_id), TraceEventType::StepCompleted, payload)?;
        Ok(())
    }

    pub(crate) fn fail_step(
        &self,
        session: &mut RunSession,
        index: usize,
        error: Value,
    ) -> anyhow::Result<()> {
        let step = &mut session.steps[index];
        step.status = StepStatus::Failed;
        step.ended_at = Some(now_utc());
        step.error_json = Some(error.clone());
        self.store.update_step(step)?;
        let (step_id, payload) = (
            step.step_id,
            json!({
                "step_index": step.step_index,
                "step_code": step.step_code,
                "error": error,
            }),
        );
        tracing::info!(
            run_id = %session.run.run_id,
            step = step.step_code.as_str(),
            "step failed"
        );
        self.emit(session, Some(step_id), TraceEventType::StepFailed, payload)?;
        Ok(())
    }

    /// Terminate a run as `failed` before anything was written.
    pub(crate) fn fail_run(
        &self,
        session: &mut RunSession,
        kind: FailureKind,
        reason: String,
    ) -> anyhow::Result<()> {
        session.run.status = RunStatus::Failed;
        session.run.failure_kind = Some(kind);
        session.run.reason = Some(reason);
        self.finish_run(session, &BTreeMap::new())
    }

    /// Settle the terminal status of a run that reached Verify.
    pub(crate) fn settle_run(
        &self,
        session: &mut RunSession,
        observed: &BTreeMap<ResourceRef, VersionId>,
    ) -> anyhow::Result<()> {
        session.run.status = match session.run.failure_kind {
            None => RunStatus::Succeeded,
            Some(FailureKind::RollbackPartialFailure) => RunStatus::Failed,
            Some(_) => RunStatus::RolledBack,
        };
        if session.run.reason.is_none() {
            session.run.reason = Some(format!(
                "applied {} resource(s) in {} mode",
                session.touched_resources().len(),
                session.run.mode.as_str()
            ));
        }
        self.finish_run(session, observed)
    }

    fn finish_run(
        &self,
        session: &mut RunSession,
        observed: &BTreeMap<ResourceRef, VersionId>,
    ) -> anyhow::Result<()> {
        session.run.ended_at = Some(now_utc());
        session.run.outcomes = self.resource_outcomes(session, observed)?;
        self.store.update_run(&session.run)?;

        let payload = json!({
            "status": session.run.status,
            "failure_kind": session.run.failure_kind,
            "reason": session.run.reason,
            "manual_intervention_required": session.run.manual_intervention_required,
            "outcomes": session.run.outcomes,
        });
        match session.run.status {
            RunStatus::Succeeded => tracing::info!(run_id = %session.run.run_id, "run succeeded"),
            status => tracing::info!(
                run_id = %session.run.run_id,
                status = status.as_str(),
                failure_kind = session.run.failure_kind.map(FailureKind::as_str),
                reason = session.run.reason.as_deref(),
                "run finished"
            ),
        }
        self.emit(session, None, TraceEventType::RunFinished, payload)?;
        Ok(())
    }

    /// Per-resource account derived from the checkpoint, revisions and rollback attempts.
    pub(crate) fn resource_outcomes(
        &self,
        session: &RunSession,
        observed: &BTreeMap<ResourceRef, VersionId>,
    ) -> anyhow::Result<Vec<ResourceOutcome>> {
        let run_id = session.run.run_id;
        let checkpoint = match session.run.checkpoint_id {
            Some(checkpoint_id) => self.store.get_checkpoint(checkpoint_id)?,
            None => None,
        };
        let revisions: BTreeMap<ResourceRef, VersionId> = self
            .store
            .list_revisions(run_id)?
            .into_iter()
            .map(|revision| (revision.resource, revision.new_version))
            .collect();
        let mut last_attempts = BTreeMap::new();
        for attempt in self.store.list_rollback_attempts(run_id)? {
            last_attempts.insert(attempt.resource.clone(), attempt);
        }
        let apply_attempted = session
            .step_index_of(StepCode::Apply)
            .is_some_and(|index| session.steps[index].status != StepStatus::Pending);

        let mut outcomes = Vec::new();
        for resource in session.touched_resources() {
            let prior_version = checkpoint
                .as_ref()
                .and_then(|checkpoint| checkpoint.version_of(&resource))
                .cloned();
            let (outcome, final_version, detail) = if let Some(attempt) =
                last_attempts.get(&resource)
            {
                if attempt.succeeded {
                    (
                        ResourceOutcomeKind::RolledBack,
                        Some(attempt.target_version.clone()),
                        None,
                    )
                } else {
                    (
                        ResourceOutcomeKind::RollbackFailed,
                        None,
                        attempt.error_text.clone(),
                    )
                }
            } else if let Some(new_version) = revisions.get(&resource) {
                (ResourceOutcomeKind::Applied, Some(new_version.clone()), None)
            } else if apply_attempted {
                (ResourceOutcomeKind::NotApplied, prior_version.clone(), None)
            } else {
                (ResourceOutcomeKind::Untouched, prior_version.clone(), None)
            };

            outcomes.push(ResourceOutcome {
                final_version: observed.get(&resource).cloned().or(final_version),
                resource,
                outcome,
                prior_version,
                detail,
            });
        }
        Ok(outcomes)
    }
}
