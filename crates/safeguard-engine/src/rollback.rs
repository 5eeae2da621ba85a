use std::collections::BTreeMap;
use std::thread;

use anyhow::{anyhow, Result};
use safeguard_domain::{
    now_utc, Checkpoint, CheckpointId, FailureKind, ResourceRef, RestoreOutcome,
    RollbackAttemptRecord, RollbackResult, RunStatus, StepCode, StepStatus, TraceEventType,
    VersionId,
};
use serde_json::json;

use crate::{Engine, EngineError, EngineResult, RunSession};

impl Engine<'_> {
    /// Restore `resources` to their checkpointed versions. Every attempt is
    /// recorded before the next one starts.
    pub(crate) fn restore_resources(
        &self,
        session: &mut RunSession,
        checkpoint: &Checkpoint,
        resources: &[ResourceRef],
    ) -> Result<RollbackResult> {
        let step_id = session
            .step_index_of(StepCode::Apply)
            .map(|index| session.steps[index].step_id);
        self.emit(
            session,
            step_id,
            TraceEventType::RollbackStarted,
            json!({
                "checkpoint_id": checkpoint.checkpoint_id,
                "resources": resources,
            }),
        )?;

        let mut outcomes = Vec::with_capacity(resources.len());
        for resource in resources {
            let outcome = match checkpoint.version_of(resource) {
                Some(target_version) => {
                    self.restore_with_retry(session, checkpoint, resource, target_version)?
                }
                None => RestoreOutcome {
                    resource: resource.clone(),
                    target_version: VersionId::new(""),
                    attempts: 0,
                    restored: false,
                    error: Some(format!("{resource} is not in checkpoint")),
                },
            };
            outcomes.push(outcome);
        }

        let result = RollbackResult {
            checkpoint_id: checkpoint.checkpoint_id,
            resources: outcomes,
        };
        self.emit(
            session,
            step_id,
            TraceEventType::RollbackFinished,
            json!({
                "checkpoint_id": result.checkpoint_id,
                "fully_restored": result.fully_restored(),
                "resources": result.resources,
            }),
        )?;
        Ok(result)
    }

    fn restore_with_retry(
        &self,
        session: &RunSession,
        checkpoint: &Checkpoint,
        resource: &ResourceRef,
        target_version: &VersionId,
    ) -> Result<RestoreOutcome> {
        let run_id = session.run.run_id;
        let max_attempts = self.config.rollback.max_attempts;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let result = self.target.restore(resource, target_version);
            let error_text = result.as_ref().err().map(|err| format!("{err:#}"));
            self.store.append_rollback_attempt(
                run_id,
                &RollbackAttemptRecord {
                    checkpoint_id: checkpoint.checkpoint_id,
                    resource: resource.clone(),
                    target_version: target_version.clone(),
                    attempt,
                    succeeded: result.is_ok(),
                    error_text: error_text.clone(),
                    attempted_at: now_utc(),
                },
            )?;

            if result.is_ok() {
                tracing::info!(%run_id, %resource, %target_version, attempt, "resource restored");
                return Ok(RestoreOutcome {
                    resource: resource.clone(),
                    target_version: target_version.clone(),
                    attempts: attempt,
                    restored: true,
                    error: None,
                });
            }

            if attempt < max_attempts {
                let backoff = self.config.rollback.backoff_for(attempt);
                tracing::warn!(
                    %run_id,
                    %resource,
                    attempt,
                    backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    error = error_text.as_deref(),
                    "restore failed; retrying"
                );
                thread::sleep(backoff);
            }
            last_error = error_text;
        }

        Ok(RestoreOutcome {
            resource: resource.clone(),
            target_version: target_version.clone(),
            attempts: max_attempts,
            restored: false,
            error: last_error,
        })
    }

    /// Undo a failed apply: restore the run's pending resources, then settle
    /// its failure kind. The run stays `running` so Verify still checks the
    /// target against the checkpoint.
    pub(crate) fn rollback_after_apply(
        &self,
        session: &mut RunSession,
        checkpoint: &Checkpoint,
    ) -> Result<()> {
        let run_id = session.run.run_id;
        let written = session.run.pending_rollback.clone().unwrap_or_default();
        let reason = session
            .run
            .reason
            .clone()
            .unwrap_or_else(|| "apply failed".to_string());
        let result = self.restore_resources(session, checkpoint, &written)?;

        if result.fully_restored() {
            session.run.failure_kind = Some(FailureKind::ApplyFailed);
            session.run.reason = Some(if written.is_empty() {
                format!("{reason}; nothing was written")
            } else {
                format!("{reason}; rolled back {} resource(s)", written.len())
            });
            tracing::warn!(%run_id, restored = written.len(), "apply rolled back");
        } else {
            let failed: Vec<String> = result
                .failed_resources()
                .into_iter()
                .map(ToString::to_string)
                .collect();
            session.run.failure_kind = Some(FailureKind::RollbackPartialFailure);
            session.run.manual_intervention_required = true;
            session.run.reason = Some(format!(
                "{reason}; rollback could not restore {}",
                failed.join(", ")
            ));
            tracing::error!(
                %run_id,
                checkpoint_id = %checkpoint.checkpoint_id,
                failed = %failed.join(", "),
                "rollback incomplete; manual intervention required"
            );
        }
        session.run.pending_rollback = None;
        self.store.update_run(&session.run)?;
        Ok(())
    }

    /// Finish a rollback that an earlier call recorded but did not settle.
    /// Restores are idempotent, so resources already restored are restored again.
    pub(crate) fn resume_pending_rollback(&self, session: &mut RunSession) -> Result<()> {
        let run_id = session.run.run_id;
        let checkpoint = match session.run.checkpoint_id {
            Some(checkpoint_id) => self.store.get_checkpoint(checkpoint_id)?,
            None => None,
        }
        .ok_or_else(|| anyhow!("run {run_id} has a pending rollback but no checkpoint"))?;
        tracing::warn!(%run_id, "resuming interrupted rollback");

        if let Some(index) = session.step_index_of(StepCode::Apply) {
            if session.steps[index].status != StepStatus::Failed {
                let reason = session.run.reason.clone();
                self.fail_step(session, index, json!({ "error": reason }))?;
            }
        }
        self.rollback_after_apply(session, &checkpoint)
    }

    /// Restore every resource of a checkpoint, outside the pipeline. Used to
    /// retry after a partial rollback once the target is healthy again.
    ///
    /// # Errors
    /// `CheckpointNotFound` for an unknown checkpoint; `RunActive` while its
    /// run has not terminated.
    pub fn rollback(&self, checkpoint_id: CheckpointId) -> EngineResult<RollbackResult> {
        let checkpoint = self
            .store
            .get_checkpoint(checkpoint_id)?
            .ok_or(EngineError::CheckpointNotFound { checkpoint_id })?;
        let mut session = self.load_session(checkpoint.run_id)?;
        if !session.run.status.is_terminal() {
            return Err(EngineError::RunActive {
                run_id: checkpoint.run_id,
            });
        }

        let resources: Vec<ResourceRef> = checkpoint
            .entries
            .iter()
            .map(|entry| entry.resource.clone())
            .collect();
        let result = self.restore_resources(&mut session, &checkpoint, &resources)?;

        if result.fully_restored() {
            session.run.status = RunStatus::RolledBack;
            session.run.manual_intervention_required = false;
            if session.run.failure_kind == Some(FailureKind::RollbackPartialFailure) {
                session.run.failure_kind = Some(FailureKind::ApplyFailed);
            }
            session.run.reason = Some(format!(
                "rolled back to checkpoint {checkpoint_id}; {} resource(s) restored",
                result.resources.len()
            ));
            let observed: BTreeMap<ResourceRef, VersionId> = result
                .resources
                .iter()
                .map(|outcome| (outcome.resource.clone(), outcome.target_version.clone()))
                .collect();
            session.run.outcomes = self.resource_outcomes(&session, &observed)?;
            tracing::info!(run_id = %session.run.run_id, %checkpoint_id, "manual rollback complete");
        } else {
            session.run.manual_intervention_required = true;
            tracing::error!(run_id = %session.run.run_id, %checkpoint_id, "manual rollback incomplete");
        }
        self.store.update_run(&session.run)?;
        Ok(result)
    }
}
