use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Context, Result};
use safeguard_domain::{
    now_utc, Checkpoint, FailureKind, Finding, ResourceRef, Revision, RevisionId, RunStatus,
    StepCode, StepStatus, TraceEventType, VersionId,
};
use safeguard_policy::enforce_plan_scope;
use serde_json::{json, Value};

use crate::{Engine, RunSession};

impl Engine<'_> {
    /// Run steps while the run stays `running`. Dispatch is by step code only.
    pub(crate) fn drive(&self, session: &mut RunSession) -> Result<()> {
        if session.run.pending_rollback.is_some() {
            self.resume_pending_rollback(session)?;
        }
        while session.run.status == RunStatus::Running {
            let Some(index) = session.next_step_index() else {
                self.settle_run(session, &BTreeMap::new())?;
                break;
            };

            match session.steps[index].step_code {
                StepCode::PreFlight
                | StepCode::HealthCheck
                | StepCode::MappingValidation
                | StepCode::PlanValidation
                | StepCode::PreApplyValidation => self.execute_validation(session, index)?,
                StepCode::Apply => self.execute_apply(session, index)?,
                StepCode::Verify => self.execute_verify(session, index)?,
            }
        }
        Ok(())
    }

    fn execute_validation(&self, session: &mut RunSession, index: usize) -> Result<()> {
        let step_code = session.steps[index].step_code;
        let requires_gate = session.steps[index].requires_gate;
        let kind = step_code
            .validation_kind()
            .ok_or_else(|| anyhow!("{} is not a validation step", step_code.as_str()))?;

        self.start_step(session, index)?;

        let report = match self
            .target
            .validate(kind, &session.run.scope, &session.run.change_set)
        {
            Ok(report) => report,
            Err(err) => {
                let reason = format!("{} validation could not run: {err:#}", kind.as_str());
                self.fail_step(session, index, json!({ "error": reason }))?;
                return self.fail_run(session, FailureKind::ValidationFailed, reason);
            }
        };

        if step_code == StepCode::PlanValidation {
            let scope_check = enforce_plan_scope(&session.run.scope, &session.run.change_set);
            if !scope_check.is_clean() {
                let messages: Vec<String> = scope_check
                    .findings()
                    .into_iter()
                    .map(|finding| finding.message)
                    .collect();
                let reason = format!("plan leaves the run scope: {}", messages.join("; "));
                self.fail_step(
                    session,
                    index,
                    json!({ "scope_violations": scope_check.violations }),
                )?;
                return self.fail_run(session, FailureKind::InvalidScope, reason);
            }
        }

        if !report.warnings.is_empty() {
            session.run.warnings.extend(report.warnings.iter().cloned());
            self.store.update_run(&session.run)?;
        }

        if !report.passed {
            let reason = if report.errors.is_empty() {
                format!("{} validation failed", kind.as_str())
            } else {
                let messages: Vec<&str> = report
                    .errors
                    .iter()
                    .map(|finding| finding.message.as_str())
                    .collect();
                format!("{} validation failed: {}", kind.as_str(), messages.join("; "))
            };
            self.fail_step(
                session,
                index,
                json!({ "errors": report.errors, "warnings": report.warnings }),
            )?;
            return self.fail_run(session, FailureKind::ValidationFailed, reason);
        }

        let output = json!({
            "validation": kind,
            "passed": true,
            "warnings": report.warnings,
        });
        if requires_gate {
            return self.open_gate(session, index, output);
        }
        self.complete_step(session, index, output)
    }

    fn execute_apply(&self, session: &mut RunSession, index: usize) -> Result<()> {
        let resumed = session.steps[index].status == StepStatus::Running;
        self.start_step(session, index)?;
        let run_id = session.run.run_id;

        let checkpoint = match session.run.checkpoint_id {
            Some(checkpoint_id) => self.store.get_checkpoint(checkpoint_id)?,
            None => None,
        };
        let Some(checkpoint) = checkpoint else {
            let reason = "apply reached without a captured checkpoint".to_string();
            self.fail_step(session, index, json!({ "error": reason }))?;
            return self.fail_run(session, FailureKind::CheckpointFailed, reason);
        };

        let existing = self.store.list_revisions(run_id)?;
        let recorded: BTreeSet<&ResourceRef> =
            existing.iter().map(|revision| &revision.resource).collect();
        if session
            .touched_resources()
            .iter()
            .all(|resource| recorded.contains(resource))
        {
            tracing::info!(%run_id, revisions = existing.len(), "apply already recorded; not writing again");
            return self.complete_step(
                session,
                index,
                json!({ "written": existing.len(), "replayed": true }),
            );
        }

        if resumed || !existing.is_empty() {
            let changed = self.changed_since_checkpoint(&checkpoint, &recorded)?;
            if !changed.is_empty() {
                let reason = format!(
                    "apply interrupted before its revisions were recorded; {} resource(s) already changed",
                    changed.len()
                );
                tracing::warn!(%run_id, changed = changed.len(), "resuming an interrupted apply");
                let error = json!({ "error": reason, "written": changed });
                return self.fail_apply(session, index, &checkpoint, changed, reason, error);
            }
        }

        let expected = checkpoint.expected_versions();
        match self
            .target
            .write_state(&session.run.change_set, session.run.mode, &expected)
        {
            Ok(outcome) => match outcome.failure {
                None => {
                    for (resource, new_version) in &outcome.written {
                        self.record_revision(session, &checkpoint, resource, new_version)?;
                    }
                    self.complete_step(session, index, json!({ "written": outcome.written }))
                }
                Some(failure) => {
                    let reason = format!("apply failed: {}", failure.message);
                    let written: Vec<ResourceRef> = outcome.written.keys().cloned().collect();
                    let error = json!({ "failure": failure, "written": outcome.written });
                    self.fail_apply(session, index, &checkpoint, written, reason, error)
                }
            },
            Err(err) => {
                // Unknown how far the write got, so every checkpointed resource is restored.
                let reason = format!("apply failed: {err:#}");
                let all: Vec<ResourceRef> = checkpoint
                    .entries
                    .iter()
                    .map(|entry| entry.resource.clone())
                    .collect();
                let error = json!({ "error": reason });
                self.fail_apply(session, index, &checkpoint, all, reason, error)
            }
        }
    }

    /// Checkpointed resources that already carry a revision or no longer sit
    /// at their checkpoint version.
    fn changed_since_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        recorded: &BTreeSet<&ResourceRef>,
    ) -> Result<Vec<ResourceRef>> {
        let refs: Vec<ResourceRef> = checkpoint
            .entries
            .iter()
            .map(|entry| entry.resource.clone())
            .collect();
        let current = self
            .target
            .read_state(&refs)
            .context("could not re-read target state of an interrupted apply")?;
        Ok(checkpoint
            .entries
            .iter()
            .filter(|entry| {
                recorded.contains(&entry.resource)
                    || current
                        .get(&entry.resource)
                        .map_or(true, |state| state.version_id != entry.version_id)
            })
            .map(|entry| entry.resource.clone())
            .collect())
    }

    /// Record the Apply failure together with the resources still to restore,
    /// then roll them back. Both land in one run update before the first
    /// restore, so an interrupted rollback resumes instead of reaching Verify.
    fn fail_apply(
        &self,
        session: &mut RunSession,
        index: usize,
        checkpoint: &Checkpoint,
        written: Vec<ResourceRef>,
        reason: String,
        error: Value,
    ) -> Result<()> {
        session.run.failure_kind = Some(FailureKind::ApplyFailed);
        session.run.reason = Some(reason);
        session.run.pending_rollback = Some(written);
        self.store.update_run(&session.run)?;
        self.fail_step(session, index, error)?;
        self.rollback_after_apply(session, checkpoint)
    }

    fn record_revision(
        &self,
        session: &mut RunSession,
        checkpoint: &Checkpoint,
        resource: &ResourceRef,
        new_version: &VersionId,
    ) -> Result<()> {
        let prior_version = checkpoint.version_of(resource).cloned().ok_or_else(|| {
            anyhow!("target reported a write to {resource}, which is not in the checkpoint")
        })?;
        let revision = Revision {
            revision_id: RevisionId::new(),
            run_id: session.run.run_id,
            checkpoint_id: checkpoint.checkpoint_id,
            resource: resource.clone(),
            prior_version,
            new_version: new_version.clone(),
            recorded_at: now_utc(),
        };
        self.store.insert_revision(&revision)?;
        let step_id = session
            .step_index_of(StepCode::Apply)
            .map(|index| session.steps[index].step_id);
        self.emit(
            session,
            step_id,
            TraceEventType::RevisionRecorded,
            json!({
                "revision_id": revision.revision_id,
                "resource": revision.resource,
                "prior_version": revision.prior_version,
                "new_version": revision.new_version,
                "checkpoint_id": revision.checkpoint_id,
            }),
        )?;
        Ok(())
    }

    fn execute_verify(&self, session: &mut RunSession, index: usize) -> Result<()> {
        self.start_step(session, index)?;
        let run_id = session.run.run_id;

        let expected: BTreeMap<ResourceRef, VersionId> = if session.run.failure_kind.is_some() {
            match session.run.checkpoint_id {
                Some(checkpoint_id) => self
                    .store
                    .get_checkpoint(checkpoint_id)?
                    .map(|checkpoint| checkpoint.expected_versions())
                    .unwrap_or_default(),
                None => BTreeMap::new(),
            }
        } else {
            self.store
                .list_revisions(run_id)?
                .into_iter()
                .map(|revision| (revision.resource, revision.new_version))
                .collect()
        };

        let refs: Vec<ResourceRef> = expected.keys().cloned().collect();
        let mut findings = Vec::new();
        let observed: BTreeMap<ResourceRef, VersionId> = match self.target.read_state(&refs) {
            Ok(states) => states
                .into_iter()
                .map(|(resource, state)| (resource, state.version_id))
                .collect(),
            Err(err) => {
                findings.push(Finding::new(
                    "verify_read_failed",
                    format!("verify could not re-read target state: {err:#}"),
                ));
                BTreeMap::new()
            }
        };

        for (resource, want) in &expected {
            let mismatch = match observed.get(resource) {
                Some(found) if found == want => continue,
                Some(found) => format!("{resource}: expected {want}, found {found}"),
                None if findings.is_empty() => format!("{resource}: expected {want}, found nothing"),
                None => continue,
            };
            tracing::warn!(%run_id, %resource, "verify mismatch");
            findings.push(Finding::new("verify_mismatch", mismatch).for_resource(resource));
        }

        let step_id = session.steps[index].step_id;
        for finding in &findings {
            self.emit(
                session,
                Some(step_id),
                TraceEventType::VerifyMismatch,
                json!({
                    "code": finding.code,
                    "resource": finding.resource,
                    "message": finding.message,
                }),
            )?;
        }

        let against = if session.run.failure_kind.is_some() {
            "checkpoint"
        } else {
            "revisions"
        };
        let output = json!({
            "checked": expected.len(),
            "mismatches": findings.len(),
            "against": against,
        });
        session.run.warnings.extend(findings);
        self.complete_step(session, index, output)?;
        self.settle_run(session, &observed)
    }
}
