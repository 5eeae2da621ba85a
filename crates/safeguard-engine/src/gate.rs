use anyhow::Result;
use safeguard_domain::{
    now_utc, FailureKind, GateDecision, GateDecisionUpdate, GateRequest, GateRequestId, RunId,
    RunStatus, StepStatus, TraceEventType,
};
use serde_json::{json, Value};
use time::Duration;

use crate::checkpoint::CheckpointCapture;
use crate::{Engine, EngineError, EngineResult, RunSession};

impl Engine<'_> {
    /// Suspend the run at a gated step. Captures the checkpoint first when the
    /// step requires one, so the approver sees exactly what will be restored.
    pub(crate) fn open_gate(
        &self,
        session: &mut RunSession,
        index: usize,
        output: Value,
    ) -> Result<()> {
        let run_id = session.run.run_id;
        let checkpoint_required = session.steps[index].checkpoint_required;

        let checkpoint_id = if checkpoint_required {
            match self.capture_checkpoint(session, index)? {
                CheckpointCapture::Captured(checkpoint_id) => Some(checkpoint_id),
                CheckpointCapture::Rejected(reason) => {
                    self.fail_step(session, index, json!({ "error": reason }))?;
                    return self.fail_run(session, FailureKind::CheckpointFailed, reason);
                }
            }
        } else {
            None
        };

        let created_at = now_utc();
        let expires_at = session.run.gate_timeout_ms.and_then(|timeout_ms| {
            let timeout_ms = i64::try_from(timeout_ms).unwrap_or(i64::MAX);
            created_at.checked_add(Duration::milliseconds(timeout_ms))
        });

        let step = &mut session.steps[index];
        step.status = StepStatus::WaitingGate;
        step.output_summary = Some(output);
        self.store.update_step(step)?;

        let affected_resources = step.affected_resources.clone();
        let impact_summary = format!(
            "{} passed; {} operation(s) on {} resource(s) in {} mode{}",
            step.step_code.as_str(),
            session.run.change_set.operations.len(),
            affected_resources.len(),
            session.run.mode.as_str(),
            if checkpoint_required {
                "; checkpoint captured"
            } else {
                ""
            },
        );
        let request = GateRequest {
            gate_request_id: GateRequestId::new(),
            run_id,
            step_id: step.step_id,
            step_index: step.step_index,
            step_code: step.step_code,
            impact_summary,
            affected_resources,
            checkpoint_required,
            checkpoint_id,
            created_at,
            expires_at,
            decision: None,
            decided_by: None,
            decision_reason: None,
            decided_at: None,
        };
        self.store.insert_gate_request(&request)?;

        session.run.status = RunStatus::WaitingGate;
        self.store.update_run(&session.run)?;

        let step_payload = json!({
            "step_index": request.step_index,
            "step_code": request.step_code,
        });
        self.emit(
            session,
            Some(request.step_id),
            TraceEventType::StepWaitingGate,
            step_payload,
        )?;
        self.emit(
            session,
            Some(request.step_id),
            TraceEventType::GateRequested,
            json!({
                "gate_request_id": request.gate_request_id,
                "step_index": request.step_index,
                "impact_summary": request.impact_summary,
                "affected_resources": request.affected_resources,
                "checkpoint_id": request.checkpoint_id,
                "expires_at": request.expires_at.map(safeguard_domain::format_rfc3339).transpose()?,
            }),
        )?;

        tracing::info!(
            %run_id,
            step = request.step_code.as_str(),
            gate_request_id = %request.gate_request_id,
            "waiting for gate decision"
        );
        Ok(())
    }

    /// Settle an undecided gate whose expiry has passed. Returns `true` when
    /// the run was failed with `gate_timeout`.
    pub(crate) fn expire_gate_if_due(&self, session: &mut RunSession) -> Result<bool> {
        if session.run.status != RunStatus::WaitingGate {
            return Ok(false);
        }
        let now = now_utc();
        let Some(request) = self.pending_gate(session.run.run_id)? else {
            return Ok(false);
        };
        if !request.is_expired(now) {
            return Ok(false);
        }

        let update = GateDecisionUpdate {
            decision: GateDecision::TimedOut,
            decided_by: "engine".to_string(),
            reason: Some("gate expired without a decision".to_string()),
            decided_at: now,
        };
        if !self
            .store
            .decide_gate_request(request.gate_request_id, &update)?
        {
            return Ok(false);
        }
        self.emit(
            session,
            Some(request.step_id),
            TraceEventType::GateDecided,
            gate_decided_payload(&request, &update),
        )?;
        tracing::warn!(
            run_id = %session.run.run_id,
            gate_request_id = %request.gate_request_id,
            "gate timed out"
        );

        let reason = format!(
            "gate on {} expired without a decision",
            request.step_code.as_str()
        );
        self.fail_step(
            session,
            request.step_index,
            json!({ "error": reason, "decision": GateDecision::TimedOut }),
        )?;
        self.fail_run(session, FailureKind::GateTimeout, reason)?;
        Ok(true)
    }

    /// Close the open gate of a run being cancelled. No-op when nothing is pending.
    pub(crate) fn cancel_pending_gate(
        &self,
        session: &mut RunSession,
        cancelled_by: &str,
        reason: &str,
    ) -> Result<()> {
        if session.run.status != RunStatus::WaitingGate {
            return Ok(());
        }
        let Some(request) = self.pending_gate(session.run.run_id)? else {
            return Ok(());
        };

        let update = GateDecisionUpdate {
            decision: GateDecision::Cancelled,
            decided_by: cancelled_by.to_string(),
            reason: Some(reason.to_string()),
            decided_at: now_utc(),
        };
        if self
            .store
            .decide_gate_request(request.gate_request_id, &update)?
        {
            self.emit_as(
                session,
                Some(request.step_id),
                TraceEventType::GateDecided,
                "user",
                cancelled_by,
                gate_decided_payload(&request, &update),
            )?;
        }
        self.fail_step(
            session,
            request.step_index,
            json!({ "error": reason, "decision": GateDecision::Cancelled }),
        )
    }

    /// Record a decision on the gate the run is waiting on.
    ///
    /// Approval marks the gated step completed and makes the run runnable; it
    /// does not advance. Rejection fails the run with `gate_rejected`. A
    /// decision arriving after expiry settles the run as `gate_timeout`.
    ///
    /// # Errors
    /// `RunTerminal`, `NotWaitingGate`, `GateStepMismatch` or
    /// `GateAlreadyDecided` when the decision does not apply.
    pub fn handle_gate_decision(
        &self,
        run_id: RunId,
        step_index: usize,
        approved: bool,
        reason: Option<&str>,
        decided_by: &str,
    ) -> EngineResult<RunStatus> {
        let mut session = self.load_session(run_id)?;
        if session.run.status.is_terminal() {
            return Err(EngineError::RunTerminal {
                run_id,
                status: session.run.status.as_str(),
            });
        }
        if self.expire_gate_if_due(&mut session)? {
            return Ok(session.run.status);
        }
        if session.run.status != RunStatus::WaitingGate {
            return Err(EngineError::NotWaitingGate { run_id });
        }
        let request = self
            .pending_gate(run_id)?
            .ok_or(EngineError::NotWaitingGate { run_id })?;
        if request.step_index != step_index {
            return Err(EngineError::GateStepMismatch {
                run_id,
                requested: step_index,
                waiting: request.step_index,
            });
        }

        let decision = if approved {
            GateDecision::Approved
        } else {
            GateDecision::Rejected
        };
        let update = GateDecisionUpdate {
            decision,
            decided_by: decided_by.to_string(),
            reason: reason.map(str::to_string),
            decided_at: now_utc(),
        };
        if !self
            .store
            .decide_gate_request(request.gate_request_id, &update)?
        {
            return Err(EngineError::GateAlreadyDecided {
                gate_request_id: request.gate_request_id,
            });
        }
        self.emit_as(
            &mut session,
            Some(request.step_id),
            TraceEventType::GateDecided,
            "user",
            decided_by,
            gate_decided_payload(&request, &update),
        )?;
        tracing::info!(
            %run_id,
            step = request.step_code.as_str(),
            decision = decision.as_str(),
            decided_by,
            "gate decided"
        );

        if approved {
            let output = session.steps[request.step_index]
                .output_summary
                .clone()
                .unwrap_or(Value::Null);
            self.complete_step(&mut session, request.step_index, output)?;
            session.run.status = RunStatus::Running;
            self.store.update_run(&session.run)?;
        } else {
            let reason = reason.map_or_else(
                || format!("gate on {} rejected by {decided_by}", request.step_code.as_str()),
                |text| {
                    format!(
                        "gate on {} rejected by {decided_by}: {text}",
                        request.step_code.as_str()
                    )
                },
            );
            self.fail_step(
                &mut session,
                request.step_index,
                json!({ "error": reason, "decision": GateDecision::Rejected }),
            )?;
            self.fail_run(&mut session, FailureKind::GateRejected, reason)?;
        }
        Ok(session.run.status)
    }

    fn pending_gate(&self, run_id: RunId) -> Result<Option<GateRequest>> {
        Ok(self
            .store
            .list_gate_requests(run_id)?
            .into_iter()
            .find(|request| request.decision.is_none()))
    }
}

fn gate_decided_payload(request: &GateRequest, update: &GateDecisionUpdate) -> Value {
    json!({
        "gate_request_id": request.gate_request_id,
        "step_index": request.step_index,
        "step_code": request.step_code,
        "decision": update.decision,
        "decided_by": update.decided_by,
        "reason": update.reason,
    })
}
