#![forbid(unsafe_code)]

use anyhow::Result;
use safeguard_domain::{
    Checkpoint, CheckpointId, EventRow, GateDecisionUpdate, GateRequest, GateRequestId, Revision,
    RollbackAttemptRecord, RunId, RunRecord, StepRecord, TraceEvent,
};

/// Durable home of every run artifact. Checkpoints, revisions, rollback
/// attempts and trace events are append-only; gate decisions are write-once.
pub trait RunStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_run(&self, run: &RunRecord) -> Result<()>;

    /// Persist the mutable parts of a run: status, failure, outcomes, checkpoint and manifest.
    #[allow(clippy::missing_errors_doc)]
    fn update_run(&self, run: &RunRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_runs(&self) -> Result<Vec<RunRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_step(&self, step: &StepRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn update_step(&self, step: &StepRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_step_records(&self, run_id: RunId) -> Result<Vec<StepRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_gate_request(&self, request: &GateRequest) -> Result<()>;

    /// Record a decision on an undecided request. Returns `false` when the
    /// request was already decided; the stored decision is left untouched.
    #[allow(clippy::missing_errors_doc)]
    fn decide_gate_request(
        &self,
        gate_request_id: GateRequestId,
        update: &GateDecisionUpdate,
    ) -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn list_gate_requests(&self, run_id: RunId) -> Result<Vec<GateRequest>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<Option<Checkpoint>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_revision(&self, revision: &Revision) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_revisions(&self, run_id: RunId) -> Result<Vec<Revision>>;

    #[allow(clippy::missing_errors_doc)]
    fn append_rollback_attempt(&self, run_id: RunId, attempt: &RollbackAttemptRecord)
        -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_rollback_attempts(&self, run_id: RunId) -> Result<Vec<RollbackAttemptRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn append_event(&self, event: &TraceEvent) -> Result<i64>;

    #[allow(clippy::missing_errors_doc)]
    fn list_events_for_run(&self, run_id: RunId) -> Result<Vec<EventRow>>;

    /// Hash of the newest event of a run, used to continue its chain after a restart.
    #[allow(clippy::missing_errors_doc)]
    fn last_event_hash(&self, run_id: RunId) -> Result<Option<String>>;
}
