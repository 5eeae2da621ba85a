use safeguard_domain::{CheckpointId, GateRequestId, RunId};

/// Caller-facing contract violations. Run-level failures (a rejected gate,
/// a failed apply) are recorded on the run, not returned as errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid scope: {}", .violations.join("; "))]
    InvalidScope { violations: Vec<String> },
    #[error("run {run_id} not found")]
    RunNotFound { run_id: RunId },
    #[error("run {run_id} is already {status}")]
    RunTerminal { run_id: RunId, status: &'static str },
    #[error("run {run_id} is still active; rollback needs a finished run")]
    RunActive { run_id: RunId },
    #[error("cannot cancel run {run_id}: {reason}")]
    CannotCancel { run_id: RunId, reason: String },
    #[error("run {run_id} is not waiting on a gate")]
    NotWaitingGate { run_id: RunId },
    #[error("run {run_id} is waiting on step {waiting}, not step {requested}")]
    GateStepMismatch {
        run_id: RunId,
        requested: usize,
        waiting: usize,
    },
    #[error("gate request {gate_request_id} was already decided")]
    GateAlreadyDecided { gate_request_id: GateRequestId },
    #[error("checkpoint {checkpoint_id} not found")]
    CheckpointNotFound { checkpoint_id: CheckpointId },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable code for CLI and API surfaces.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidScope { .. } => "invalid_scope",
            Self::RunNotFound { .. } => "run_not_found",
            Self::RunTerminal { .. } => "run_terminal",
            Self::RunActive { .. } => "run_active",
            Self::CannotCancel { .. } => "cannot_cancel",
            Self::NotWaitingGate { .. } => "not_waiting_gate",
            Self::GateStepMismatch { .. } => "gate_step_mismatch",
            Self::GateAlreadyDecided { .. } => "gate_already_decided",
            Self::CheckpointNotFound { .. } => "checkpoint_not_found",
            Self::Store(_) => "store_error",
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
