#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

macro_rules! ulid_id {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(value: &str) -> Result<Self> {
                let ulid = Ulid::from_str(value)
                    .map_err(|err| anyhow!("invalid {} ULID: {err}", $label))?;
                Ok(Self(ulid))
            }
        }
    };
}

ulid_id!(RunId, "run_id");
ulid_id!(StepId, "step_id");
ulid_id!(GateRequestId, "gate_request_id");
ulid_id!(CheckpointId, "checkpoint_id");
ulid_id!(RevisionId, "revision_id");

/// Identifier of one resource in the target system (a page, a template, a setting).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ResourceRef(pub String);

impl ResourceRef {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque version identifier reported by the target system.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct VersionId(pub String);

impl VersionId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    WaitingGate,
    Succeeded,
    Failed,
    RolledBack,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::RolledBack)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::WaitingGate => "waiting_gate",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    WaitingGate,
}

impl StepStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::WaitingGate => "waiting_gate",
        }
    }
}

/// The closed set of pipeline actions. Each code is dispatched by `match`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepCode {
    PreFlight,
    HealthCheck,
    MappingValidation,
    PlanValidation,
    PreApplyValidation,
    Apply,
    Verify,
}

impl StepCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreFlight => "pre_flight",
            Self::HealthCheck => "health_check",
            Self::MappingValidation => "mapping_validation",
            Self::PlanValidation => "plan_validation",
            Self::PreApplyValidation => "pre_apply_validation",
            Self::Apply => "apply",
            Self::Verify => "verify",
        }
    }

    /// The collaborator validation kind this step runs, if it is a validation step.
    #[must_use]
    pub fn validation_kind(self) -> Option<ValidationKind> {
        match self {
            Self::PreFlight => Some(ValidationKind::PreFlight),
            Self::HealthCheck => Some(ValidationKind::HealthCheck),
            Self::MappingValidation => Some(ValidationKind::Mapping),
            Self::PlanValidation => Some(ValidationKind::Plan),
            Self::PreApplyValidation => Some(ValidationKind::PreApply),
            Self::Apply | Self::Verify => None,
        }
    }
}

impl FromStr for StepCode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pre_flight" => Ok(Self::PreFlight),
            "health_check" => Ok(Self::HealthCheck),
            "mapping_validation" => Ok(Self::MappingValidation),
            "plan_validation" => Ok(Self::PlanValidation),
            "pre_apply_validation" => Ok(Self::PreApplyValidation),
            "apply" => Ok(Self::Apply),
            "verify" => Ok(Self::Verify),
            _ => Err(anyhow!("unknown step code: {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    PreFlight,
    HealthCheck,
    Mapping,
    Plan,
    PreApply,
}

impl ValidationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreFlight => "pre_flight",
            Self::HealthCheck => "health_check",
            Self::Mapping => "mapping",
            Self::Plan => "plan",
            Self::PreApply => "pre_apply",
        }
    }
}

/// How the target should apply writes. Part of the run's immutable configuration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    #[default]
    Draft,
    Publish,
}

impl ApplyMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Publish => "publish",
        }
    }
}

impl FromStr for ApplyMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "draft" => Ok(Self::Draft),
            "publish" => Ok(Self::Publish),
            _ => Err(anyhow!("invalid mode '{value}'; use 'draft' or 'publish'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Approved,
    Rejected,
    TimedOut,
    Cancelled,
}

impl GateDecision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Why a run ended somewhere other than `succeeded`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ValidationFailed,
    InvalidScope,
    CheckpointFailed,
    GateRejected,
    GateTimeout,
    Cancelled,
    ApplyFailed,
    RollbackPartialFailure,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "validation_failed",
            Self::InvalidScope => "invalid_scope",
            Self::CheckpointFailed => "checkpoint_failed",
            Self::GateRejected => "gate_rejected",
            Self::GateTimeout => "gate_timeout",
            Self::Cancelled => "cancelled",
            Self::ApplyFailed => "apply_failed",
            Self::RollbackPartialFailure => "rollback_partial_failure",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventType {
    RunStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepWaitingGate,
    GateRequested,
    GateDecided,
    CheckpointCaptured,
    RevisionRecorded,
    RollbackStarted,
    RollbackFinished,
    VerifyMismatch,
    RunCancelled,
    RunFinished,
}

impl TraceEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::StepWaitingGate => "step_waiting_gate",
            Self::GateRequested => "gate_requested",
            Self::GateDecided => "gate_decided",
            Self::CheckpointCaptured => "checkpoint_captured",
            Self::RevisionRecorded => "revision_recorded",
            Self::RollbackStarted => "rollback_started",
            Self::RollbackFinished => "rollback_finished",
            Self::VerifyMismatch => "verify_mismatch",
            Self::RunCancelled => "run_cancelled",
            Self::RunFinished => "run_finished",
        }
    }
}

/// The fixed set of resources a run may touch and, per resource, the fields it may modify.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Scope {
    pub resources: BTreeMap<ResourceRef, BTreeSet<String>>,
}

impl Scope {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    #[must_use]
    pub fn contains(&self, resource: &ResourceRef) -> bool {
        self.resources.contains_key(resource)
    }

    #[must_use]
    pub fn allowed_fields(&self, resource: &ResourceRef) -> Option<&BTreeSet<String>> {
        self.resources.get(resource)
    }

    #[must_use]
    pub fn resource_refs(&self) -> Vec<ResourceRef> {
        self.resources.keys().cloned().collect()
    }
}

/// One write against one resource: the fields to set and their new values.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PatchOperation {
    pub resource: ResourceRef,
    pub fields: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ChangeSet {
    pub change_set_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub operations: Vec<PatchOperation>,
}

impl ChangeSet {
    /// Every resource the plan writes, in stable order.
    #[must_use]
    pub fn touched_resources(&self) -> Vec<ResourceRef> {
        let touched: BTreeSet<ResourceRef> = self
            .operations
            .iter()
            .map(|operation| operation.resource.clone())
            .collect();
        touched.into_iter().collect()
    }
}

/// A change-set document as submitted: the scope it declares, its mode and the plan itself.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ChangeSetDocument {
    pub scope: Scope,
    #[serde(default)]
    pub mode: ApplyMode,
    pub change_set: ChangeSet,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeSetEnvelope {
    pub source_format: String,
    pub source_hash: String,
    pub normalized_hash: String,
    pub document: ChangeSetDocument,
    pub normalized_json: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Finding {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub resource: Option<ResourceRef>,
}

impl Finding {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            resource: None,
        }
    }

    #[must_use]
    pub fn for_resource(mut self, resource: &ResourceRef) -> Self {
        self.resource = Some(resource.clone());
        self
    }
}

/// Outcome of one validation step. Errors block the run, warnings do not.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValidationReport {
    pub passed: bool,
    #[serde(default)]
    pub errors: Vec<Finding>,
    #[serde(default)]
    pub warnings: Vec<Finding>,
}

impl ValidationReport {
    #[must_use]
    pub fn pass() -> Self {
        Self {
            passed: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_findings(errors: Vec<Finding>, warnings: Vec<Finding>) -> Self {
        Self {
            passed: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Combine two reports; the result passes only when both pass.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.passed = self.passed && other.passed;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.passed = self.passed && self.errors.is_empty();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResourceState {
    pub version_id: VersionId,
    #[serde(with = "time::serde::rfc3339")]
    pub read_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WriteFailure {
    pub resource: Option<ResourceRef>,
    pub message: String,
}

/// Result of one `write_state` call. `written` lists resources that were
/// committed even when `failure` is set (partial success).
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct WriteOutcome {
    pub written: BTreeMap<ResourceRef, VersionId>,
    pub failure: Option<WriteFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CheckpointEntry {
    pub resource: ResourceRef,
    pub version_id: VersionId,
    #[serde(with = "time::serde::rfc3339")]
    pub read_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Checkpoint {
    pub checkpoint_id: CheckpointId,
    pub run_id: RunId,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: DateTimeUtc,
    pub entries: Vec<CheckpointEntry>,
}

impl Checkpoint {
    #[must_use]
    pub fn version_of(&self, resource: &ResourceRef) -> Option<&VersionId> {
        self.entries
            .iter()
            .find(|entry| &entry.resource == resource)
            .map(|entry| &entry.version_id)
    }

    #[must_use]
    pub fn expected_versions(&self) -> BTreeMap<ResourceRef, VersionId> {
        self.entries
            .iter()
            .map(|entry| (entry.resource.clone(), entry.version_id.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Revision {
    pub revision_id: RevisionId,
    pub run_id: RunId,
    pub checkpoint_id: CheckpointId,
    pub resource: ResourceRef,
    pub prior_version: VersionId,
    pub new_version: VersionId,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RestoreOutcome {
    pub resource: ResourceRef,
    pub target_version: VersionId,
    pub attempts: u32,
    pub restored: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RollbackResult {
    pub checkpoint_id: CheckpointId,
    pub resources: Vec<RestoreOutcome>,
}

impl RollbackResult {
    #[must_use]
    pub fn fully_restored(&self) -> bool {
        self.resources.iter().all(|outcome| outcome.restored)
    }

    #[must_use]
    pub fn failed_resources(&self) -> Vec<&ResourceRef> {
        self.resources
            .iter()
            .filter(|outcome| !outcome.restored)
            .map(|outcome| &outcome.resource)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RollbackAttemptRecord {
    pub checkpoint_id: CheckpointId,
    pub resource: ResourceRef,
    pub target_version: VersionId,
    pub attempt: u32,
    pub succeeded: bool,
    pub error_text: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub attempted_at: DateTimeUtc,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceOutcomeKind {
    Untouched,
    Applied,
    NotApplied,
    RolledBack,
    RollbackFailed,
}

/// Final per-resource account attached to a terminal run.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResourceOutcome {
    pub resource: ResourceRef,
    pub outcome: ResourceOutcomeKind,
    pub prior_version: Option<VersionId>,
    pub final_version: Option<VersionId>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub change_set_name: String,
    pub plan_hash: String,
    pub scope: Scope,
    pub mode: ApplyMode,
    pub change_set: ChangeSet,
    pub status: RunStatus,
    pub failure_kind: Option<FailureKind>,
    pub reason: Option<String>,
    pub manual_intervention_required: bool,
    pub warnings: Vec<Finding>,
    pub outcomes: Vec<ResourceOutcome>,
    pub checkpoint_id: Option<CheckpointId>,
    pub gate_timeout_ms: Option<u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<DateTimeUtc>,
    pub external_correlation_id: Option<String>,
    pub requested_by: String,
    pub engine_version: String,
    pub cli_args_json: Value,
    pub manifest_hash: Option<String>,
    /// Resources a failed Apply still has to restore. `Some` from the moment
    /// the failure is recorded until its rollback settles.
    #[serde(default)]
    pub pending_rollback: Option<Vec<ResourceRef>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub step_id: StepId,
    pub run_id: RunId,
    pub step_index: usize,
    pub step_code: StepCode,
    pub status: StepStatus,
    pub requires_gate: bool,
    pub checkpoint_required: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<DateTimeUtc>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<DateTimeUtc>,
    pub input_summary: Value,
    pub output_summary: Option<Value>,
    pub affected_resources: Vec<ResourceRef>,
    pub error_json: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateRequest {
    pub gate_request_id: GateRequestId,
    pub run_id: RunId,
    pub step_id: StepId,
    pub step_index: usize,
    pub step_code: StepCode,
    pub impact_summary: String,
    pub affected_resources: Vec<ResourceRef>,
    pub checkpoint_required: bool,
    pub checkpoint_id: Option<CheckpointId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<DateTimeUtc>,
    pub decision: Option<GateDecision>,
    pub decided_by: Option<String>,
    pub decision_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub decided_at: Option<DateTimeUtc>,
}

impl GateRequest {
    #[must_use]
    pub fn is_expired(&self, now: DateTimeUtc) -> bool {
        self.decision.is_none() && self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateDecisionUpdate {
    pub decision: GateDecision,
    pub decided_by: String,
    pub reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub decided_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TraceEvent {
    pub event_id: Ulid,
    pub run_id: RunId,
    pub step_id: Option<StepId>,
    pub event_type: TraceEventType,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: DateTimeUtc,
    pub actor_type: String,
    pub actor_id: String,
    pub payload_json: Value,
    pub payload_hash: String,
    pub prev_event_hash: Option<String>,
    pub event_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventRow {
    pub event_seq: i64,
    pub event: TraceEvent,
}

/// Everything a caller needs to reconstruct what happened to what.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunStatusReport {
    pub run: RunRecord,
    pub steps: Vec<StepRecord>,
    pub gate_requests: Vec<GateRequest>,
    pub revisions: Vec<Revision>,
}

impl RunStatusReport {
    #[must_use]
    pub fn pending_gate(&self) -> Option<&GateRequest> {
        self.gate_requests
            .iter()
            .find(|request| request.decision.is_none())
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

/// Format a timestamp as RFC 3339.
///
/// # Errors
/// Returns an error if the timestamp cannot be formatted.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 value: {err}"))
}

/// Parse an RFC 3339 timestamp.
///
/// # Errors
/// Returns an error when the input is not RFC 3339.
pub fn parse_rfc3339(value: &str) -> Result<DateTimeUtc> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}
