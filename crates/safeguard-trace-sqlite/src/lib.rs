#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use safeguard_domain::{
    format_rfc3339, now_utc, parse_rfc3339, ApplyMode, Checkpoint, CheckpointEntry, CheckpointId,
    EventRow, FailureKind, GateDecision, GateDecisionUpdate, GateRequest, GateRequestId,
    ResourceRef, Revision, RevisionId, RollbackAttemptRecord, RunId, RunRecord, RunStatus,
    StepCode, StepId, StepRecord, StepStatus, TraceEvent, TraceEventType, VersionId,
};
use safeguard_trace_core::RunStore;
use ulid::Ulid;

const RUN_SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  change_set_name TEXT NOT NULL,
  plan_hash TEXT NOT NULL,
  scope_json TEXT NOT NULL,
  mode TEXT NOT NULL CHECK (mode IN ('draft','publish')),
  change_set_json TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('running','waiting_gate','succeeded','failed','rolled_back')),
  failure_kind TEXT,
  reason TEXT,
  manual_intervention_required INTEGER NOT NULL DEFAULT 0 CHECK (manual_intervention_required IN (0,1)),
  warnings_json TEXT NOT NULL DEFAULT '[]',
  outcomes_json TEXT NOT NULL DEFAULT '[]',
  checkpoint_id TEXT,
  gate_timeout_ms INTEGER,
  started_at TEXT NOT NULL,
  ended_at TEXT,
  external_correlation_id TEXT,
  requested_by TEXT NOT NULL,
  engine_version TEXT NOT NULL,
  cli_args_json TEXT NOT NULL,
  manifest_hash TEXT,
  pending_rollback_json TEXT
);

CREATE TABLE IF NOT EXISTS steps (
  step_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  step_index INTEGER NOT NULL,
  step_code TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending','running','completed','failed','waiting_gate')),
  requires_gate INTEGER NOT NULL CHECK (requires_gate IN (0,1)),
  checkpoint_required INTEGER NOT NULL CHECK (checkpoint_required IN (0,1)),
  started_at TEXT,
  ended_at TEXT,
  input_summary_json TEXT NOT NULL,
  output_summary_json TEXT,
  affected_resources_json TEXT NOT NULL,
  error_json TEXT,
  UNIQUE(run_id, step_index),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS checkpoints (
  checkpoint_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  captured_at TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS checkpoint_entries (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  checkpoint_id TEXT NOT NULL,
  entry_index INTEGER NOT NULL,
  resource TEXT NOT NULL,
  version_id TEXT NOT NULL,
  read_at TEXT NOT NULL,
  UNIQUE(checkpoint_id, resource),
  FOREIGN KEY (checkpoint_id) REFERENCES checkpoints(checkpoint_id)
);

CREATE TABLE IF NOT EXISTS gate_requests (
  gate_request_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  step_id TEXT NOT NULL,
  step_index INTEGER NOT NULL,
  step_code TEXT NOT NULL,
  impact_summary TEXT NOT NULL,
  affected_resources_json TEXT NOT NULL,
  checkpoint_required INTEGER NOT NULL CHECK (checkpoint_required IN (0,1)),
  checkpoint_id TEXT,
  created_at TEXT NOT NULL,
  expires_at TEXT,
  decision TEXT CHECK (decision IS NULL OR decision IN ('approved','rejected','timed_out','cancelled')),
  decided_by TEXT,
  decision_reason TEXT,
  decided_at TEXT,
  FOREIGN KEY (run_id) REFERENCES runs(run_id),
  FOREIGN KEY (step_id) REFERENCES steps(step_id),
  FOREIGN KEY (checkpoint_id) REFERENCES checkpoints(checkpoint_id)
);

CREATE TABLE IF NOT EXISTS revisions (
  revision_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  checkpoint_id TEXT NOT NULL,
  resource TEXT NOT NULL,
  prior_version TEXT NOT NULL,
  new_version TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  UNIQUE(run_id, resource),
  FOREIGN KEY (run_id) REFERENCES runs(run_id),
  FOREIGN KEY (checkpoint_id) REFERENCES checkpoints(checkpoint_id)
);

CREATE TABLE IF NOT EXISTS rollback_attempts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  checkpoint_id TEXT NOT NULL,
  resource TEXT NOT NULL,
  target_version TEXT NOT NULL,
  attempt INTEGER NOT NULL,
  succeeded INTEGER NOT NULL CHECK (succeeded IN (0,1)),
  error_text TEXT,
  attempted_at TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES runs(run_id),
  FOREIGN KEY (checkpoint_id) REFERENCES checkpoints(checkpoint_id)
);

CREATE TABLE IF NOT EXISTS trace_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  run_id TEXT NOT NULL,
  step_id TEXT,
  event_type TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  actor_type TEXT NOT NULL,
  actor_id TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  payload_hash TEXT NOT NULL,
  prev_event_hash TEXT,
  event_hash TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES runs(run_id),
  FOREIGN KEY (step_id) REFERENCES steps(step_id)
);

CREATE INDEX IF NOT EXISTS idx_trace_events_run_seq ON trace_events(run_id, event_seq);
CREATE INDEX IF NOT EXISTS idx_steps_run_index ON steps(run_id, step_index);
CREATE INDEX IF NOT EXISTS idx_gate_requests_run ON gate_requests(run_id, step_index);
CREATE INDEX IF NOT EXISTS idx_revisions_run ON revisions(run_id);
CREATE INDEX IF NOT EXISTS idx_rollback_attempts_run ON rollback_attempts(run_id, id);

CREATE TRIGGER IF NOT EXISTS trg_trace_events_no_update
BEFORE UPDATE ON trace_events
BEGIN
  SELECT RAISE(FAIL, 'trace_events is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_trace_events_no_delete
BEFORE DELETE ON trace_events
BEGIN
  SELECT RAISE(FAIL, 'trace_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_checkpoints_no_update
BEFORE UPDATE ON checkpoints
BEGIN
  SELECT RAISE(FAIL, 'checkpoints is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_checkpoints_no_delete
BEFORE DELETE ON checkpoints
BEGIN
  SELECT RAISE(FAIL, 'checkpoints is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_checkpoint_entries_no_update
BEFORE UPDATE ON checkpoint_entries
BEGIN
  SELECT RAISE(FAIL, 'checkpoint_entries is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_checkpoint_entries_no_delete
BEFORE DELETE ON checkpoint_entries
BEGIN
  SELECT RAISE(FAIL, 'checkpoint_entries is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_revisions_no_update
BEFORE UPDATE ON revisions
BEGIN
  SELECT RAISE(FAIL, 'revisions is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_revisions_no_delete
BEFORE DELETE ON revisions
BEGIN
  SELECT RAISE(FAIL, 'revisions is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_rollback_attempts_no_update
BEFORE UPDATE ON rollback_attempts
BEGIN
  SELECT RAISE(FAIL, 'rollback_attempts is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_rollback_attempts_no_delete
BEFORE DELETE ON rollback_attempts
BEGIN
  SELECT RAISE(FAIL, 'rollback_attempts is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_gate_requests_decide_once
BEFORE UPDATE ON gate_requests
WHEN OLD.decision IS NOT NULL
BEGIN
  SELECT RAISE(FAIL, 'gate_requests decision is write-once');
END;
CREATE TRIGGER IF NOT EXISTS trg_gate_requests_no_delete
BEFORE DELETE ON gate_requests
BEGIN
  SELECT RAISE(FAIL, 'gate_requests is append-only');
END;
";

const RUN_COLUMNS: &str = "run_id, change_set_name, plan_hash, scope_json, mode, change_set_json,
    status, failure_kind, reason, manual_intervention_required, warnings_json, outcomes_json,
    checkpoint_id, gate_timeout_ms, started_at, ended_at, external_correlation_id,
    requested_by, engine_version, cli_args_json, manifest_hash, pending_rollback_json";

const STEP_COLUMNS: &str = "step_id, run_id, step_index, step_code, status, requires_gate,
    checkpoint_required, started_at, ended_at, input_summary_json, output_summary_json,
    affected_resources_json, error_json";

const GATE_COLUMNS: &str = "gate_request_id, run_id, step_id, step_index, step_code,
    impact_summary, affected_resources_json, checkpoint_required, checkpoint_id, created_at,
    expires_at, decision, decided_by, decision_reason, decided_at";

pub struct SqliteRunStore {
    conn: Connection,
}

impl SqliteRunStore {
    /// Open or create a `SQLite` run database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }
}

impl RunStore for SqliteRunStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .context("failed to apply run schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![RUN_SCHEMA_VERSION, format_rfc3339(now_utc())?],
            )
            .context("failed to record run schema migration")?;

        Ok(())
    }

    fn insert_run(&self, run: &RunRecord) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO runs({RUN_COLUMNS}) VALUES (
                        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                        ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22
                    )"
                ),
                params![
                    run.run_id.to_string(),
                    run.change_set_name,
                    run.plan_hash,
                    serde_json::to_string(&run.scope)?,
                    run.mode.as_str(),
                    serde_json::to_string(&run.change_set)?,
                    run.status.as_str(),
                    run.failure_kind.map(FailureKind::as_str),
                    run.reason,
                    i64::from(run.manual_intervention_required),
                    serde_json::to_string(&run.warnings)?,
                    serde_json::to_string(&run.outcomes)?,
                    run.checkpoint_id.map(|id| id.to_string()),
                    run.gate_timeout_ms.map(i64::try_from).transpose()?,
                    format_rfc3339(run.started_at)?,
                    run.ended_at.map(format_rfc3339).transpose()?,
                    run.external_correlation_id,
                    run.requested_by,
                    run.engine_version,
                    serde_json::to_string(&run.cli_args_json)?,
                    run.manifest_hash,
                    pending_rollback_json(run)?,
                ],
            )
            .context("failed to insert run")?;
        Ok(())
    }

    fn update_run(&self, run: &RunRecord) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET
                    status = ?2,
                    failure_kind = ?3,
                    reason = ?4,
                    manual_intervention_required = ?5,
                    warnings_json = ?6,
                    outcomes_json = ?7,
                    checkpoint_id = ?8,
                    ended_at = ?9,
                    manifest_hash = ?10,
                    pending_rollback_json = ?11
                 WHERE run_id = ?1",
                params![
                    run.run_id.to_string(),
                    run.status.as_str(),
                    run.failure_kind.map(FailureKind::as_str),
                    run.reason,
                    i64::from(run.manual_intervention_required),
                    serde_json::to_string(&run.warnings)?,
                    serde_json::to_string(&run.outcomes)?,
                    run.checkpoint_id.map(|id| id.to_string()),
                    run.ended_at.map(format_rfc3339).transpose()?,
                    run.manifest_hash,
                    pending_rollback_json(run)?,
                ],
            )
            .context("failed to update run")?;
        if changed == 0 {
            return Err(anyhow!("run {} does not exist", run.run_id));
        }
        Ok(())
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"))?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let run = rows.next()?.map(run_from_row).transpose()?;
        Ok(run)
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY started_at DESC, run_id ASC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(run_from_row(row)?);
        }
        Ok(out)
    }

    fn insert_step(&self, step: &StepRecord) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO steps({STEP_COLUMNS}) VALUES (
                        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13
                    )"
                ),
                params![
                    step.step_id.to_string(),
                    step.run_id.to_string(),
                    i64::try_from(step.step_index)
                        .map_err(|_| anyhow!("step_index too large for sqlite"))?,
                    step.step_code.as_str(),
                    step.status.as_str(),
                    i64::from(step.requires_gate),
                    i64::from(step.checkpoint_required),
                    step.started_at.map(format_rfc3339).transpose()?,
                    step.ended_at.map(format_rfc3339).transpose()?,
                    serde_json::to_string(&step.input_summary)?,
                    step.output_summary
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    serde_json::to_string(&step.affected_resources)?,
                    step.error_json
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                ],
            )
            .context("failed to insert step")?;
        Ok(())
    }

    fn update_step(&self, step: &StepRecord) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE steps SET
                    status = ?2,
                    started_at = ?3,
                    ended_at = ?4,
                    output_summary_json = ?5,
                    affected_resources_json = ?6,
                    error_json = ?7
                 WHERE step_id = ?1",
                params![
                    step.step_id.to_string(),
                    step.status.as_str(),
                    step.started_at.map(format_rfc3339).transpose()?,
                    step.ended_at.map(format_rfc3339).transpose()?,
                    step.output_summary
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    serde_json::to_string(&step.affected_resources)?,
                    step.error_json
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                ],
            )
            .context("failed to update step")?;
        if changed == 0 {
            return Err(anyhow!("step {} does not exist", step.step_id));
        }
        Ok(())
    }

    fn get_step_records(&self, run_id: RunId) -> Result<Vec<StepRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 ORDER BY step_index ASC"
        ))?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(step_from_row(row)?);
        }
        Ok(out)
    }

    fn insert_gate_request(&self, request: &GateRequest) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO gate_requests({GATE_COLUMNS}) VALUES (
                        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15
                    )"
                ),
                params![
                    request.gate_request_id.to_string(),
                    request.run_id.to_string(),
                    request.step_id.to_string(),
                    i64::try_from(request.step_index)
                        .map_err(|_| anyhow!("step_index too large for sqlite"))?,
                    request.step_code.as_str(),
                    request.impact_summary,
                    serde_json::to_string(&request.affected_resources)?,
                    i64::from(request.checkpoint_required),
                    request.checkpoint_id.map(|id| id.to_string()),
                    format_rfc3339(request.created_at)?,
                    request.expires_at.map(format_rfc3339).transpose()?,
                    request.decision.map(GateDecision::as_str),
                    request.decided_by,
                    request.decision_reason,
                    request.decided_at.map(format_rfc3339).transpose()?,
                ],
            )
            .context("failed to insert gate request")?;
        Ok(())
    }

    fn decide_gate_request(
        &self,
        gate_request_id: GateRequestId,
        update: &GateDecisionUpdate,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE gate_requests SET
                    decision = ?2,
                    decided_by = ?3,
                    decision_reason = ?4,
                    decided_at = ?5
                 WHERE gate_request_id = ?1 AND decision IS NULL",
                params![
                    gate_request_id.to_string(),
                    update.decision.as_str(),
                    update.decided_by,
                    update.reason,
                    format_rfc3339(update.decided_at)?,
                ],
            )
            .context("failed to record gate decision")?;
        Ok(changed == 1)
    }

    fn list_gate_requests(&self, run_id: RunId) -> Result<Vec<GateRequest>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {GATE_COLUMNS} FROM gate_requests
             WHERE run_id = ?1
             ORDER BY step_index ASC, created_at ASC"
        ))?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(gate_request_from_row(row)?);
        }
        Ok(out)
    }

    fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO checkpoints(checkpoint_id, run_id, captured_at) VALUES (?1, ?2, ?3)",
            params![
                checkpoint.checkpoint_id.to_string(),
                checkpoint.run_id.to_string(),
                format_rfc3339(checkpoint.captured_at)?,
            ],
        )
        .context("failed to insert checkpoint")?;

        for (index, entry) in checkpoint.entries.iter().enumerate() {
            tx.execute(
                "INSERT INTO checkpoint_entries(
                    checkpoint_id, entry_index, resource, version_id, read_at
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    checkpoint.checkpoint_id.to_string(),
                    i64::try_from(index).map_err(|_| anyhow!("entry_index overflow"))?,
                    entry.resource.as_str(),
                    entry.version_id.as_str(),
                    format_rfc3339(entry.read_at)?,
                ],
            )
            .context("failed to insert checkpoint entry")?;
        }

        tx.commit().context("failed to commit checkpoint")?;
        Ok(())
    }

    fn get_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<Option<Checkpoint>> {
        let header = self
            .conn
            .query_row(
                "SELECT run_id, captured_at FROM checkpoints WHERE checkpoint_id = ?1",
                params![checkpoint_id.to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        let Some((run_id_raw, captured_at_raw)) = header else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT resource, version_id, read_at
             FROM checkpoint_entries
             WHERE checkpoint_id = ?1
             ORDER BY entry_index ASC",
        )?;
        let mut rows = stmt.query(params![checkpoint_id.to_string()])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(CheckpointEntry {
                resource: ResourceRef::new(row.get::<_, String>(0)?),
                version_id: VersionId::new(row.get::<_, String>(1)?),
                read_at: parse_rfc3339(&row.get::<_, String>(2)?)?,
            });
        }

        Ok(Some(Checkpoint {
            checkpoint_id,
            run_id: RunId::from_str(&run_id_raw)?,
            captured_at: parse_rfc3339(&captured_at_raw)?,
            entries,
        }))
    }

    fn insert_revision(&self, revision: &Revision) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO revisions(
                    revision_id, run_id, checkpoint_id, resource,
                    prior_version, new_version, recorded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    revision.revision_id.to_string(),
                    revision.run_id.to_string(),
                    revision.checkpoint_id.to_string(),
                    revision.resource.as_str(),
                    revision.prior_version.as_str(),
                    revision.new_version.as_str(),
                    format_rfc3339(revision.recorded_at)?,
                ],
            )
            .context("failed to insert revision")?;
        Ok(())
    }

    fn list_revisions(&self, run_id: RunId) -> Result<Vec<Revision>> {
        let mut stmt = self.conn.prepare(
            "SELECT revision_id, run_id, checkpoint_id, resource,
                    prior_version, new_version, recorded_at
             FROM revisions
             WHERE run_id = ?1
             ORDER BY resource ASC",
        )?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Revision {
                revision_id: RevisionId::from_str(&row.get::<_, String>(0)?)?,
                run_id: RunId::from_str(&row.get::<_, String>(1)?)?,
                checkpoint_id: CheckpointId::from_str(&row.get::<_, String>(2)?)?,
                resource: ResourceRef::new(row.get::<_, String>(3)?),
                prior_version: VersionId::new(row.get::<_, String>(4)?),
                new_version: VersionId::new(row.get::<_, String>(5)?),
                recorded_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
            });
        }
        Ok(out)
    }

    fn append_rollback_attempt(
        &self,
        run_id: RunId,
        attempt: &RollbackAttemptRecord,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO rollback_attempts(
                    run_id, checkpoint_id, resource, target_version,
                    attempt, succeeded, error_text, attempted_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    run_id.to_string(),
                    attempt.checkpoint_id.to_string(),
                    attempt.resource.as_str(),
                    attempt.target_version.as_str(),
                    i64::from(attempt.attempt),
                    i64::from(attempt.succeeded),
                    attempt.error_text,
                    format_rfc3339(attempt.attempted_at)?,
                ],
            )
            .context("failed to append rollback attempt")?;
        Ok(())
    }

    fn list_rollback_attempts(&self, run_id: RunId) -> Result<Vec<RollbackAttemptRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT checkpoint_id, resource, target_version, attempt,
                    succeeded, error_text, attempted_at
             FROM rollback_attempts
             WHERE run_id = ?1
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let attempt: i64 = row.get(3)?;
            out.push(RollbackAttemptRecord {
                checkpoint_id: CheckpointId::from_str(&row.get::<_, String>(0)?)?,
                resource: ResourceRef::new(row.get::<_, String>(1)?),
                target_version: VersionId::new(row.get::<_, String>(2)?),
                attempt: u32::try_from(attempt)
                    .map_err(|_| anyhow!("invalid rollback attempt number: {attempt}"))?,
                succeeded: sql_to_bool(row.get(4)?),
                error_text: row.get(5)?,
                attempted_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
            });
        }
        Ok(out)
    }

    fn append_event(&self, event: &TraceEvent) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO trace_events(
                    event_id, run_id, step_id, event_type,
                    occurred_at, recorded_at, actor_type, actor_id,
                    payload_json, payload_hash, prev_event_hash, event_hash
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    event.event_id.to_string(),
                    event.run_id.to_string(),
                    event.step_id.map(|id| id.to_string()),
                    event.event_type.as_str(),
                    format_rfc3339(event.occurred_at)?,
                    format_rfc3339(event.recorded_at)?,
                    event.actor_type,
                    event.actor_id,
                    serde_json::to_string(&event.payload_json)?,
                    event.payload_hash,
                    event.prev_event_hash,
                    event.event_hash,
                ],
            )
            .context("failed to append trace event")?;

        Ok(self.conn.last_insert_rowid())
    }

    fn list_events_for_run(&self, run_id: RunId) -> Result<Vec<EventRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                event_seq, event_id, run_id, step_id, event_type,
                occurred_at, recorded_at, actor_type, actor_id,
                payload_json, payload_hash, prev_event_hash, event_hash
             FROM trace_events
             WHERE run_id = ?1
             ORDER BY event_seq ASC",
        )?;

        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();

        while let Some(row) = rows.next()? {
            let event_id_raw: String = row.get(1)?;
            let step_id_raw: Option<String> = row.get(3)?;
            let payload_raw: String = row.get(9)?;
            out.push(EventRow {
                event_seq: row.get(0)?,
                event: TraceEvent {
                    event_id: Ulid::from_str(&event_id_raw)
                        .map_err(|err| anyhow!("invalid event_id ULID: {err}"))?,
                    run_id: RunId::from_str(&row.get::<_, String>(2)?)?,
                    step_id: step_id_raw
                        .map(|value| StepId::from_str(&value))
                        .transpose()?,
                    event_type: parse_event_type(&row.get::<_, String>(4)?)?,
                    occurred_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
                    recorded_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
                    actor_type: row.get(7)?,
                    actor_id: row.get(8)?,
                    payload_json: serde_json::from_str(&payload_raw)
                        .context("invalid payload_json")?,
                    payload_hash: row.get(10)?,
                    prev_event_hash: row.get(11)?,
                    event_hash: row.get(12)?,
                },
            });
        }

        Ok(out)
    }

    fn last_event_hash(&self, run_id: RunId) -> Result<Option<String>> {
        let hash = self
            .conn
            .query_row(
                "SELECT event_hash FROM trace_events
                 WHERE run_id = ?1
                 ORDER BY event_seq DESC
                 LIMIT 1",
                params![run_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(hash)
    }
}

fn run_from_row(row: &Row<'_>) -> Result<RunRecord> {
    let scope_json: String = row.get(3)?;
    let change_set_json: String = row.get(5)?;
    let warnings_json: String = row.get(10)?;
    let outcomes_json: String = row.get(11)?;
    let gate_timeout_ms: Option<i64> = row.get(13)?;
    let cli_args_json: String = row.get(19)?;
    let pending_rollback_json: Option<String> = row.get(21)?;

    Ok(RunRecord {
        run_id: RunId::from_str(&row.get::<_, String>(0)?)?,
        change_set_name: row.get(1)?,
        plan_hash: row.get(2)?,
        scope: serde_json::from_str(&scope_json).context("invalid scope_json")?,
        mode: ApplyMode::from_str(&row.get::<_, String>(4)?)?,
        change_set: serde_json::from_str(&change_set_json).context("invalid change_set_json")?,
        status: parse_run_status(&row.get::<_, String>(6)?)?,
        failure_kind: row
            .get::<_, Option<String>>(7)?
            .map(|value| parse_failure_kind(&value))
            .transpose()?,
        reason: row.get(8)?,
        manual_intervention_required: sql_to_bool(row.get(9)?),
        warnings: serde_json::from_str(&warnings_json).context("invalid warnings_json")?,
        outcomes: serde_json::from_str(&outcomes_json).context("invalid outcomes_json")?,
        checkpoint_id: row
            .get::<_, Option<String>>(12)?
            .map(|value| CheckpointId::from_str(&value))
            .transpose()?,
        gate_timeout_ms: gate_timeout_ms
            .map(u64::try_from)
            .transpose()
            .map_err(|_| anyhow!("invalid gate_timeout_ms"))?,
        started_at: parse_rfc3339(&row.get::<_, String>(14)?)?,
        ended_at: row
            .get::<_, Option<String>>(15)?
            .map(|value| parse_rfc3339(&value))
            .transpose()?,
        external_correlation_id: row.get(16)?,
        requested_by: row.get(17)?,
        engine_version: row.get(18)?,
        cli_args_json: serde_json::from_str(&cli_args_json).context("invalid cli_args_json")?,
        manifest_hash: row.get(20)?,
        pending_rollback: pending_rollback_json
            .map(|value| serde_json::from_str(&value).context("invalid pending_rollback_json"))
            .transpose()?,
    })
}

fn pending_rollback_json(run: &RunRecord) -> Result<Option<String>> {
    Ok(run
        .pending_rollback
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?)
}

fn step_from_row(row: &Row<'_>) -> Result<StepRecord> {
    let step_index: i64 = row.get(2)?;
    let input_summary_json: String = row.get(9)?;
    let output_summary_json: Option<String> = row.get(10)?;
    let affected_resources_json: String = row.get(11)?;
    let error_json: Option<String> = row.get(12)?;

    Ok(StepRecord {
        step_id: StepId::from_str(&row.get::<_, String>(0)?)?,
        run_id: RunId::from_str(&row.get::<_, String>(1)?)?,
        step_index: usize::try_from(step_index)
            .map_err(|_| anyhow!("invalid step_index: {step_index}"))?,
        step_code: StepCode::from_str(&row.get::<_, String>(3)?)?,
        status: parse_step_status(&row.get::<_, String>(4)?)?,
        requires_gate: sql_to_bool(row.get(5)?),
        checkpoint_required: sql_to_bool(row.get(6)?),
        started_at: row
            .get::<_, Option<String>>(7)?
            .map(|value| parse_rfc3339(&value))
            .transpose()?,
        ended_at: row
            .get::<_, Option<String>>(8)?
            .map(|value| parse_rfc3339(&value))
            .transpose()?,
        input_summary: serde_json::from_str(&input_summary_json)
            .context("invalid input_summary_json")?,
        output_summary: output_summary_json
            .map(|value| serde_json::from_str(&value).context("invalid output_summary_json"))
            .transpose()?,
        affected_resources: serde_json::from_str(&affected_resources_json)
            .context("invalid affected_resources_json")?,
        error_json: error_json
            .map(|value| serde_json::from_str(&value).context("invalid error_json"))
            .transpose()?,
    })
}

fn gate_request_from_row(row: &Row<'_>) -> Result<GateRequest> {
    let step_index: i64 = row.get(3)?;
    let affected_resources_json: String = row.get(6)?;

    Ok(GateRequest {
        gate_request_id: GateRequestId::from_str(&row.get::<_, String>(0)?)?,
        run_id: RunId::from_str(&row.get::<_, String>(1)?)?,
        step_id: StepId::from_str(&row.get::<_, String>(2)?)?,
        step_index: usize::try_from(step_index)
            .map_err(|_| anyhow!("invalid step_index: {step_index}"))?,
        step_code: StepCode::from_str(&row.get::<_, String>(4)?)?,
        impact_summary: row.get(5)?,
        affected_resources: serde_json::from_str(&affected_resources_json)
            .context("invalid affected_resources_json")?,
        checkpoint_required: sql_to_bool(row.get(7)?),
        checkpoint_id: row
            .get::<_, Option<String>>(8)?
            .map(|value| CheckpointId::from_str(&value))
            .transpose()?,
        created_at: parse_rfc3339(&row.get::<_, String>(9)?)?,
        expires_at: row
            .get::<_, Option<String>>(10)?
            .map(|value| parse_rfc3339(&value))
            .transpose()?,
        decision: row
            .get::<_, Option<String>>(11)?
            .map(|value| parse_gate_decision(&value))
            .transpose()?,
        decided_by: row.get(12)?,
        decision_reason: row.get(13)?,
        decided_at: row
            .get::<_, Option<String>>(14)?
            .map(|value| parse_rfc3339(&value))
            .transpose()?,
    })
}

fn parse_run_status(value: &str) -> Result<RunStatus> {
    match value {
        "running" => Ok(RunStatus::Running),
        "waiting_gate" => Ok(RunStatus::WaitingGate),
        "succeeded" => Ok(RunStatus::Succeeded),
        "failed" => Ok(RunStatus::Failed),
        "rolled_back" => Ok(RunStatus::RolledBack),
        _ => Err(anyhow!("unknown run status: {value}")),
    }
}

fn parse_step_status(value: &str) -> Result<StepStatus> {
    match value {
        "pending" => Ok(StepStatus::Pending),
        "running" => Ok(StepStatus::Running),
        "completed" => Ok(StepStatus::Completed),
        "failed" => Ok(StepStatus::Failed),
        "waiting_gate" => Ok(StepStatus::WaitingGate),
        _ => Err(anyhow!("unknown step status: {value}")),
    }
}

fn parse_failure_kind(value: &str) -> Result<FailureKind> {
    match value {
        "validation_failed" => Ok(FailureKind::ValidationFailed),
        "invalid_scope" => Ok(FailureKind::InvalidScope),
        "checkpoint_failed" => Ok(FailureKind::CheckpointFailed),
        "gate_rejected" => Ok(FailureKind::GateRejected),
        "gate_timeout" => Ok(FailureKind::GateTimeout),
        "cancelled" => Ok(FailureKind::Cancelled),
        "apply_failed" => Ok(FailureKind::ApplyFailed),
        "rollback_partial_failure" => Ok(FailureKind::RollbackPartialFailure),
        _ => Err(anyhow!("unknown failure kind: {value}")),
    }
}

fn parse_gate_decision(value: &str) -> Result<GateDecision> {
    match value {
        "approved" => Ok(GateDecision::Approved),
        "rejected" => Ok(GateDecision::Rejected),
        "timed_out" => Ok(GateDecision::TimedOut),
        "cancelled" => Ok(GateDecision::Cancelled),
        _ => Err(anyhow!("unknown gate decision: {value}")),
    }
}

fn parse_event_type(value: &str) -> Result<TraceEventType> {
    match value {
        "run_started" => Ok(TraceEventType::RunStarted),
        "step_started" => Ok(TraceEventType::StepStarted),
        "step_completed" => Ok(TraceEventType::StepCompleted),
        "step_failed" => Ok(TraceEventType::StepFailed),
        "step_waiting_gate" => Ok(TraceEventType::StepWaitingGate),
        "gate_requested" => Ok(TraceEventType::GateRequested),
        "gate_decided" => Ok(TraceEventType::GateDecided),
        "checkpoint_captured" => Ok(TraceEventType::CheckpointCaptured),
        "revision_recorded" => Ok(TraceEventType::RevisionRecorded),
        "rollback_started" => Ok(TraceEventType::RollbackStarted),
        "rollback_finished" => Ok(TraceEventType::RollbackFinished),
        "verify_mismatch" => Ok(TraceEventType::VerifyMismatch),
        "run_cancelled" => Ok(TraceEventType::RunCancelled),
        "run_finished" => Ok(TraceEventType::RunFinished),
        _ => Err(anyhow!("unknown event_type: {value}")),
    }
}

fn sql_to_bool(value: i64) -> bool {
    value != 0
}

#[cfg(test)]
mod tests {
    use super::SqliteRunStore;
    use safeguard_domain::{
        ApplyMode, ChangeSet, Checkpoint, CheckpointEntry, CheckpointId, FailureKind,
        GateDecision, GateDecisionUpdate, GateRequest, GateRequestId, ResourceRef, Revision,
        RevisionId, RollbackAttemptRecord, RunId, RunRecord, RunStatus, Scope, StepCode, StepId,
        StepRecord, StepStatus, TraceEvent, TraceEventType, VersionId,
    };
    use safeguard_trace_core::RunStore;
    use serde_json::json;
    use ulid::Ulid;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "safeguard-trace-sqlite-test-{}-{}.sqlite",
            name,
            Ulid::new()
        ))
    }

    fn open_store(name: &str) -> SqliteRunStore {
        let store = SqliteRunStore::open(&temp_db_path(name));
        assert!(store.is_ok());
        let store = store.unwrap_or_else(|_| unreachable!());
        assert!(store.migrate().is_ok());
        store
    }

    fn fixture_run(run_id: RunId) -> RunRecord {
        RunRecord {
            run_id,
            change_set_name: "cs".to_string(),
            plan_hash: "hash".to_string(),
            scope: Scope::default(),
            mode: ApplyMode::Draft,
            change_set: ChangeSet {
                change_set_name: "cs".to_string(),
                description: None,
                operations: Vec::new(),
            },
            status: RunStatus::Running,
            failure_kind: None,
            reason: None,
            manual_intervention_required: false,
            warnings: Vec::new(),
            outcomes: Vec::new(),
            checkpoint_id: None,
            gate_timeout_ms: Some(60_000),
            started_at: time::OffsetDateTime::now_utc(),
            ended_at: None,
            external_correlation_id: None,
            requested_by: "tester".to_string(),
            engine_version: "test".to_string(),
            cli_args_json: json!({}),
            manifest_hash: None,
            pending_rollback: None,
        }
    }

    fn fixture_step(run_id: RunId, step_id: StepId) -> StepRecord {
        StepRecord {
            step_id,
            run_id,
            step_index: 3,
            step_code: StepCode::PlanValidation,
            status: StepStatus::Running,
            requires_gate: true,
            checkpoint_required: false,
            started_at: Some(time::OffsetDateTime::now_utc()),
            ended_at: None,
            input_summary: json!({"operations": 1}),
            output_summary: None,
            affected_resources: vec![ResourceRef::new("R1")],
            error_json: None,
        }
    }

    fn fixture_gate(run_id: RunId, step_id: StepId) -> GateRequest {
        GateRequest {
            gate_request_id: GateRequestId::new(),
            run_id,
            step_id,
            step_index: 3,
            step_code: StepCode::PlanValidation,
            impact_summary: "1 resource".to_string(),
            affected_resources: vec![ResourceRef::new("R1")],
            checkpoint_required: false,
            checkpoint_id: None,
            created_at: time::OffsetDateTime::now_utc(),
            expires_at: None,
            decision: None,
            decided_by: None,
            decision_reason: None,
            decided_at: None,
        }
    }

    fn fixture_checkpoint(run_id: RunId) -> Checkpoint {
        let now = time::OffsetDateTime::now_utc();
        Checkpoint {
            checkpoint_id: CheckpointId::new(),
            run_id,
            captured_at: now,
            entries: vec![
                CheckpointEntry {
                    resource: ResourceRef::new("R2"),
                    version_id: VersionId::new("v4"),
                    read_at: now,
                },
                CheckpointEntry {
                    resource: ResourceRef::new("R1"),
                    version_id: VersionId::new("v1"),
                    read_at: now,
                },
            ],
        }
    }

    fn fixture_event(run_id: RunId, prev: Option<String>, hash: &str) -> TraceEvent {
        let now = time::OffsetDateTime::now_utc();
        TraceEvent {
            event_id: Ulid::new(),
            run_id,
            step_id: None,
            event_type: TraceEventType::RunStarted,
            occurred_at: now,
            recorded_at: now,
            actor_type: "system".to_string(),
            actor_id: "test".to_string(),
            payload_json: json!({"k": "v"}),
            payload_hash: "payload".to_string(),
            prev_event_hash: prev,
            event_hash: hash.to_string(),
        }
    }

    #[test]
    fn migrate_is_idempotent_and_records_schema_version() {
        let store = open_store("migrate");
        assert!(store.migrate().is_ok());

        let versions: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(versions, 1);
    }

    #[test]
    fn run_updates_round_trip() {
        let store = open_store("run-round-trip");
        let run_id = RunId::new();
        let mut run = fixture_run(run_id);
        assert!(store.insert_run(&run).is_ok());

        run.status = RunStatus::Failed;
        run.failure_kind = Some(FailureKind::RollbackPartialFailure);
        run.reason = Some("restore failed".to_string());
        run.manual_intervention_required = true;
        run.ended_at = Some(time::OffsetDateTime::now_utc());
        run.pending_rollback = Some(vec![ResourceRef::new("R1")]);
        assert!(store.update_run(&run).is_ok());

        let loaded = store.get_run(run_id);
        assert!(loaded.is_ok());
        let loaded = loaded
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(
            loaded.failure_kind,
            Some(FailureKind::RollbackPartialFailure)
        );
        assert!(loaded.manual_intervention_required);
        assert_eq!(loaded.gate_timeout_ms, Some(60_000));
        assert!(loaded.ended_at.is_some());
        assert_eq!(loaded.pending_rollback, Some(vec![ResourceRef::new("R1")]));

        run.pending_rollback = Some(Vec::new());
        assert!(store.update_run(&run).is_ok());
        let reloaded = store
            .get_run(run_id)
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(reloaded.pending_rollback, Some(Vec::new()));

        let missing = store.get_run(RunId::new());
        assert!(matches!(missing, Ok(None)));
    }

    #[test]
    fn trace_events_are_append_only_and_chain_head_is_tracked() {
        let store = open_store("append-only");
        let run_id = RunId::new();
        assert!(store.insert_run(&fixture_run(run_id)).is_ok());

        assert!(matches!(store.last_event_hash(run_id), Ok(None)));
        assert!(store
            .append_event(&fixture_event(run_id, None, "h1"))
            .is_ok());
        assert!(store
            .append_event(&fixture_event(run_id, Some("h1".to_string()), "h2"))
            .is_ok());

        let head = store.last_event_hash(run_id);
        assert_eq!(head.unwrap_or_else(|_| unreachable!()), Some("h2".to_string()));

        let mutated = store.conn.execute(
            "UPDATE trace_events SET actor_id = 'mutated' WHERE event_seq = 1",
            [],
        );
        assert!(mutated.is_err());
        let deleted = store.conn.execute("DELETE FROM trace_events", []);
        assert!(deleted.is_err());
    }

    #[test]
    fn gate_request_is_decided_exactly_once() {
        let store = open_store("gate-once");
        let run_id = RunId::new();
        let step_id = StepId::new();
        assert!(store.insert_run(&fixture_run(run_id)).is_ok());
        assert!(store.insert_step(&fixture_step(run_id, step_id)).is_ok());
        let gate = fixture_gate(run_id, step_id);
        assert!(store.insert_gate_request(&gate).is_ok());

        let approve = GateDecisionUpdate {
            decision: GateDecision::Approved,
            decided_by: "alice".to_string(),
            reason: None,
            decided_at: time::OffsetDateTime::now_utc(),
        };
        let reject = GateDecisionUpdate {
            decision: GateDecision::Rejected,
            decided_by: "bob".to_string(),
            reason: Some("late".to_string()),
            decided_at: time::OffsetDateTime::now_utc(),
        };
        let first = store.decide_gate_request(gate.gate_request_id, &approve);
        assert!(matches!(first, Ok(true)));
        let second = store.decide_gate_request(gate.gate_request_id, &reject);
        assert!(matches!(second, Ok(false)));

        let gates = store
            .list_gate_requests(run_id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(gates.len(), 1);
        assert_eq!(gates[0].decision, Some(GateDecision::Approved));
        assert_eq!(gates[0].decided_by.as_deref(), Some("alice"));

        let forced = store.conn.execute(
            "UPDATE gate_requests SET decision = 'rejected'",
            [],
        );
        assert!(forced.is_err());
    }

    #[test]
    fn checkpoint_entries_keep_capture_order_and_are_immutable() {
        let store = open_store("checkpoint");
        let run_id = RunId::new();
        assert!(store.insert_run(&fixture_run(run_id)).is_ok());
        let checkpoint = fixture_checkpoint(run_id);
        assert!(store.insert_checkpoint(&checkpoint).is_ok());

        let loaded = store.get_checkpoint(checkpoint.checkpoint_id);
        assert!(loaded.is_ok());
        let loaded = loaded
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.entries[0].resource, ResourceRef::new("R2"));
        assert_eq!(
            loaded.version_of(&ResourceRef::new("R1")),
            Some(&VersionId::new("v1"))
        );

        let mutated = store.conn.execute(
            "UPDATE checkpoint_entries SET version_id = 'v9'",
            [],
        );
        assert!(mutated.is_err());
        assert!(matches!(
            store.get_checkpoint(CheckpointId::new()),
            Ok(None)
        ));
    }

    #[test]
    fn revisions_and_rollback_attempts_are_listed_per_run() {
        let store = open_store("revisions");
        let run_id = RunId::new();
        assert!(store.insert_run(&fixture_run(run_id)).is_ok());
        let checkpoint = fixture_checkpoint(run_id);
        assert!(store.insert_checkpoint(&checkpoint).is_ok());

        let revision = Revision {
            revision_id: RevisionId::new(),
            run_id,
            checkpoint_id: checkpoint.checkpoint_id,
            resource: ResourceRef::new("R1"),
            prior_version: VersionId::new("v1"),
            new_version: VersionId::new("v2"),
            recorded_at: time::OffsetDateTime::now_utc(),
        };
        assert!(store.insert_revision(&revision).is_ok());
        let duplicate = Revision {
            revision_id: RevisionId::new(),
            ..revision.clone()
        };
        assert!(store.insert_revision(&duplicate).is_err());

        for attempt in 1..=2 {
            let record = RollbackAttemptRecord {
                checkpoint_id: checkpoint.checkpoint_id,
                resource: ResourceRef::new("R1"),
                target_version: VersionId::new("v1"),
                attempt,
                succeeded: attempt == 2,
                error_text: (attempt == 1).then(|| "timeout".to_string()),
                attempted_at: time::OffsetDateTime::now_utc(),
            };
            assert!(store.append_rollback_attempt(run_id, &record).is_ok());
        }

        let revisions = store.list_revisions(run_id).unwrap_or_else(|_| unreachable!());
        assert_eq!(revisions, vec![revision]);
        let attempts = store
            .list_rollback_attempts(run_id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(attempts.len(), 2);
        assert!(!attempts[0].succeeded);
        assert!(attempts[1].succeeded);
    }
}
