use std::sync::mpsc;

use anyhow::Result;
use safeguard_domain::{
    format_rfc3339, hash_json, now_utc, DateTimeUtc, EventRow, RunId, StepId, TraceEvent,
    TraceEventType,
};
use safeguard_trace_core::RunStore;
use serde_json::{json, Value};
use ulid::Ulid;

use crate::{Engine, RunSession};

/// Push delivery of trace events. Called after the event is durably stored.
pub trait EventListener {
    fn on_event(&self, event: &EventRow);
}

/// Forwards every event into an `mpsc` channel.
pub struct ChannelEventListener {
    sender: mpsc::Sender<EventRow>,
}

impl ChannelEventListener {
    #[must_use]
    pub fn new() -> (Self, mpsc::Receiver<EventRow>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl EventListener for ChannelEventListener {
    fn on_event(&self, event: &EventRow) {
        if self.sender.send(event.clone()).is_err() {
            tracing::debug!(run_id = %event.event.run_id, "event receiver dropped");
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct EventChain {
    pub(crate) prev_event_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub run_id: RunId,
    pub events: usize,
    pub chain_valid: bool,
    /// First event whose link or recomputed hash does not match.
    pub first_invalid_seq: Option<i64>,
}

pub(crate) struct EventHashInput<'e> {
    pub(crate) event_id: Ulid,
    pub(crate) run_id: RunId,
    pub(crate) step_id: Option<StepId>,
    pub(crate) event_type: TraceEventType,
    pub(crate) occurred_at: DateTimeUtc,
    pub(crate) recorded_at: DateTimeUtc,
    pub(crate) actor_type: &'e str,
    pub(crate) actor_id: &'e str,
    pub(crate) payload_hash: &'e str,
    pub(crate) prev_event_hash: Option<&'e str>,
}

pub(crate) fn compute_event_hash(input: &EventHashInput<'_>) -> Result<String> {
    let material = json!({
        "event_id": input.event_id,
        "run_id": input.run_id,
        "step_id": input.step_id,
        "event_type": input.event_type,
        "occurred_at": format_rfc3339(input.occurred_at)?,
        "recorded_at": format_rfc3339(input.recorded_at)?,
        "actor_type": input.actor_type,
        "actor_id": input.actor_id,
        "payload_hash": input.payload_hash,
        "prev_event_hash": input.prev_event_hash,
    });
    hash_json(&material)
}

impl Engine<'_> {
    pub(crate) fn emit(
        &self,
        session: &mut RunSession,
        step_id: Option<StepId>,
        event_type: TraceEventType,
        payload_json: Value,
    ) -> Result<EventRow> {
        self.emit_as(session, step_id, event_type, "system", "engine", payload_json)
    }

    pub(crate) fn emit_as(
        &self,
        session: &mut RunSession,
        step_id: Option<StepId>,
        event_type: TraceEventType,
        actor_type: &str,
        actor_id: &str,
        payload_json: Value,
    ) -> Result<EventRow> {
        let run_id = session.run.run_id;
        let occurred_at = now_utc();
        let recorded_at = now_utc();
        let payload_hash = hash_json(&payload_json)?;
        let event_id = Ulid::new();

        let event_hash = compute_event_hash(&EventHashInput {
            event_id,
            run_id,
            step_id,
            event_type,
            occurred_at,
            recorded_at,
            actor_type,
            actor_id,
            payload_hash: &payload_hash,
            prev_event_hash: session.chain.prev_event_hash.as_deref(),
        })?;

        let event = TraceEvent {
            event_id,
            run_id,
            step_id,
            event_type,
            occurred_at,
            recorded_at,
            actor_type: actor_type.to_string(),
            actor_id: actor_id.to_string(),
            payload_json,
            payload_hash,
            prev_event_hash: session.chain.prev_event_hash.clone(),
            event_hash: event_hash.clone(),
        };

        let event_seq = self.store.append_event(&event)?;
        session.chain.prev_event_hash = Some(event_hash);

        let row = EventRow { event_seq, event };
        for listener in &self.listeners {
            listener.on_event(&row);
        }
        Ok(row)
    }

    /// Walk the stored events of a run and verify every link and hash.
    ///
    /// # Errors
    /// Returns an error when trace rows cannot be read.
    pub fn replay_audit(&self, run_id: RunId) -> Result<ReplayReport> {
        replay_audit(self.store, run_id)
    }
}

/// Store-only form of [`Engine::replay_audit`], usable without a target.
///
/// # Errors
/// Returns an error when trace rows cannot be read.
pub fn replay_audit(store: &dyn RunStore, run_id: RunId) -> Result<ReplayReport> {
    let events = store.list_events_for_run(run_id)?;
    let mut prev: Option<String> = None;

    for row in &events {
        let event = &row.event;
        let recomputed = compute_event_hash(&EventHashInput {
            event_id: event.event_id,
            run_id: event.run_id,
            step_id: event.step_id,
            event_type: event.event_type,
            occurred_at: event.occurred_at,
            recorded_at: event.recorded_at,
            actor_type: &event.actor_type,
            actor_id: &event.actor_id,
            payload_hash: &event.payload_hash,
            prev_event_hash: event.prev_event_hash.as_deref(),
        })?;
        let payload_ok = hash_json(&event.payload_json)? == event.payload_hash;

        if event.prev_event_hash != prev || recomputed != event.event_hash || !payload_ok {
            return Ok(ReplayReport {
                run_id,
                events: events.len(),
                chain_valid: false,
                first_invalid_seq: Some(row.event_seq),
            });
        }
        prev = Some(event.event_hash.clone());
    }

    Ok(ReplayReport {
        run_id,
        events: events.len(),
        chain_valid: true,
        first_invalid_seq: None,
    })
}
