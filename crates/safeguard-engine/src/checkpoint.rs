use anyhow::Result;
use safeguard_domain::{
    now_utc, Checkpoint, CheckpointEntry, CheckpointId, DateTimeUtc, TraceEventType,
};
use serde_json::json;

use crate::{Engine, RunSession};

pub(crate) enum CheckpointCapture {
    Captured(CheckpointId),
    Rejected(String),
}

impl Engine<'_> {
    /// Snapshot the current version of every touched resource in one read.
    /// A run has at most one checkpoint; a second call returns the first.
    pub(crate) fn capture_checkpoint(
        &self,
        session: &mut RunSession,
        index: usize,
    ) -> Result<CheckpointCapture> {
        if let Some(checkpoint_id) = session.run.checkpoint_id {
            return Ok(CheckpointCapture::Captured(checkpoint_id));
        }

        let run_id = session.run.run_id;
        let resources = session.touched_resources();
        let mut states = match self.target.read_state(&resources) {
            Ok(states) => states,
            Err(err) => {
                return Ok(CheckpointCapture::Rejected(format!(
                    "checkpoint read failed: {err:#}"
                )))
            }
        };

        let mut entries = Vec::with_capacity(resources.len());
        for resource in &resources {
            let Some(state) = states.remove(resource) else {
                return Ok(CheckpointCapture::Rejected(format!(
                    "checkpoint read returned no state for {resource}"
                )));
            };
            entries.push(CheckpointEntry {
                resource: resource.clone(),
                version_id: state.version_id,
                read_at: state.read_at,
            });
        }

        let skew_ms = read_skew_ms(entries.iter().map(|entry| entry.read_at));
        let tolerance = i128::from(self.config.checkpoint.max_read_skew_ms);
        if skew_ms > tolerance {
            tracing::warn!(%run_id, skew_ms = %skew_ms, tolerance = %tolerance, "checkpoint reads too far apart");
            return Ok(CheckpointCapture::Rejected(format!(
                "checkpoint_skew: reads spread over {skew_ms}ms, tolerance is {tolerance}ms"
            )));
        }

        let checkpoint = Checkpoint {
            checkpoint_id: CheckpointId::new(),
            run_id,
            captured_at: now_utc(),
            entries,
        };
        self.store.insert_checkpoint(&checkpoint)?;
        session.run.checkpoint_id = Some(checkpoint.checkpoint_id);
        self.store.update_run(&session.run)?;

        let step_id = session.steps[index].step_id;
        self.emit(
            session,
            Some(step_id),
            TraceEventType::CheckpointCaptured,
            json!({
                "checkpoint_id": checkpoint.checkpoint_id,
                "entries": checkpoint.entries,
                "read_skew_ms": skew_ms,
            }),
        )?;
        tracing::info!(
            %run_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            resources = checkpoint.entries.len(),
            "checkpoint captured"
        );
        Ok(CheckpointCapture::Captured(checkpoint.checkpoint_id))
    }
}

fn read_skew_ms(read_times: impl Iterator<Item = DateTimeUtc>) -> i128 {
    let mut bounds: Option<(DateTimeUtc, DateTimeUtc)> = None;
    for read_at in read_times {
        bounds = Some(match bounds {
            None => (read_at, read_at),
            Some((low, high)) => (low.min(read_at), high.max(read_at)),
        });
    }
    bounds.map_or(0, |(low, high)| (high - low).whole_milliseconds())
}

#[cfg(test)]
mod tests {
    use super::read_skew_ms;
    use time::Duration;

    #[test]
    fn skew_is_spread_between_earliest_and_latest_read() {
        let base = safeguard_domain::now_utc();
        let reads = [
            base + Duration::milliseconds(40),
            base,
            base + Duration::milliseconds(250),
        ];
        assert_eq!(read_skew_ms(reads.into_iter()), 250);
        assert_eq!(read_skew_ms(std::iter::empty()), 0);
    }
}
