//! Stuck detection: reclassify runs stalled on an open `start` event.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::Tracker;
use crate::error::Result;
use crate::model::Event;
use crate::telemetry::metrics;

/// How long a substep may stay open before its run is considered stuck.
pub const DEFAULT_STUCK_THRESHOLD: Duration = Duration::from_millis(300_000);

/// Outcome of one scan.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StuckReport {
    /// Runs newly flipped to `stuck` by this scan.
    pub marked: Vec<String>,
    /// Runs whose update failed. The scan carries on past them.
    pub failures: Vec<StuckFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StuckFailure {
    pub run_id: String,
    pub kind: &'static str,
    pub error: String,
}

impl StuckReport {
    /// Number of runs newly marked stuck.
    pub fn count(&self) -> usize {
        self.marked.len()
    }
}

impl Tracker {
    /// Scan for stalled runs against the current time.
    pub async fn detect_and_mark_stuck(&self, threshold: Duration) -> Result<StuckReport> {
        self.detect_and_mark_stuck_at(Utc::now(), threshold).await
    }

    /// Scan for stalled runs as of `now`.
    ///
    /// Only the candidate query can fail the whole scan. Per-run failures
    /// are collected in the report.
    pub async fn detect_and_mark_stuck_at(
        &self,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Result<StuckReport> {
        let threshold_ms = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
        let cutoff = TimeDelta::try_milliseconds(threshold_ms)
            .and_then(|delta| now.checked_sub_signed(delta))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let candidates = self.store.find_stalled_starts(cutoff).await?;

        // Oldest stalled start per run; a run is marked once per scan.
        let mut order: Vec<String> = Vec::new();
        let mut per_run: HashMap<String, Event> = HashMap::new();
        for event in candidates {
            if !per_run.contains_key(&event.run_id) {
                order.push(event.run_id.clone());
                per_run.insert(event.run_id.clone(), event);
            }
        }

        let mut report = StuckReport::default();
        for run_id in order {
            let Some(stalled) = per_run.get(&run_id) else {
                continue;
            };
            match self.mark_one(stalled, threshold_ms).await {
                Ok(true) => {
                    warn!(
                        run_id = %run_id,
                        phase = %stalled.phase,
                        substep = %stalled.substep,
                        started_at = %stalled.created_at,
                        "run marked stuck"
                    );
                    metrics::runs_marked_stuck().add(1, &[]);
                    metrics::run_state_transitions().add(
                        1,
                        &[KeyValue::new("from", "running"), KeyValue::new("to", "stuck")],
                    );
                    report.marked.push(run_id);
                }
                Ok(false) => {
                    debug!(run_id = %run_id, "stalled run resolved before marking");
                }
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "failed to mark run stuck");
                    metrics::stuck_scan_failures().add(1, &[]);
                    report.failures.push(StuckFailure {
                        run_id,
                        kind: e.kind(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.count() > 0 || !report.failures.is_empty() {
            info!(
                marked = report.count(),
                failed = report.failures.len(),
                "stuck scan finished"
            );
        }
        Ok(report)
    }

    async fn mark_one(&self, stalled: &Event, threshold_ms: i64) -> Result<bool> {
        // A terminal event may have landed since the candidate query.
        let latest = self.store.latest_events(&stalled.run_id).await?;
        if !latest.iter().any(|e| e.id == stalled.id) {
            return Ok(false);
        }

        let message = format!("timed out (>{}s)", threshold_ms / 1000);
        self.store
            .mark_stuck(&stalled.run_id, stalled, &message)
            .await
    }
}
