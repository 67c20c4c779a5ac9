//! Run lifecycle: create, ingest events, administrative update, delete.

use std::time::Instant;

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{Instrument, debug, info};

use super::Tracker;
use crate::error::{Error, Result};
use crate::model::{
    Event, EventStatus, NewEvent, NewRun, Page, Run, RunFilter, RunList, RunStatus, RunUpdate,
};
use crate::telemetry::metrics;
use crate::telemetry::run::{record_state_transition, start_event_span};

/// Run status after ingesting an event, or `None` if it stays put.
///
/// `completes` is whether the event's pair is the bundle's completion step.
pub fn next_status(current: RunStatus, event: EventStatus, completes: bool) -> Option<RunStatus> {
    let next = match event {
        EventStatus::Fail => RunStatus::Fail,
        EventStatus::Success if completes => RunStatus::Success,
        EventStatus::Stuck => RunStatus::Stuck,
        // Any further progress on a stuck run means the executor is alive again.
        EventStatus::Start | EventStatus::Success => RunStatus::Running,
    };
    (next != current && current.can_transition_to(next)).then_some(next)
}

fn invalid_transition(run: &Run, to: impl Into<String>) -> Error {
    Error::InvalidTransition {
        run_id: run.run_id.clone(),
        from: run.status,
        to: to.into(),
    }
}

impl Tracker {
    /// Create a new run in `running` status.
    pub async fn create_run(&self, new: NewRun) -> Result<Run> {
        if new.run_id.trim().is_empty() || new.bundle.trim().is_empty() {
            return Err(Error::Validation(
                "run_id and bundle are required".to_string(),
            ));
        }

        let run = self.store.insert_run(&new, Utc::now()).await?;

        metrics::runs_created().add(1, &[KeyValue::new("bundle", run.bundle.clone())]);
        info!(
            run_id = %run.run_id,
            bundle = %run.bundle,
            known_bundle = self.steps.get(&run.bundle).is_some(),
            "run created"
        );
        Ok(run)
    }

    /// Get a run by its external id.
    pub async fn get_run(&self, run_id: &str) -> Result<Run> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
    }

    /// List runs with running/total counts.
    pub async fn list_runs(&self, filter: &RunFilter) -> Result<RunList> {
        let runs = self.store.list_runs(filter).await?;
        let running_count = self.store.count_runs(Some(RunStatus::Running)).await?;
        let total_count = self.store.count_runs(None).await?;
        Ok(RunList {
            runs,
            running_count,
            total_count,
        })
    }

    /// Ingest one event for a run.
    ///
    /// The event is stored regardless of whether its phase/substep appears in
    /// the bundle's definition. The run's position pointer moves to the
    /// event's pair; `fail` closes the run, and `success` on the bundle's
    /// completion step closes it successfully.
    pub async fn emit_event(&self, run_id: &str, event: NewEvent) -> Result<Event> {
        event.validate()?;
        let span = start_event_span(run_id, &event.phase, &event.substep);

        async {
            let started = Instant::now();
            let run = self.get_run(run_id).await?;
            if run.status.is_terminal() {
                return Err(invalid_transition(&run, event.status.as_str()));
            }

            let definition = self.steps.resolve(&run.bundle);
            let completes = definition.is_completion(&event.phase, &event.substep);

            let mut update = RunUpdate::pointer(&event.phase, &event.substep);
            if let Some(to) = next_status(run.status, event.status, completes) {
                update = if to.is_terminal() {
                    update.close(&run, to, Utc::now())
                } else {
                    RunUpdate {
                        status: Some(to),
                        ..update
                    }
                };
            }

            let (stored, updated) = self.store.apply_event(run_id, &event, &update).await?;

            metrics::events_ingested().add(
                1,
                &[
                    KeyValue::new("status", stored.status.as_str()),
                    KeyValue::new(
                        "event_type",
                        stored.event_type.map_or("none", |t| t.as_str()),
                    ),
                ],
            );
            metrics::operation_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("operation", "run.emit_event")],
            );

            if updated.status != run.status {
                record_state_transition(&span, run.status.as_str(), updated.status.as_str());
                metrics::run_state_transitions().add(
                    1,
                    &[
                        KeyValue::new("from", run.status.as_str()),
                        KeyValue::new("to", updated.status.as_str()),
                    ],
                );
                info!(
                    run_id = %updated.run_id,
                    from = %run.status,
                    to = %updated.status,
                    total_duration_ms = updated.total_duration_ms,
                    "run status changed"
                );
            }

            debug!(
                run_id = %run_id,
                event_id = stored.id,
                status = %stored.status,
                "event ingested"
            );
            Ok(stored)
        }
        .instrument(span.clone())
        .await
    }

    /// Administrative override of run fields.
    ///
    /// Status changes still follow the run state machine, and a terminal run
    /// only accepts metadata. Setting a terminal status fills `ended_at` and
    /// `total_duration_ms` when the caller leaves them out. The completion
    /// check of [`Tracker::emit_event`] is not re-run.
    pub async fn update_run(&self, run_id: &str, mut update: RunUpdate) -> Result<Run> {
        let run = self.get_run(run_id).await?;
        if update.is_empty() {
            return Ok(run);
        }

        if run.status.is_terminal() && update.touches_lifecycle() {
            return Err(invalid_transition(&run, update.target()));
        }

        let target = update.status.unwrap_or(run.status);
        if target != run.status {
            if !run.status.can_transition_to(target) {
                return Err(invalid_transition(&run, target.as_str()));
            }
            if target.is_terminal() {
                let at = *update.ended_at.get_or_insert_with(Utc::now);
                update.total_duration_ms.get_or_insert(run.elapsed_ms(at));
            }
        }
        if !target.is_terminal() && (update.ended_at.is_some() || update.total_duration_ms.is_some())
        {
            return Err(Error::Validation(
                "ended_at and total_duration_ms require a terminal status".to_string(),
            ));
        }

        let updated = self
            .store
            .update_run(run_id, &update)
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;

        if updated.status != run.status {
            metrics::run_state_transitions().add(
                1,
                &[
                    KeyValue::new("from", run.status.as_str()),
                    KeyValue::new("to", updated.status.as_str()),
                ],
            );
        }
        info!(
            run_id = %updated.run_id,
            status = %updated.status,
            "run updated"
        );
        Ok(updated)
    }

    /// Delete a run and its events. Irreversible.
    pub async fn delete_run(&self, run_id: &str) -> Result<()> {
        if !self.store.delete_run(run_id).await? {
            return Err(Error::RunNotFound(run_id.to_string()));
        }
        info!(run_id = %run_id, "run deleted");
        Ok(())
    }

    /// Raw events of a run, oldest first.
    pub async fn list_events(&self, run_id: &str, page: Page) -> Result<Vec<Event>> {
        self.get_run(run_id).await?;
        self.store.list_events(run_id, page).await
    }
}
