//! Event queries: append-with-run-update, reads, stalled-start detection.

use chrono::{DateTime, Utc};

use super::runs::{RUN_COLUMNS, RunRow};
use crate::error::{Error, Result};
use crate::model::{Event, EventStatus, NewEvent, Page, Run, RunUpdate};

const EVENT_COLUMNS: &str = "id, run_id, phase, substep, status, message, duration_ms, event_type, description, details, created_at";

impl super::Db {
    /// Append an event and update its run in one transaction.
    ///
    /// The run row is updated first, guarded on a non-terminal status, which
    /// also serializes concurrent writers for the same run.
    pub async fn apply_event(
        &self,
        run_id: &str,
        event: &NewEvent,
        update: &RunUpdate,
    ) -> Result<(Event, Run)> {
        let mut tx = self.pool().begin().await?;

        let run: Option<RunRow> = sqlx::query_as(&format!(
            "UPDATE workflow_runs SET
                current_phase = COALESCE($2, current_phase),
                current_substep = COALESCE($3, current_substep),
                status = COALESCE($4, status),
                ended_at = COALESCE($5, ended_at),
                total_duration_ms = COALESCE($6, total_duration_ms),
                updated_at = now()
             WHERE run_id = $1 AND status NOT IN ('success', 'fail')
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(run_id)
        .bind(&update.current_phase)
        .bind(&update.current_substep)
        .bind(update.status.map(|s| s.to_string()))
        .bind(update.ended_at)
        .bind(update.total_duration_ms)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(run) = run else {
            tx.rollback().await?;
            return Err(match self.get_run(run_id).await? {
                Some(existing) => Error::InvalidTransition {
                    run_id: run_id.to_string(),
                    from: existing.status,
                    to: event.status.to_string(),
                },
                None => Error::RunNotFound(run_id.to_string()),
            });
        };

        let row: EventRow = sqlx::query_as(&format!(
            "INSERT INTO workflow_events (run_id, phase, substep, status, message, duration_ms, event_type, description, details, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, clock_timestamp())
             RETURNING {EVENT_COLUMNS}"
        ))
        .bind(run_id)
        .bind(&event.phase)
        .bind(&event.substep)
        .bind(event.status.to_string())
        .bind(&event.message)
        .bind(event.duration_ms)
        .bind(event.event_type.map(|t| t.to_string()))
        .bind(&event.description)
        .bind(&event.details)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok((row.try_into_event()?, run.try_into_run()?))
    }

    /// Events of a run in ingestion order. `LIMIT NULL` means unbounded.
    pub async fn list_events(&self, run_id: &str, page: Page) -> Result<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM workflow_events
             WHERE run_id = $1
             ORDER BY created_at ASC, id ASC
             LIMIT $2 OFFSET $3"
        ))
        .bind(run_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(EventRow::try_into_event).collect()
    }

    /// Latest event per (phase, substep), returned in time order.
    pub async fn latest_events(&self, run_id: &str) -> Result<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT * FROM (
                SELECT DISTINCT ON (phase, substep) {EVENT_COLUMNS}
                FROM workflow_events
                WHERE run_id = $1
                ORDER BY phase, substep, created_at DESC, id DESC
             ) latest
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(run_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(EventRow::try_into_event).collect()
    }

    /// Open `start` events older than `cutoff` on running runs.
    pub async fn find_stalled_starts(&self, cutoff: DateTime<Utc>) -> Result<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT e.id, e.run_id, e.phase, e.substep, e.status, e.message, e.duration_ms, e.event_type, e.description, e.details, e.created_at
             FROM workflow_events e
             JOIN workflow_runs r ON e.run_id = r.run_id
             WHERE e.status = 'start'
               AND r.status = 'running'
               AND e.created_at < $1
               AND NOT EXISTS (
                 SELECT 1 FROM workflow_events e2
                 WHERE e2.run_id = e.run_id
                   AND e2.phase = e.phase
                   AND e2.substep = e.substep
                   AND (e2.created_at, e2.id) > (e.created_at, e.id)
               )
             ORDER BY e.created_at ASC, e.id ASC",
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(EventRow::try_into_event).collect()
    }

    /// Conditionally flip a running run to stuck and record why.
    pub async fn mark_stuck(&self, run_id: &str, stalled: &Event, message: &str) -> Result<bool> {
        let mut tx = self.pool().begin().await?;

        let rows_affected = sqlx::query(
            "UPDATE workflow_runs SET status = 'stuck', updated_at = now()
             WHERE run_id = $1 AND status = 'running'",
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO workflow_events (run_id, phase, substep, status, message, created_at)
             VALUES ($1, $2, $3, $4, $5, clock_timestamp())",
        )
        .bind(run_id)
        .bind(&stalled.phase)
        .bind(&stalled.substep)
        .bind(EventStatus::Stuck.to_string())
        .bind(message)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    run_id: String,
    phase: String,
    substep: String,
    status: String,
    message: Option<String>,
    duration_ms: Option<i64>,
    event_type: Option<String>,
    description: Option<String>,
    details: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl EventRow {
    fn try_into_event(self) -> Result<Event> {
        Ok(Event {
            id: self.id,
            run_id: self.run_id,
            phase: self.phase,
            substep: self.substep,
            status: self.status.parse()?,
            message: self.message,
            duration_ms: self.duration_ms,
            event_type: self.event_type.map(|t| t.parse()).transpose()?,
            description: self.description,
            details: self.details,
            created_at: self.created_at,
        })
    }
}
