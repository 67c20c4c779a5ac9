//! Run queries: create, read, list, partial update, delete.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{NewRun, Run, RunFilter, RunStatus, RunUpdate};

pub(crate) const RUN_COLUMNS: &str = "id, run_id, bundle, workflow, prd_summary, state_dir, current_phase, current_substep, status, started_at, ended_at, total_duration_ms, metadata, updated_at";

impl super::Db {
    /// Insert a new run. A `run_id` collision yields `DuplicateRun`.
    pub async fn insert_run(&self, new: &NewRun, started_at: DateTime<Utc>) -> Result<Run> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "INSERT INTO workflow_runs (run_id, bundle, workflow, prd_summary, state_dir, status, started_at, metadata, updated_at)
             VALUES ($1, $2, $3, $4, $5, 'running', $6, $7, $6)
             ON CONFLICT (run_id) DO NOTHING
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(&new.run_id)
        .bind(&new.bundle)
        .bind(&new.workflow)
        .bind(&new.prd_summary)
        .bind(&new.state_dir)
        .bind(started_at)
        .bind(&new.metadata)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::DuplicateRun(new.run_id.clone()))?
            .try_into_run()
    }

    /// Get a run by its external id.
    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(RunRow::try_into_run).transpose()
    }

    /// List runs, newest first, with optional status and bundle filters.
    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR bundle = $2)
             ORDER BY started_at DESC, id DESC
             LIMIT $3 OFFSET $4"
        ))
        .bind(filter.status.map(|s| s.to_string()))
        .bind(&filter.bundle)
        .bind(filter.limit())
        .bind(filter.offset())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(RunRow::try_into_run).collect()
    }

    pub async fn count_runs(&self, status: Option<RunStatus>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM workflow_runs WHERE ($1::text IS NULL OR status = $1)",
        )
        .bind(status.map(|s| s.to_string()))
        .fetch_one(self.pool())
        .await?;
        Ok(count as u64)
    }

    /// Partial write; unset fields keep their stored value.
    ///
    /// Anything besides metadata is only written while the run is open.
    pub async fn update_run(&self, run_id: &str, update: &RunUpdate) -> Result<Option<Run>> {
        if update.is_empty() {
            return self.get_run(run_id).await;
        }
        let guarded = update.touches_lifecycle();

        let row: Option<RunRow> = sqlx::query_as(&format!(
            "UPDATE workflow_runs SET
                workflow = COALESCE($2, workflow),
                prd_summary = COALESCE($3, prd_summary),
                state_dir = COALESCE($4, state_dir),
                current_phase = COALESCE($5, current_phase),
                current_substep = COALESCE($6, current_substep),
                status = COALESCE($7, status),
                ended_at = COALESCE($8, ended_at),
                total_duration_ms = COALESCE($9, total_duration_ms),
                metadata = COALESCE($10, metadata),
                updated_at = now()
             WHERE run_id = $1
               AND (NOT $11 OR status NOT IN ('success', 'fail'))
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(run_id)
        .bind(&update.workflow)
        .bind(&update.prd_summary)
        .bind(&update.state_dir)
        .bind(&update.current_phase)
        .bind(&update.current_substep)
        .bind(update.status.map(|s| s.to_string()))
        .bind(update.ended_at)
        .bind(update.total_duration_ms)
        .bind(&update.metadata)
        .bind(guarded)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => row.try_into_run().map(Some),
            None if guarded => match self.get_run(run_id).await? {
                Some(existing) => Err(Error::InvalidTransition {
                    run_id: run_id.to_string(),
                    from: existing.status,
                    to: update.target().to_string(),
                }),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Delete a run. Events go with it via `ON DELETE CASCADE`.
    pub async fn delete_run(&self, run_id: &str) -> Result<bool> {
        let rows_affected = sqlx::query("DELETE FROM workflow_runs WHERE run_id = $1")
            .bind(run_id)
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(rows_affected > 0)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
pub(crate) struct RunRow {
    id: i64,
    run_id: String,
    bundle: String,
    workflow: Option<String>,
    prd_summary: Option<String>,
    state_dir: Option<String>,
    current_phase: Option<String>,
    current_substep: Option<String>,
    status: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    total_duration_ms: Option<i64>,
    metadata: serde_json::Value,
    updated_at: DateTime<Utc>,
}

impl RunRow {
    pub(crate) fn try_into_run(self) -> Result<Run> {
        Ok(Run {
            id: self.id,
            run_id: self.run_id,
            bundle: self.bundle,
            workflow: self.workflow,
            prd_summary: self.prd_summary,
            state_dir: self.state_dir,
            current_phase: self.current_phase,
            current_substep: self.current_substep,
            status: self.status.parse()?,
            started_at: self.started_at,
            ended_at: self.ended_at,
            total_duration_ms: self.total_duration_ms,
            metadata: self.metadata,
            updated_at: self.updated_at,
        })
    }
}
