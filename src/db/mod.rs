//! Postgres run store: connection pool, migrations, and health check.

pub mod events;
pub mod runs;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::Result;
use crate::model::{Event, NewEvent, NewRun, Page, Run, RunFilter, RunStatus, RunUpdate};
use crate::store::RunStore;

/// Database handle. Owns the connection pool.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Round-trip a `SELECT 1`.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RunStore for Db {
    async fn insert_run(&self, new: &NewRun, started_at: DateTime<Utc>) -> Result<Run> {
        Db::insert_run(self, new, started_at).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        Db::get_run(self, run_id).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        Db::list_runs(self, filter).await
    }

    async fn count_runs(&self, status: Option<RunStatus>) -> Result<u64> {
        Db::count_runs(self, status).await
    }

    async fn update_run(&self, run_id: &str, update: &RunUpdate) -> Result<Option<Run>> {
        Db::update_run(self, run_id, update).await
    }

    async fn delete_run(&self, run_id: &str) -> Result<bool> {
        Db::delete_run(self, run_id).await
    }

    async fn apply_event(
        &self,
        run_id: &str,
        event: &NewEvent,
        update: &RunUpdate,
    ) -> Result<(Event, Run)> {
        Db::apply_event(self, run_id, event, update).await
    }

    async fn list_events(&self, run_id: &str, page: Page) -> Result<Vec<Event>> {
        Db::list_events(self, run_id, page).await
    }

    async fn latest_events(&self, run_id: &str) -> Result<Vec<Event>> {
        Db::latest_events(self, run_id).await
    }

    async fn find_stalled_starts(&self, cutoff: DateTime<Utc>) -> Result<Vec<Event>> {
        Db::find_stalled_starts(self, cutoff).await
    }

    async fn mark_stuck(&self, run_id: &str, stalled: &Event, message: &str) -> Result<bool> {
        Db::mark_stuck(self, run_id, stalled, message).await
    }

    async fn health_check(&self) -> Result<()> {
        Db::health_check(self).await
    }
}
