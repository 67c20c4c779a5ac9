//! Run repository abstraction.
//!
//! Durable CRUD over runs and append-only events, plus the two derived
//! reads the tracker depends on: latest event per (phase, substep), and
//! open `start` events older than a cutoff.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{Event, NewEvent, NewRun, Page, Run, RunFilter, RunStatus, RunUpdate};

/// Storage backend for runs and their events.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new `running` run. Fails with `DuplicateRun` if `run_id` exists.
    async fn insert_run(&self, new: &NewRun, started_at: DateTime<Utc>) -> Result<Run>;

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// Runs matching the filter, newest `started_at` first.
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>>;

    /// Count runs, optionally only those with a given status.
    async fn count_runs(&self, status: Option<RunStatus>) -> Result<u64>;

    /// Partial write. Returns `None` if the run doesn't exist.
    ///
    /// An update that touches anything besides metadata is refused with
    /// `InvalidTransition` once the run is terminal, checked atomically with
    /// the write.
    async fn update_run(&self, run_id: &str, update: &RunUpdate) -> Result<Option<Run>>;

    /// Delete a run and all its events. Returns whether a row was removed.
    async fn delete_run(&self, run_id: &str) -> Result<bool>;

    /// Append an event and apply `update` to its run as one atomic unit.
    ///
    /// Refuses with `InvalidTransition` if the run is already terminal, in
    /// which case nothing is written.
    async fn apply_event(
        &self,
        run_id: &str,
        event: &NewEvent,
        update: &RunUpdate,
    ) -> Result<(Event, Run)>;

    /// Events of a run ordered by `(created_at, id)`.
    async fn list_events(&self, run_id: &str, page: Page) -> Result<Vec<Event>>;

    /// Most recent event for each (phase, substep) pair of a run.
    async fn latest_events(&self, run_id: &str) -> Result<Vec<Event>>;

    /// `start` events created before `cutoff` with no later event for the
    /// same (run, phase, substep), on runs still `running`.
    async fn find_stalled_starts(&self, cutoff: DateTime<Utc>) -> Result<Vec<Event>>;

    /// Flip a still-`running` run to `stuck`, appending a `stuck` event for
    /// the stalled pair. Returns `false` if the run is gone or no longer running.
    async fn mark_stuck(&self, run_id: &str, stalled: &Event, message: &str) -> Result<bool>;

    async fn health_check(&self) -> Result<()>;
}
