//! In-memory run store.
//!
//! Single `RwLock` over all state, so every operation is atomic. Used by
//! tests and by `wftrack serve` when no database is configured.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::RunStore;
use crate::error::{Error, Result};
use crate::model::{
    Event, EventStatus, NewEvent, NewRun, Page, Run, RunFilter, RunStatus, RunUpdate,
};

#[derive(Default)]
struct Inner {
    runs: HashMap<String, Run>,
    /// All events in insertion order, which is also `(created_at, id)` order.
    events: Vec<Event>,
    next_run_id: i64,
    next_event_id: i64,
}

impl Inner {
    /// Timestamp for a new event, never earlier than the previous one.
    fn event_time(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.events.last() {
            Some(last) if last.created_at > now => last.created_at,
            _ => now,
        }
    }

    fn push_event(&mut self, run_id: &str, event: NewEvent) -> Event {
        self.next_event_id += 1;
        let created_at = self.event_time();
        let event = event.into_event(self.next_event_id, run_id, created_at);
        self.events.push(event.clone());
        event
    }

    fn events_of<'a>(&'a self, run_id: &'a str) -> impl Iterator<Item = &'a Event> + 'a {
        self.events.iter().filter(move |e| e.run_id == run_id)
    }
}

/// Run store backed by process memory. Contents are lost on drop.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn insert_run(&self, new: &NewRun, started_at: DateTime<Utc>) -> Result<Run> {
        let mut inner = self.inner.write().await;
        if inner.runs.contains_key(&new.run_id) {
            return Err(Error::DuplicateRun(new.run_id.clone()));
        }
        inner.next_run_id += 1;
        let run = Run {
            id: inner.next_run_id,
            run_id: new.run_id.clone(),
            bundle: new.bundle.clone(),
            workflow: new.workflow.clone(),
            prd_summary: new.prd_summary.clone(),
            state_dir: new.state_dir.clone(),
            current_phase: None,
            current_substep: None,
            status: RunStatus::Running,
            started_at,
            ended_at: None,
            total_duration_ms: None,
            metadata: new.metadata.clone(),
            updated_at: started_at,
        };
        inner.runs.insert(run.run_id.clone(), run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        Ok(self.inner.read().await.runs.get(run_id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let inner = self.inner.read().await;
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .filter(|r| filter.bundle.as_deref().is_none_or(|b| r.bundle == b))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(runs
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.limit() as usize)
            .collect())
    }

    async fn count_runs(&self, status: Option<RunStatus>) -> Result<u64> {
        let inner = self.inner.read().await;
        let count = inner
            .runs
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .count();
        Ok(count as u64)
    }

    async fn update_run(&self, run_id: &str, update: &RunUpdate) -> Result<Option<Run>> {
        let mut inner = self.inner.write().await;
        let Some(run) = inner.runs.get_mut(run_id) else {
            return Ok(None);
        };
        if run.status.is_terminal() && update.touches_lifecycle() {
            return Err(Error::InvalidTransition {
                run_id: run_id.to_string(),
                from: run.status,
                to: update.target().to_string(),
            });
        }
        if !update.is_empty() {
            update.apply_to(run);
            run.updated_at = Utc::now();
        }
        Ok(Some(run.clone()))
    }

    async fn delete_run(&self, run_id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let removed = inner.runs.remove(run_id).is_some();
        if removed {
            inner.events.retain(|e| e.run_id != run_id);
        }
        Ok(removed)
    }

    async fn apply_event(
        &self,
        run_id: &str,
        event: &NewEvent,
        update: &RunUpdate,
    ) -> Result<(Event, Run)> {
        let mut inner = self.inner.write().await;
        let status = match inner.runs.get(run_id) {
            Some(run) => run.status,
            None => return Err(Error::RunNotFound(run_id.to_string())),
        };
        if status.is_terminal() {
            return Err(Error::InvalidTransition {
                run_id: run_id.to_string(),
                from: status,
                to: event.status.to_string(),
            });
        }

        let event = inner.push_event(run_id, event.clone());
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        update.apply_to(run);
        run.updated_at = event.created_at;
        Ok((event, run.clone()))
    }

    async fn list_events(&self, run_id: &str, page: Page) -> Result<Vec<Event>> {
        let inner = self.inner.read().await;
        let events = inner.events_of(run_id).skip(page.offset as usize);
        Ok(match page.limit {
            Some(limit) => events.take(limit as usize).cloned().collect(),
            None => events.cloned().collect(),
        })
    }

    async fn latest_events(&self, run_id: &str) -> Result<Vec<Event>> {
        let inner = self.inner.read().await;
        let mut latest: HashMap<(&str, &str), &Event> = HashMap::new();
        for event in inner.events_of(run_id) {
            latest.insert((event.phase.as_str(), event.substep.as_str()), event);
        }
        let mut events: Vec<Event> = latest.into_values().cloned().collect();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(events)
    }

    async fn find_stalled_starts(&self, cutoff: DateTime<Utc>) -> Result<Vec<Event>> {
        let inner = self.inner.read().await;
        let stalled = inner
            .events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.status == EventStatus::Start && e.created_at < cutoff)
            .filter(|(_, e)| {
                inner
                    .runs
                    .get(&e.run_id)
                    .is_some_and(|r| r.status == RunStatus::Running)
            })
            .filter(|(i, e)| {
                !inner.events[i + 1..]
                    .iter()
                    .any(|later| later.run_id == e.run_id && later.is_for(&e.phase, &e.substep))
            })
            .map(|(_, e)| e.clone())
            .collect();
        Ok(stalled)
    }

    async fn mark_stuck(&self, run_id: &str, stalled: &Event, message: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.runs.get(run_id) {
            Some(run) if run.status == RunStatus::Running => {}
            _ => return Ok(false),
        }

        let event = inner.push_event(
            run_id,
            NewEvent::new(&stalled.phase, &stalled.substep, EventStatus::Stuck).message(message),
        );
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        run.status = RunStatus::Stuck;
        run.updated_at = event.created_at;
        Ok(true)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
