//! Integration tests for the run lifecycle against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use workflow_tracker::error::{Error, Result};
use workflow_tracker::model::*;
use workflow_tracker::steps::{StepsDefinition, StepsRegistry};
use workflow_tracker::store::{MemoryStore, RunStore};
use workflow_tracker::tracker::Tracker;
use workflow_tracker::tracker::lifecycle::next_status;

const TWO_PHASE: &str = r#"
version = "1"
bundle = "two-phase"

[[phases]]
name = "A"
  [[phases.substeps]]
  id = "a1"

[[phases]]
name = "B"
  [[phases.substeps]]
  id = "b1"
  [[phases.substeps]]
  id = "b2"
"#;

fn test_tracker() -> Tracker {
    let def = StepsDefinition::from_toml(TWO_PHASE).unwrap();
    Tracker::in_memory(StepsRegistry::with_definitions([def]).unwrap())
}

async fn new_run(tracker: &Tracker, run_id: &str) -> Run {
    tracker
        .create_run(NewRun::new(run_id, "two-phase"))
        .await
        .unwrap()
}

async fn emit(tracker: &Tracker, run_id: &str, phase: &str, substep: &str, status: EventStatus) {
    tracker
        .emit_event(run_id, NewEvent::new(phase, substep, status))
        .await
        .unwrap();
}

async fn event_count(tracker: &Tracker, run_id: &str) -> usize {
    tracker
        .store()
        .list_events(run_id, Page::all())
        .await
        .unwrap()
        .len()
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_run_starts_running_without_position() {
    let tracker = test_tracker();
    let run = tracker
        .create_run(
            NewRun::new("r1", "two-phase")
                .workflow("feature")
                .prd_summary("add a button")
                .metadata(json!({"ticket": 42})),
        )
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.workflow.as_deref(), Some("feature"));
    assert_eq!(run.metadata, json!({"ticket": 42}));
    assert!(run.current_phase.is_none());
    assert!(run.ended_at.is_none());
    assert!(run.total_duration_ms.is_none());
}

#[tokio::test]
async fn create_run_rejects_duplicate_id() {
    let tracker = test_tracker();
    new_run(&tracker, "r1").await;

    let err = tracker
        .create_run(NewRun::new("r1", "two-phase"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateRun(ref id) if id == "r1"));
}

#[tokio::test]
async fn create_run_requires_id_and_bundle() {
    let tracker = test_tracker();
    let err = tracker.create_run(NewRun::new("", "dev")).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    let err = tracker.create_run(NewRun::new("r1", "  ")).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

// ---------------------------------------------------------------------------
// Event ingestion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn emit_event_moves_position_pointer() {
    let tracker = test_tracker();
    new_run(&tracker, "r1").await;

    emit(&tracker, "r1", "A", "a1", EventStatus::Start).await;
    let run = tracker.get_run("r1").await.unwrap();
    assert_eq!(run.current_phase.as_deref(), Some("A"));
    assert_eq!(run.current_substep.as_deref(), Some("a1"));
    assert_eq!(run.status, RunStatus::Running);

    emit(&tracker, "r1", "B", "b1", EventStatus::Start).await;
    let run = tracker.get_run("r1").await.unwrap();
    assert_eq!(run.current_phase.as_deref(), Some("B"));
    assert_eq!(run.current_substep.as_deref(), Some("b1"));
}

#[tokio::test]
async fn success_of_final_substep_closes_run() {
    let tracker = test_tracker();
    new_run(&tracker, "r1").await;

    for (phase, substep) in [("A", "a1"), ("B", "b1"), ("B", "b2")] {
        emit(&tracker, "r1", phase, substep, EventStatus::Start).await;
        emit(&tracker, "r1", phase, substep, EventStatus::Success).await;
    }

    let run = tracker.get_run("r1").await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    let ended = run.ended_at.expect("closed run has ended_at");
    assert!(ended >= run.started_at);
    assert_eq!(
        run.total_duration_ms,
        Some((ended - run.started_at).num_milliseconds())
    );
}

#[tokio::test]
async fn non_final_success_keeps_run_open() {
    let tracker = test_tracker();
    new_run(&tracker, "r1").await;

    emit(&tracker, "r1", "A", "a1", EventStatus::Success).await;
    emit(&tracker, "r1", "B", "b1", EventStatus::Success).await;

    let run = tracker.get_run("r1").await.unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.ended_at.is_none());
}

#[tokio::test]
async fn fail_event_closes_run_as_failed() {
    let tracker = test_tracker();
    new_run(&tracker, "r1").await;

    emit(&tracker, "r1", "A", "a1", EventStatus::Start).await;
    tracker
        .emit_event(
            "r1",
            NewEvent::new("A", "a1", EventStatus::Fail).message("compile error"),
        )
        .await
        .unwrap();

    let run = tracker.get_run("r1").await.unwrap();
    assert_eq!(run.status, RunStatus::Fail);
    assert!(run.ended_at.is_some());
    assert!(run.total_duration_ms.is_some());
}

#[tokio::test]
async fn terminal_run_rejects_events_and_stores_nothing() {
    let tracker = test_tracker();
    new_run(&tracker, "r1").await;
    emit(&tracker, "r1", "A", "a1", EventStatus::Fail).await;
    let before = event_count(&tracker, "r1").await;

    let err = tracker
        .emit_event("r1", NewEvent::new("A", "a1", EventStatus::Start))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: RunStatus::Fail,
            ..
        }
    ));
    assert_eq!(event_count(&tracker, "r1").await, before);
}

#[tokio::test]
async fn event_for_unknown_run_is_not_found() {
    let tracker = test_tracker();
    let err = tracker
        .emit_event("ghost", NewEvent::new("A", "a1", EventStatus::Start))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RunNotFound(_)));
}

#[tokio::test]
async fn blank_phase_or_substep_is_rejected() {
    let tracker = test_tracker();
    new_run(&tracker, "r1").await;

    let err = tracker
        .emit_event("r1", NewEvent::new("", "a1", EventStatus::Start))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = tracker
        .emit_event("r1", NewEvent::new("A", " ", EventStatus::Start))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(event_count(&tracker, "r1").await, 0);
}

#[tokio::test]
async fn undeclared_pairs_are_recorded_but_never_complete() {
    let tracker = test_tracker();
    new_run(&tracker, "r1").await;

    let stored = tracker
        .emit_event(
            "r1",
            NewEvent::new("B", "hotfix", EventStatus::Success).event_type(EventType::Info),
        )
        .await
        .unwrap();
    assert_eq!(stored.substep, "hotfix");

    let run = tracker.get_run("r1").await.unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.current_substep.as_deref(), Some("hotfix"));
}

#[tokio::test]
async fn late_event_for_earlier_phase_is_accepted() {
    let tracker = test_tracker();
    new_run(&tracker, "r1").await;

    emit(&tracker, "r1", "B", "b1", EventStatus::Start).await;
    emit(&tracker, "r1", "A", "a1", EventStatus::Success).await;

    let run = tracker.get_run("r1").await.unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.current_phase.as_deref(), Some("A"));
}

#[tokio::test]
async fn unknown_bundle_completes_on_success_in_last_builtin_phase() {
    let tracker = test_tracker();
    tracker
        .create_run(NewRun::new("r1", "no-such-bundle"))
        .await
        .unwrap();

    emit(&tracker, "r1", "EXECUTE", "anything", EventStatus::Success).await;
    assert_eq!(
        tracker.get_run("r1").await.unwrap().status,
        RunStatus::Running
    );

    emit(&tracker, "r1", "FINALIZE", "report", EventStatus::Success).await;
    assert_eq!(
        tracker.get_run("r1").await.unwrap().status,
        RunStatus::Success
    );
}

// ---------------------------------------------------------------------------
// Stuck recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stuck_event_flips_run_and_progress_unsticks_it() {
    let tracker = test_tracker();
    new_run(&tracker, "r1").await;

    emit(&tracker, "r1", "A", "a1", EventStatus::Start).await;
    emit(&tracker, "r1", "A", "a1", EventStatus::Stuck).await;
    assert_eq!(tracker.get_run("r1").await.unwrap().status, RunStatus::Stuck);

    emit(&tracker, "r1", "A", "a1", EventStatus::Start).await;
    assert_eq!(
        tracker.get_run("r1").await.unwrap().status,
        RunStatus::Running
    );
}

#[tokio::test]
async fn stuck_run_can_still_finish() {
    let tracker = test_tracker();
    new_run(&tracker, "r1").await;

    emit(&tracker, "r1", "B", "b2", EventStatus::Start).await;
    emit(&tracker, "r1", "B", "b2", EventStatus::Stuck).await;
    emit(&tracker, "r1", "B", "b2", EventStatus::Success).await;

    let run = tracker.get_run("r1").await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert!(run.ended_at.is_some());
}

#[test]
fn next_status_follows_state_machine() {
    use EventStatus as E;
    use RunStatus as R;

    assert_eq!(next_status(R::Running, E::Start, false), None);
    assert_eq!(next_status(R::Running, E::Success, false), None);
    assert_eq!(next_status(R::Running, E::Success, true), Some(R::Success));
    assert_eq!(next_status(R::Running, E::Fail, false), Some(R::Fail));
    assert_eq!(next_status(R::Running, E::Stuck, false), Some(R::Stuck));
    assert_eq!(next_status(R::Stuck, E::Start, false), Some(R::Running));
    assert_eq!(next_status(R::Stuck, E::Stuck, false), None);
    assert_eq!(next_status(R::Stuck, E::Fail, true), Some(R::Fail));
    assert_eq!(next_status(R::Success, E::Start, false), None);
    assert_eq!(next_status(R::Fail, E::Success, true), None);
}

// ---------------------------------------------------------------------------
// Administrative update & delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn update_run_to_terminal_fills_end_fields() {
    let tracker = test_tracker();
    new_run(&tracker, "r1").await;

    let run = tracker
        .update_run(
            "r1",
            RunUpdate {
                status: Some(RunStatus::Fail),
                ..RunUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Fail);
    assert!(run.ended_at.is_some());
    assert!(run.total_duration_ms.is_some());
}

#[tokio::test]
async fn terminal_run_accepts_only_metadata() {
    let tracker = test_tracker();
    new_run(&tracker, "r1").await;
    emit(&tracker, "r1", "A", "a1", EventStatus::Fail).await;

    let run = tracker
        .update_run(
            "r1",
            RunUpdate {
                metadata: Some(json!({"note": "flaky runner"})),
                ..RunUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(run.metadata, json!({"note": "flaky runner"}));
    assert_eq!(run.status, RunStatus::Fail);

    let err = tracker
        .update_run(
            "r1",
            RunUpdate {
                status: Some(RunStatus::Running),
                ..RunUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

/// Memory store where a `fail` event lands between the tracker's read and
/// its administrative write.
struct ClosedBeforeWrite {
    inner: MemoryStore,
}

#[async_trait]
impl RunStore for ClosedBeforeWrite {
    async fn insert_run(&self, new: &NewRun, started_at: DateTime<Utc>) -> Result<Run> {
        self.inner.insert_run(new, started_at).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        self.inner.get_run(run_id).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        self.inner.list_runs(filter).await
    }

    async fn count_runs(&self, status: Option<RunStatus>) -> Result<u64> {
        self.inner.count_runs(status).await
    }

    async fn update_run(&self, run_id: &str, update: &RunUpdate) -> Result<Option<Run>> {
        if let Some(run) = self.inner.get_run(run_id).await? {
            if !run.status.is_terminal() {
                let close = RunUpdate::pointer("A", "a1").close(&run, RunStatus::Fail, Utc::now());
                self.inner
                    .apply_event(run_id, &NewEvent::new("A", "a1", EventStatus::Fail), &close)
                    .await?;
            }
        }
        self.inner.update_run(run_id, update).await
    }

    async fn delete_run(&self, run_id: &str) -> Result<bool> {
        self.inner.delete_run(run_id).await
    }

    async fn apply_event(
        &self,
        run_id: &str,
        event: &NewEvent,
        update: &RunUpdate,
    ) -> Result<(Event, Run)> {
        self.inner.apply_event(run_id, event, update).await
    }

    async fn list_events(&self, run_id: &str, page: Page) -> Result<Vec<Event>> {
        self.inner.list_events(run_id, page).await
    }

    async fn latest_events(&self, run_id: &str) -> Result<Vec<Event>> {
        self.inner.latest_events(run_id).await
    }

    async fn find_stalled_starts(&self, cutoff: DateTime<Utc>) -> Result<Vec<Event>> {
        self.inner.find_stalled_starts(cutoff).await
    }

    async fn mark_stuck(&self, run_id: &str, stalled: &Event, message: &str) -> Result<bool> {
        self.inner.mark_stuck(run_id, stalled, message).await
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }
}

#[tokio::test]
async fn update_run_cannot_reopen_a_run_closed_meanwhile() {
    let store = ClosedBeforeWrite {
        inner: MemoryStore::new(),
    };
    let tracker = Tracker::new(Arc::new(store), Arc::new(StepsRegistry::empty()));
    new_run(&tracker, "r1").await;

    let err = tracker
        .update_run(
            "r1",
            RunUpdate {
                status: Some(RunStatus::Stuck),
                ..RunUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: RunStatus::Fail,
            ..
        }
    ));

    let run = tracker.get_run("r1").await.unwrap();
    assert_eq!(run.status, RunStatus::Fail);
    assert!(run.ended_at.is_some());
}

#[tokio::test]
async fn store_refuses_lifecycle_write_to_terminal_run() {
    let tracker = test_tracker();
    new_run(&tracker, "r1").await;
    emit(&tracker, "r1", "A", "a1", EventStatus::Fail).await;

    let err = tracker
        .store()
        .update_run(
            "r1",
            &RunUpdate {
                status: Some(RunStatus::Running),
                ..RunUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));

    let run = tracker
        .store()
        .update_run(
            "r1",
            &RunUpdate {
                metadata: Some(json!({"note": "kept"})),
                ..RunUpdate::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Fail);
    assert_eq!(run.metadata, json!({"note": "kept"}));
}

#[tokio::test]
async fn update_run_sets_descriptive_fields() {
    let tracker = test_tracker();
    new_run(&tracker, "r1").await;

    let run = tracker
        .update_run(
            "r1",
            RunUpdate {
                prd_summary: Some("rework the login form".to_string()),
                state_dir: Some("/var/runs/r1".to_string()),
                ..RunUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(run.prd_summary.as_deref(), Some("rework the login form"));
    assert_eq!(run.state_dir.as_deref(), Some("/var/runs/r1"));
    assert_eq!(run.status, RunStatus::Running);
}

#[tokio::test]
async fn update_run_rejects_end_fields_on_open_run() {
    let tracker = test_tracker();
    new_run(&tracker, "r1").await;

    let err = tracker
        .update_run(
            "r1",
            RunUpdate {
                total_duration_ms: Some(10),
                ..RunUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn delete_run_removes_run_and_events() {
    let tracker = test_tracker();
    new_run(&tracker, "r1").await;
    emit(&tracker, "r1", "A", "a1", EventStatus::Start).await;

    tracker.delete_run("r1").await.unwrap();

    assert!(matches!(
        tracker.get_run("r1").await.unwrap_err(),
        Error::RunNotFound(_)
    ));
    assert_eq!(event_count(&tracker, "r1").await, 0);
    assert!(matches!(
        tracker.delete_run("r1").await.unwrap_err(),
        Error::RunNotFound(_)
    ));
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_runs_filters_and_counts() {
    let tracker = test_tracker();
    new_run(&tracker, "r1").await;
    new_run(&tracker, "r2").await;
    tracker
        .create_run(NewRun::new("r3", "other"))
        .await
        .unwrap();
    emit(&tracker, "r2", "A", "a1", EventStatus::Fail).await;

    let all = tracker.list_runs(&RunFilter::default()).await.unwrap();
    assert_eq!(all.total_count, 3);
    assert_eq!(all.running_count, 2);
    assert_eq!(all.runs.len(), 3);

    let failed = tracker
        .list_runs(&RunFilter {
            status: Some(RunStatus::Fail),
            ..RunFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(failed.runs.len(), 1);
    assert_eq!(failed.runs[0].run_id, "r2");

    let other = tracker
        .list_runs(&RunFilter {
            bundle: Some("other".to_string()),
            ..RunFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(other.runs.len(), 1);
    assert_eq!(other.runs[0].run_id, "r3");
}

#[tokio::test]
async fn list_events_returns_stored_fields_in_order() {
    let tracker = test_tracker();
    new_run(&tracker, "r1").await;

    tracker
        .emit_event(
            "r1",
            NewEvent::new("A", "a1", EventStatus::Success)
                .message("done")
                .duration_ms(1500)
                .event_type(EventType::TaskComplete)
                .description("wrote plan")
                .details(json!({"files": ["a.rs"]})),
        )
        .await
        .unwrap();
    emit(&tracker, "r1", "B", "b1", EventStatus::Start).await;

    let events = tracker.list_events("r1", Page::all()).await.unwrap();
    assert_eq!(events.len(), 2);
    let first = &events[0];
    assert_eq!(first.run_id, "r1");
    assert_eq!(first.status, EventStatus::Success);
    assert_eq!(first.message.as_deref(), Some("done"));
    assert_eq!(first.duration_ms, Some(1500));
    assert_eq!(first.event_type, Some(EventType::TaskComplete));
    assert_eq!(first.description.as_deref(), Some("wrote plan"));
    assert_eq!(first.details, Some(json!({"files": ["a.rs"]})));
    assert!(events[0].created_at <= events[1].created_at);

    let page = tracker
        .list_events("r1", Page::new(Some(1), Some(1)))
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].substep, "b1");
}

#[tokio::test]
async fn list_events_of_unknown_run_is_not_found() {
    let tracker = test_tracker();
    let err = tracker.list_events("ghost", Page::all()).await.unwrap_err();
    assert!(matches!(err, Error::RunNotFound(_)));
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_runs_do_not_interfere() {
    let tracker = test_tracker();
    new_run(&tracker, "left").await;
    new_run(&tracker, "right").await;

    let pairs = [("A", "a1"), ("B", "b1"), ("B", "b2")];
    let mut handles = Vec::new();
    for run_id in ["left", "right"] {
        let tracker = tracker.clone();
        handles.push(tokio::spawn(async move {
            for (phase, substep) in pairs {
                emit(&tracker, run_id, phase, substep, EventStatus::Start).await;
                tokio::time::sleep(Duration::from_millis(1)).await;
                emit(&tracker, run_id, phase, substep, EventStatus::Success).await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for run_id in ["left", "right"] {
        let run = tracker.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
        let events = tracker.list_events(run_id, Page::all()).await.unwrap();
        assert_eq!(events.len(), 6);
        assert!(events.iter().all(|e| e.run_id == run_id));
    }
}
