//! HTTP tests driving the router in-process.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;
use workflow_tracker::api::{AppState, router};
use workflow_tracker::steps::{StepsDefinition, StepsRegistry};
use workflow_tracker::tracker::Tracker;

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

fn test_router() -> Router {
    let def = StepsDefinition::from_toml(TWO_PHASE).unwrap();
    let tracker = Tracker::in_memory(StepsRegistry::with_definitions([def]).unwrap());
    router(AppState::new(tracker))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            req = req.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create(app: &Router, run_id: &str) {
    let (status, _) = send(
        app,
        "POST",
        "/runs",
        Some(json!({"run_id": run_id, "bundle": "two-phase"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

async fn post_event(app: &Router, run_id: &str, body: Value) -> (StatusCode, Value) {
    send(app, "POST", &format!("/runs/{run_id}/events"), Some(body)).await
}

#[tokio::test]
async fn create_and_fetch_run() {
    let app = test_router();
    let (status, run) = send(
        &app,
        "POST",
        "/runs",
        Some(json!({
            "run_id": "r1",
            "bundle": "two-phase",
            "workflow": "feature",
            "metadata": {"ticket": 7}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(run["status"], "running");
    assert_eq!(run["metadata"]["ticket"], 7);

    let (status, view) = send(&app, "GET", "/runs/r1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["run_id"], "r1");
    assert_eq!(view["events_count"], 0);
    assert_eq!(view["phases"].as_array().unwrap().len(), 2);
    assert_eq!(view["phases"][0]["status"], "pending");
    assert!(view["last_event"].is_null());
}

#[tokio::test]
async fn duplicate_run_is_conflict() {
    let app = test_router();
    create(&app, "r1").await;

    let (status, body) = send(
        &app,
        "POST",
        "/runs",
        Some(json!({"run_id": "r1", "bundle": "two-phase"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "duplicate_run");
    assert!(body["request_id"].is_string());
}

#[tokio::test]
async fn missing_fields_are_bad_request() {
    let app = test_router();
    let (status, body) = send(&app, "POST", "/runs", Some(json!({"bundle": "x"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation_error");

    create(&app, "r1").await;
    let (status, body) = post_event(&app, "r1", json!({"phase": "A", "substep": "a1"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation_error");

    let (status, _) = post_event(
        &app,
        "r1",
        json!({"phase": "A", "substep": "a1", "status": "done"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_event(
        &app,
        "r1",
        json!({"phase": "A", "substep": "a1", "status": "start", "event_type": "nonsense"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn undecodable_bodies_get_the_error_envelope() {
    let app = test_router();
    let (status, body) = send(
        &app,
        "POST",
        "/runs",
        Some(json!({"run_id": 5, "bundle": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation_error");
    assert!(body["request_id"].is_string());

    create(&app, "r1").await;
    let (status, body) = post_event(
        &app,
        "r1",
        json!({"phase": "A", "substep": "a1", "status": "start", "duration_ms": "slow"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation_error");

    let (status, body) = send(&app, "PATCH", "/runs/r1", Some(json!({"state_dir": []}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation_error");

    let (status, body) = send(&app, "GET", "/runs/r1/events?limit=many", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation_error");
}

#[tokio::test]
async fn unknown_run_is_not_found() {
    let app = test_router();
    for (method, uri) in [
        ("GET", "/runs/ghost"),
        ("GET", "/runs/ghost/events"),
        ("GET", "/runs/ghost/stream"),
        ("DELETE", "/runs/ghost"),
    ] {
        let (status, body) = send(&app, method, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        assert_eq!(body["error"]["kind"], "run_not_found");
    }

    let (status, _) = post_event(
        &app,
        "ghost",
        json!({"phase": "A", "substep": "a1", "status": "start"}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn events_drive_run_to_success() {
    let app = test_router();
    create(&app, "r1").await;

    for (phase, substep) in [("A", "a1"), ("B", "b1"), ("B", "b2")] {
        for status in ["start", "success"] {
            let (code, event) = post_event(
                &app,
                "r1",
                json!({"phase": phase, "substep": substep, "status": status, "event_type": "task_start"}),
            )
            .await;
            assert_eq!(code, StatusCode::CREATED);
            assert_eq!(event["status"], status);
        }
    }

    let (_, view) = send(&app, "GET", "/runs/r1", None).await;
    assert_eq!(view["status"], "success");
    assert!(view["ended_at"].is_string());
    assert_eq!(view["events_count"], 6);
    assert_eq!(view["phases"][1]["status"], "success");
    assert_eq!(view["last_event"]["substep"], "b2");

    let (status, body) = post_event(
        &app,
        "r1",
        json!({"phase": "B", "substep": "b2", "status": "start"}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "invalid_transition");
}

#[tokio::test]
async fn list_runs_with_filters_and_counts() {
    let app = test_router();
    create(&app, "r1").await;
    create(&app, "r2").await;
    post_event(
        &app,
        "r2",
        json!({"phase": "A", "substep": "a1", "status": "fail"}),
    )
    .await;

    let (status, body) = send(&app, "GET", "/runs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_count"], 2);
    assert_eq!(body["running_count"], 1);

    let (_, body) = send(&app, "GET", "/runs?status=fail&limit=10", None).await;
    let runs = body["runs"].as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["run_id"], "r2");

    let (status, _) = send(&app, "GET", "/runs?status=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn events_listing_and_stream() {
    let app = test_router();
    create(&app, "r1").await;
    post_event(
        &app,
        "r1",
        json!({"phase": "A", "substep": "a1", "status": "start", "event_type": "prd_read"}),
    )
    .await;
    post_event(
        &app,
        "r1",
        json!({
            "phase": "A", "substep": "a1", "status": "success",
            "duration_ms": 4000, "details": {"tasks": [1, 2]}
        }),
    )
    .await;

    let (_, body) = send(&app, "GET", "/runs/r1/events?limit=1", None).await;
    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["status"], "start");

    let (status, body) = send(&app, "GET", "/runs/r1/stream", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["run"]["run_id"], "r1");
    let stream = body["events"].as_array().unwrap();
    assert_eq!(stream.len(), 2);
    assert_eq!(stream[0]["type"], "info");
    assert_eq!(stream[1]["content"], "split into 2 subtasks");
    assert_eq!(stream[1]["expandable"], true);
}

#[tokio::test]
async fn patch_and_delete_run() {
    let app = test_router();
    create(&app, "r1").await;

    let (status, run) = send(
        &app,
        "PATCH",
        "/runs/r1",
        Some(json!({
            "status": "fail",
            "metadata": {"reason": "cancelled"},
            "prd_summary": "cancelled by operator",
            "state_dir": "/tmp/r1"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "fail");
    assert_eq!(run["prd_summary"], "cancelled by operator");
    assert_eq!(run["state_dir"], "/tmp/r1");
    assert!(run["total_duration_ms"].is_number());

    let (status, body) = send(&app, "PATCH", "/runs/r1", Some(json!({"status": "running"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "invalid_transition");

    let (status, body) = send(&app, "DELETE", "/runs/r1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_null());

    let (status, _) = send(&app, "GET", "/runs/r1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_and_manual_stuck_scan() {
    let app = test_router();
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    create(&app, "r1").await;
    post_event(
        &app,
        "r1",
        json!({"phase": "B", "substep": "b2", "status": "start"}),
    )
    .await;

    // Default threshold: nothing is old enough yet.
    let (status, report) = send(&app, "POST", "/maintenance/stuck-scan", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["marked"].as_array().unwrap().len(), 0);

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let (_, report) = send(&app, "POST", "/maintenance/stuck-scan?threshold_ms=0", None).await;
    assert_eq!(report["marked"], json!(["r1"]));

    let (_, run) = send(&app, "GET", "/runs/r1", None).await;
    assert_eq!(run["status"], "stuck");
}
