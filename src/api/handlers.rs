//! Axum route handlers for the run tracking API.
//!
//! Request bodies carry enums as plain strings so that unknown values come
//! back as `validation_error` rather than an extractor rejection. Bodies and
//! query strings that fail to decode at all get the same treatment.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::AppState;
use super::error::ApiError;
use crate::error::Error;
use crate::model::{
    Event, EventStatus, EventType, NewEvent, NewRun, Page, Run, RunFilter, RunList, RunStatus,
    RunUpdate,
};
use crate::tracker::{EventStream, RunWithProgress, StuckReport};

type ApiResult<T> = Result<T, ApiError>;

/// Parse an optional enum field; blank counts as absent.
fn parse_opt<T>(raw: Option<&str>) -> Result<Option<T>, Error>
where
    T: std::str::FromStr<Err = Error>,
{
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .transpose()
}

/// Unwrap a JSON body; a rejection becomes a validation error.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Error> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| Error::Validation(rejection.body_text()))
}

fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, Error> {
    query
        .map(|Query(params)| params)
        .map_err(|rejection| Error::Validation(rejection.body_text()))
}

// =====================================================
// Runs
// =====================================================

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub bundle: String,
    pub workflow: Option<String>,
    pub prd_summary: Option<String>,
    pub state_dir: Option<String>,
    pub metadata: Option<Value>,
}

impl From<CreateRunRequest> for NewRun {
    fn from(req: CreateRunRequest) -> Self {
        let mut new = NewRun::new(req.run_id, req.bundle);
        new.workflow = req.workflow;
        new.prd_summary = req.prd_summary;
        new.state_dir = req.state_dir;
        if let Some(metadata) = req.metadata {
            new = new.metadata(metadata);
        }
        new
    }
}

// POST /runs
pub async fn create_run(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateRunRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    let req = json_body(payload).map_err(|e| ApiError::new(e, "create_run"))?;
    let run_id = req.run_id.clone();
    let run = state
        .tracker
        .create_run(req.into())
        .await
        .map_err(|e| ApiError::for_run(e, "create_run", &run_id))?;
    Ok((StatusCode::CREATED, Json(run)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListRunsQuery {
    pub status: Option<String>,
    pub bundle: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// GET /runs
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListRunsQuery>, QueryRejection>,
) -> ApiResult<Json<RunList>> {
    let query = query_params(query).map_err(|e| ApiError::new(e, "list_runs"))?;
    let filter = RunFilter {
        status: parse_opt::<RunStatus>(query.status.as_deref())
            .map_err(|e| ApiError::new(e, "list_runs"))?,
        bundle: query.bundle.filter(|b| !b.is_empty()),
        limit: query.limit,
        offset: query.offset,
    };
    let list = state
        .tracker
        .list_runs(&filter)
        .await
        .map_err(|e| ApiError::new(e, "list_runs"))?;
    Ok(Json(list))
}

// GET /runs/:id
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunWithProgress>> {
    let run = state
        .tracker
        .get_run_with_progress(&run_id)
        .await
        .map_err(|e| ApiError::for_run(e, "get_run", &run_id))?;
    Ok(Json(run))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateRunRequest {
    pub workflow: Option<String>,
    pub prd_summary: Option<String>,
    pub state_dir: Option<String>,
    pub current_phase: Option<String>,
    pub current_substep: Option<String>,
    pub status: Option<String>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_duration_ms: Option<i64>,
    pub metadata: Option<Value>,
}

impl TryFrom<UpdateRunRequest> for RunUpdate {
    type Error = Error;

    fn try_from(req: UpdateRunRequest) -> Result<Self, Error> {
        Ok(RunUpdate {
            workflow: req.workflow,
            prd_summary: req.prd_summary,
            state_dir: req.state_dir,
            current_phase: req.current_phase,
            current_substep: req.current_substep,
            status: parse_opt(req.status.as_deref())?,
            ended_at: req.ended_at,
            total_duration_ms: req.total_duration_ms,
            metadata: req.metadata,
        })
    }
}

// PATCH /runs/:id
pub async fn update_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    payload: Result<Json<UpdateRunRequest>, JsonRejection>,
) -> ApiResult<Json<Run>> {
    let fail = |e| ApiError::for_run(e, "update_run", &run_id);
    let update = json_body(payload)
        .and_then(RunUpdate::try_from)
        .map_err(fail)?;
    let run = state
        .tracker
        .update_run(&run_id, update)
        .await
        .map_err(fail)?;
    Ok(Json(run))
}

// DELETE /runs/:id
pub async fn delete_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .tracker
        .delete_run(&run_id)
        .await
        .map_err(|e| ApiError::for_run(e, "delete_run", &run_id))?;
    Ok(StatusCode::NO_CONTENT)
}

// =====================================================
// Events
// =====================================================

#[derive(Debug, Default, Deserialize)]
pub struct EmitEventRequest {
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub substep: String,
    pub status: Option<String>,
    pub message: Option<String>,
    pub duration_ms: Option<i64>,
    pub event_type: Option<String>,
    pub description: Option<String>,
    pub details: Option<Value>,
}

impl TryFrom<EmitEventRequest> for NewEvent {
    type Error = Error;

    fn try_from(req: EmitEventRequest) -> Result<Self, Error> {
        let status: EventStatus = parse_opt(req.status.as_deref())?.ok_or_else(|| {
            Error::Validation("phase, substep, and status are required".to_string())
        })?;
        Ok(NewEvent {
            phase: req.phase,
            substep: req.substep,
            status,
            message: req.message,
            duration_ms: req.duration_ms,
            event_type: parse_opt::<EventType>(req.event_type.as_deref())?,
            description: req.description,
            details: req.details,
        })
    }
}

// POST /runs/:id/events
pub async fn emit_event(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    payload: Result<Json<EmitEventRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Event>)> {
    let fail = |e| ApiError::for_run(e, "emit_event", &run_id);
    let event = json_body(payload)
        .and_then(NewEvent::try_from)
        .map_err(fail)?;
    let stored = state
        .tracker
        .emit_event(&run_id, event)
        .await
        .map_err(fail)?;
    Ok((StatusCode::CREATED, Json(stored)))
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct EventList {
    pub events: Vec<Event>,
}

// GET /runs/:id/events
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> ApiResult<Json<EventList>> {
    let query = query_params(query).map_err(|e| ApiError::for_run(e, "list_events", &run_id))?;
    let events = state
        .tracker
        .list_events(&run_id, Page::new(query.limit, query.offset))
        .await
        .map_err(|e| ApiError::for_run(e, "list_events", &run_id))?;
    Ok(Json(EventList { events }))
}

// GET /runs/:id/stream
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<EventStream>> {
    let stream = state
        .tracker
        .event_stream(&run_id)
        .await
        .map_err(|e| ApiError::for_run(e, "event_stream", &run_id))?;
    Ok(Json(stream))
}

// =====================================================
// Operations
// =====================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> ApiResult<Json<HealthResponse>> {
    state
        .tracker
        .store()
        .health_check()
        .await
        .map_err(|e| ApiError::new(e, "health"))?;
    Ok(Json(HealthResponse { status: "ok" }))
}

#[derive(Debug, Default, Deserialize)]
pub struct StuckScanQuery {
    pub threshold_ms: Option<u64>,
}

// POST /maintenance/stuck-scan
pub async fn stuck_scan(
    State(state): State<Arc<AppState>>,
    query: Result<Query<StuckScanQuery>, QueryRejection>,
) -> ApiResult<Json<StuckReport>> {
    let query = query_params(query).map_err(|e| ApiError::new(e, "stuck_scan"))?;
    let threshold = query
        .threshold_ms
        .map(Duration::from_millis)
        .unwrap_or(state.stuck_threshold);
    let report = state
        .tracker
        .detect_and_mark_stuck(threshold)
        .await
        .map_err(|e| ApiError::new(e, "stuck_scan"))?;
    Ok(Json(report))
}
