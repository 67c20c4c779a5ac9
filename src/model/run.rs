//! Run records and the run status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// One execution of a bundle, tracked from creation to a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Internal surrogate key assigned by the store.
    pub id: i64,

    /// Correlation key supplied by the triggering executor.
    pub run_id: String,

    /// Which step definition applies.
    pub bundle: String,

    pub workflow: Option<String>,
    pub prd_summary: Option<String>,
    pub state_dir: Option<String>,

    /// Phase/substep of the most recently ingested event. Last write wins.
    pub current_phase: Option<String>,
    pub current_substep: Option<String>,

    pub status: RunStatus,

    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_duration_ms: Option<i64>,

    /// Free-form annotations. The tracker doesn't interpret these.
    pub metadata: serde_json::Value,

    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Milliseconds between `started_at` and `at`, floored at zero.
    pub fn elapsed_ms(&self, at: DateTime<Utc>) -> i64 {
        (at - self.started_at).num_milliseconds().max(0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Accepting events.
    Running,
    /// Last substep of the last phase succeeded. Terminal.
    Success,
    /// A substep reported failure, or an operator cancelled. Terminal.
    Fail,
    /// An open step outlived the stuck threshold. Recoverable.
    Stuck,
}

impl RunStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, to),
            (Running, Stuck)
                | (Stuck, Running)
                | (Running, Success)
                | (Running, Fail)
                | (Stuck, Success)
                | (Stuck, Fail)
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Fail)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Fail => "fail",
            RunStatus::Stuck => "stuck",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "fail" => Ok(RunStatus::Fail),
            "stuck" => Ok(RunStatus::Stuck),
            other => Err(Error::Validation(format!("unknown run status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for creating new runs.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub run_id: String,
    pub bundle: String,
    pub workflow: Option<String>,
    pub prd_summary: Option<String>,
    pub state_dir: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewRun {
    pub fn new(run_id: impl Into<String>, bundle: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            bundle: bundle.into(),
            workflow: None,
            prd_summary: None,
            state_dir: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = Some(workflow.into());
        self
    }

    pub fn prd_summary(mut self, summary: impl Into<String>) -> Self {
        self.prd_summary = Some(summary.into());
        self
    }

    pub fn state_dir(mut self, dir: impl Into<String>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

// ---------------------------------------------------------------------------
// Partial update
// ---------------------------------------------------------------------------

/// Partial write to a run. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    pub workflow: Option<String>,
    pub prd_summary: Option<String>,
    pub state_dir: Option<String>,
    pub current_phase: Option<String>,
    pub current_substep: Option<String>,
    pub status: Option<RunStatus>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_duration_ms: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

impl RunUpdate {
    /// Move the position pointer only.
    pub fn pointer(phase: impl Into<String>, substep: impl Into<String>) -> Self {
        Self {
            current_phase: Some(phase.into()),
            current_substep: Some(substep.into()),
            ..Self::default()
        }
    }

    /// Close the run with a terminal status at `at`.
    pub fn close(mut self, run: &Run, status: RunStatus, at: DateTime<Utc>) -> Self {
        self.status = Some(status);
        self.ended_at = Some(at);
        self.total_duration_ms = Some(run.elapsed_ms(at));
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// True when the update touches anything besides metadata.
    pub fn touches_lifecycle(&self) -> bool {
        Self {
            metadata: None,
            ..self.clone()
        } != Self::default()
    }

    /// What this update moves the run to, for transition errors.
    pub fn target(&self) -> &'static str {
        self.status.map_or("update", RunStatus::as_str)
    }

    /// Apply the set fields onto `run`.
    pub fn apply_to(&self, run: &mut Run) {
        if let Some(ref workflow) = self.workflow {
            run.workflow = Some(workflow.clone());
        }
        if let Some(ref summary) = self.prd_summary {
            run.prd_summary = Some(summary.clone());
        }
        if let Some(ref dir) = self.state_dir {
            run.state_dir = Some(dir.clone());
        }
        if let Some(ref phase) = self.current_phase {
            run.current_phase = Some(phase.clone());
        }
        if let Some(ref substep) = self.current_substep {
            run.current_substep = Some(substep.clone());
        }
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(ended_at) = self.ended_at {
            run.ended_at = Some(ended_at);
        }
        if let Some(ms) = self.total_duration_ms {
            run.total_duration_ms = Some(ms);
        }
        if let Some(ref metadata) = self.metadata {
            run.metadata = metadata.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub const DEFAULT_RUN_LIMIT: i64 = 50;
pub const DEFAULT_EVENT_LIMIT: i64 = 100;

/// Filters for run listing. Newest first.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub bundle: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl RunFilter {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_RUN_LIMIT).max(0)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

/// Window over an ordered event list. `limit: None` means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct Page {
    pub limit: Option<i64>,
    pub offset: i64,
}

impl Page {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn first(limit: i64) -> Self {
        Self {
            limit: Some(limit),
            offset: 0,
        }
    }

    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Self {
        Self {
            limit: Some(limit.unwrap_or(DEFAULT_EVENT_LIMIT).max(0)),
            offset: offset.unwrap_or(0).max(0),
        }
    }
}

/// Run listing with the aggregate counts list views show.
#[derive(Debug, Clone, Serialize)]
pub struct RunList {
    pub runs: Vec<Run>,
    pub running_count: u64,
    pub total_count: u64,
}
