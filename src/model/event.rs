//! Progress events reported by the executor driving a run.
//!
//! Events are append-only. The tracker never validates `phase`/`substep`
//! against the bundle's step definition: unknown pairs are recorded as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A timestamped fact about a run's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Store-assigned, increasing within a store.
    pub id: i64,
    pub run_id: String,
    pub phase: String,
    pub substep: String,
    pub status: EventStatus,
    pub message: Option<String>,
    pub duration_ms: Option<i64>,
    /// Display category only. Never drives state transitions.
    pub event_type: Option<EventType>,
    pub description: Option<String>,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Does this event belong to the given (phase, substep) pair?
    pub fn is_for(&self, phase: &str, substep: &str) -> bool {
        self.phase == phase && self.substep == substep
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Start,
    Success,
    Fail,
    Stuck,
}

impl EventStatus {
    /// Terminal for the (phase, substep) pair, not necessarily for the run.
    pub fn is_terminal(self) -> bool {
        !matches!(self, EventStatus::Start)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Start => "start",
            EventStatus::Success => "success",
            EventStatus::Fail => "fail",
            EventStatus::Stuck => "stuck",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(EventStatus::Start),
            "success" => Ok(EventStatus::Success),
            "fail" => Ok(EventStatus::Fail),
            "stuck" => Ok(EventStatus::Stuck),
            other => Err(Error::Validation(format!("unknown event status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Type
// ---------------------------------------------------------------------------

/// Semantic category of an event, used for timeline rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PrdRead,
    AiUnderstand,
    TaskStart,
    TaskComplete,
    FileWrite,
    ClaudeCall,
    QcResult,
    Decision,
    Error,
    Info,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::PrdRead => "prd_read",
            EventType::AiUnderstand => "ai_understand",
            EventType::TaskStart => "task_start",
            EventType::TaskComplete => "task_complete",
            EventType::FileWrite => "file_write",
            EventType::ClaudeCall => "claude_call",
            EventType::QcResult => "qc_result",
            EventType::Decision => "decision",
            EventType::Error => "error",
            EventType::Info => "info",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "prd_read" => EventType::PrdRead,
            "ai_understand" => EventType::AiUnderstand,
            "task_start" => EventType::TaskStart,
            "task_complete" => EventType::TaskComplete,
            "file_write" => EventType::FileWrite,
            "claude_call" => EventType::ClaudeCall,
            "qc_result" => EventType::QcResult,
            "decision" => EventType::Decision,
            "error" => EventType::Error,
            "info" => EventType::Info,
            other => return Err(Error::Validation(format!("unknown event type: {other}"))),
        })
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for events about to be ingested.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub phase: String,
    pub substep: String,
    pub status: EventStatus,
    pub message: Option<String>,
    pub duration_ms: Option<i64>,
    pub event_type: Option<EventType>,
    pub description: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl NewEvent {
    pub fn new(phase: impl Into<String>, substep: impl Into<String>, status: EventStatus) -> Self {
        Self {
            phase: phase.into(),
            substep: substep.into(),
            status,
            message: None,
            duration_ms: None,
            event_type: None,
            description: None,
            details: None,
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn duration_ms(mut self, ms: i64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Required fields must be non-blank.
    pub fn validate(&self) -> Result<()> {
        if self.phase.trim().is_empty() || self.substep.trim().is_empty() {
            return Err(Error::Validation(
                "phase, substep, and status are required".to_string(),
            ));
        }
        if self.duration_ms.is_some_and(|ms| ms < 0) {
            return Err(Error::Validation(
                "duration_ms must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Materialize the event with store-assigned identity.
    pub fn into_event(self, id: i64, run_id: &str, created_at: DateTime<Utc>) -> Event {
        Event {
            id,
            run_id: run_id.to_string(),
            phase: self.phase,
            substep: self.substep,
            status: self.status,
            message: self.message,
            duration_ms: self.duration_ms,
            event_type: self.event_type,
            description: self.description,
            details: self.details,
            created_at,
        }
    }
}
