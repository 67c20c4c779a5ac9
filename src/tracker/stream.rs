//! Timeline formatting for the dashboard "thinking stream".

use serde::Serialize;
use serde_json::Value;

use super::Tracker;
use crate::error::Result;
use crate::model::{Event, EventStatus, EventType, Page, Run};

/// Maximum number of events returned by [`Tracker::event_stream`].
pub const STREAM_LIMIT: i64 = 500;

/// Longest `details.content` excerpt shown before truncation.
const CONTENT_PREVIEW_CHARS: usize = 100;

const GENERIC_ICON: &str = "ℹ️";

/// Display category of a timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    Info,
    Ai,
    Action,
    Success,
    Error,
}

/// One timeline entry derived from an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    pub id: i64,
    /// `HH:MM:SS`, UTC.
    pub time: String,
    pub icon: String,
    pub title: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: StreamEventType,
    pub expandable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// A run plus its formatted timeline.
#[derive(Debug, Clone, Serialize)]
pub struct EventStream {
    pub run: Run,
    pub events: Vec<StreamEvent>,
}

/// Format a raw event for timeline display. Pure.
pub fn format_event_to_stream(event: &Event) -> StreamEvent {
    let (icon, title, kind) = presentation(event);
    let expandable = has_details(event.details.as_ref());

    StreamEvent {
        id: event.id,
        time: event.created_at.format("%H:%M:%S").to_string(),
        icon: icon.to_string(),
        title,
        content: content_of(event),
        kind,
        expandable,
        details: if expandable { event.details.clone() } else { None },
    }
}

fn presentation(event: &Event) -> (&'static str, String, StreamEventType) {
    let fixed = |icon, title: &str, kind| (icon, title.to_string(), kind);

    match event.event_type {
        Some(EventType::PrdRead) => fixed("📖", "Read PRD", StreamEventType::Info),
        Some(EventType::AiUnderstand) => fixed("🧠", "AI analysis", StreamEventType::Ai),
        Some(EventType::TaskStart) => (
            "📝",
            format!("Task started: {}", event.substep),
            StreamEventType::Action,
        ),
        Some(EventType::TaskComplete) => fixed("✅", "Task complete", StreamEventType::Success),
        Some(EventType::FileWrite) => fixed("💾", "File written", StreamEventType::Info),
        Some(EventType::ClaudeCall) => fixed("🤖", "Model call", StreamEventType::Ai),
        Some(EventType::QcResult) => {
            let kind = if event.status == EventStatus::Fail {
                StreamEventType::Error
            } else {
                StreamEventType::Success
            };
            fixed("🔍", "QC result", kind)
        }
        Some(EventType::Decision) => fixed("⚖️", "Decision", StreamEventType::Ai),
        Some(EventType::Error) => fixed("❌", "Error", StreamEventType::Error),
        Some(EventType::Info) => (GENERIC_ICON, event.substep.clone(), StreamEventType::Info),
        None => by_status(event),
    }
}

fn by_status(event: &Event) -> (&'static str, String, StreamEventType) {
    let label = format!("{} / {}", event.phase, event.substep);
    match event.status {
        EventStatus::Start => ("▶️", label, StreamEventType::Action),
        EventStatus::Success => ("✅", label, StreamEventType::Success),
        EventStatus::Fail => ("❌", label, StreamEventType::Error),
        EventStatus::Stuck => ("⚠️", label, StreamEventType::Error),
    }
}

fn has_details(details: Option<&Value>) -> bool {
    match details {
        None | Some(Value::Null) => false,
        Some(Value::Object(map)) => !map.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Strings without quotes, everything else as JSON.
fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn preview(value: &Value) -> String {
    let full = text(value);
    if full.chars().count() <= CONTENT_PREVIEW_CHARS {
        return full;
    }
    let cut: String = full.chars().take(CONTENT_PREVIEW_CHARS).collect();
    format!("{cut}...")
}

/// First applicable of: description, details summary, message, duration.
fn content_of(event: &Event) -> String {
    if let Some(description) = event.description.as_deref().filter(|d| !d.is_empty()) {
        return description.to_string();
    }

    if let Some(Value::Object(details)) = &event.details {
        if let Some(Value::Array(tasks)) = details.get("tasks") {
            return format!("split into {} subtasks", tasks.len());
        }
        if let Some(content) = details.get("content") {
            return preview(content);
        }
        if let Some(path) = details.get("path") {
            return match details.get("lines") {
                Some(lines) => format!("{} ({} lines)", text(path), text(lines)),
                None => text(path),
            };
        }
        if let Some(score) = details.get("score") {
            return format!("score: {}", text(score));
        }
        if let Some(action) = details.get("action") {
            return match details.get("reason") {
                Some(reason) => format!("{}: {}", text(action), text(reason)),
                None => text(action),
            };
        }
    }

    if let Some(message) = event.message.as_deref().filter(|m| !m.is_empty()) {
        return message.to_string();
    }

    match event.duration_ms {
        Some(ms) if ms > 0 => format!("took {}s", (ms as f64 / 1000.0).round() as i64),
        _ => String::new(),
    }
}

impl Tracker {
    /// The run and its first [`STREAM_LIMIT`] events, formatted for display.
    pub async fn event_stream(&self, run_id: &str) -> Result<EventStream> {
        let run = self.get_run(run_id).await?;
        let events = self
            .store
            .list_events(run_id, Page::first(STREAM_LIMIT))
            .await?;

        Ok(EventStream {
            run,
            events: events.iter().map(format_event_to_stream).collect(),
        })
    }
}
