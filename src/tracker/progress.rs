//! Progress projection: folds a run's event log over its step definition
//! into a per-phase, per-substep status tree.
//!
//! The projection is a pure function of (definition, events). Declared
//! phases and substeps come first in definition order. Pairs that only
//! appear in the event log are appended in first-seen order, under their
//! own phase if it is declared, otherwise after all declared phases.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::Tracker;
use crate::error::Result;
use crate::model::{Event, EventStatus, Page, Run};
use crate::steps::StepsDefinition;

/// Derived status of a substep or phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Fail,
    Stuck,
}

impl From<EventStatus> for StepStatus {
    fn from(status: EventStatus) -> Self {
        match status {
            EventStatus::Start => StepStatus::Running,
            EventStatus::Success => StepStatus::Success,
            EventStatus::Fail => StepStatus::Fail,
            EventStatus::Stuck => StepStatus::Stuck,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubstepProgress {
    pub id: String,
    pub name: String,
    pub status: StepStatus,
    pub optional: bool,
    pub timeout_sec: u64,
    /// False for substeps seen only in the event log.
    pub declared: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseProgress {
    pub name: String,
    pub status: StepStatus,
    pub declared: bool,
    pub substeps: Vec<SubstepProgress>,
}

/// A run together with its projected progress tree.
#[derive(Debug, Clone, Serialize)]
pub struct RunWithProgress {
    #[serde(flatten)]
    pub run: Run,
    pub phases: Vec<PhaseProgress>,
    pub events_count: u64,
    pub last_event: Option<Event>,
}

/// Project `events` over `def`.
pub fn project(def: &StepsDefinition, events: &[Event]) -> Vec<PhaseProgress> {
    let index = EventIndex::build(events);

    let mut phases: Vec<PhaseProgress> = def
        .phases
        .iter()
        .map(|phase| {
            let mut substeps: Vec<SubstepProgress> = phase
                .substeps
                .iter()
                .map(|step| {
                    let mut row = substep_progress(
                        &step.id,
                        step.display_name(),
                        step.optional,
                        true,
                        index.events_for(&phase.name, &step.id),
                    );
                    row.timeout_sec = def.timeout_for(&phase.name, &step.id);
                    row
                })
                .collect();
            substeps.extend(index.undeclared_in(def, &phase.name));
            phase_progress(&phase.name, true, substeps)
        })
        .collect();

    for name in &index.phase_order {
        if def.phase(name).is_none() {
            phases.push(phase_progress(name, false, index.undeclared_in(def, name)));
        }
    }

    phases
}

/// Events grouped per (phase, substep), with first-seen ordering.
struct EventIndex<'a> {
    by_pair: HashMap<(&'a str, &'a str), Vec<&'a Event>>,
    pair_order: Vec<(&'a str, &'a str)>,
    phase_order: Vec<&'a str>,
}

impl<'a> EventIndex<'a> {
    fn build(events: &'a [Event]) -> Self {
        let mut ordered: Vec<&Event> = events.iter().collect();
        ordered.sort_by_key(|e| (e.created_at, e.id));

        let mut index = EventIndex {
            by_pair: HashMap::new(),
            pair_order: Vec::new(),
            phase_order: Vec::new(),
        };
        for event in ordered {
            let key = (event.phase.as_str(), event.substep.as_str());
            let slot = index.by_pair.entry(key).or_default();
            if slot.is_empty() {
                index.pair_order.push(key);
            }
            slot.push(event);
            if !index.phase_order.contains(&key.0) {
                index.phase_order.push(key.0);
            }
        }
        index
    }

    fn events_for(&self, phase: &str, substep: &str) -> &[&'a Event] {
        self.pair_order
            .iter()
            .find(|(p, s)| *p == phase && *s == substep)
            .and_then(|key| self.by_pair.get(key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn undeclared_in(&self, def: &StepsDefinition, phase: &str) -> Vec<SubstepProgress> {
        self.pair_order
            .iter()
            .filter(|(p, s)| *p == phase && def.substep(p, s).is_none())
            .map(|(p, s)| {
                let mut row = substep_progress(s, s, false, false, self.events_for(p, s));
                row.timeout_sec = def.default_timeout_sec;
                row
            })
            .collect()
    }
}

fn substep_progress(
    id: &str,
    name: &str,
    optional: bool,
    declared: bool,
    events: &[&Event],
) -> SubstepProgress {
    let mut progress = SubstepProgress {
        id: id.to_string(),
        name: name.to_string(),
        status: StepStatus::Pending,
        optional,
        timeout_sec: 0,
        declared,
        started_at: None,
        ended_at: None,
        duration_ms: None,
        message: None,
    };

    let Some((last, earlier)) = events.split_last() else {
        return progress;
    };

    progress.status = last.status.into();
    progress.message = last.message.clone();

    if last.status == EventStatus::Start {
        progress.started_at = Some(last.created_at);
        return progress;
    }

    let start = earlier
        .iter()
        .rev()
        .find(|e| e.status == EventStatus::Start);
    progress.started_at = start.map(|s| s.created_at);
    progress.ended_at = Some(last.created_at);
    progress.duration_ms = last
        .duration_ms
        .or_else(|| start.map(|s| (last.created_at - s.created_at).num_milliseconds()));
    progress
}

fn phase_progress(name: &str, declared: bool, substeps: Vec<SubstepProgress>) -> PhaseProgress {
    PhaseProgress {
        name: name.to_string(),
        status: phase_status(&substeps),
        declared,
        substeps,
    }
}

/// Phase status from its substeps.
///
/// Optional substeps never block success but cannot carry it alone either:
/// a phase whose only success is optional stays pending until a required
/// substep also runs, unless every substep is optional.
fn phase_status(substeps: &[SubstepProgress]) -> StepStatus {
    let any = |status: StepStatus| substeps.iter().any(|s| s.status == status);

    if any(StepStatus::Fail) {
        return StepStatus::Fail;
    }
    if any(StepStatus::Running) || any(StepStatus::Stuck) {
        return StepStatus::Running;
    }
    let settled = substeps
        .iter()
        .all(|s| s.status == StepStatus::Success || (s.optional && s.status == StepStatus::Pending));
    if settled && any(StepStatus::Success) {
        StepStatus::Success
    } else {
        StepStatus::Pending
    }
}

impl Tracker {
    /// A run with its progress tree, event count and latest event.
    pub async fn get_run_with_progress(&self, run_id: &str) -> Result<RunWithProgress> {
        let run = self.get_run(run_id).await?;
        let events = self.store.list_events(run_id, Page::all()).await?;
        let definition = self.steps.resolve(&run.bundle);

        let phases = project(&definition, &events);
        Ok(RunWithProgress {
            run,
            phases,
            events_count: events.len() as u64,
            last_event: events.last().cloned(),
        })
    }
}
