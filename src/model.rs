//! Core data model.
//!
//! A run is one execution of a pipeline bundle. Events are the append-only
//! facts an executor reports about that run's progress.

pub mod event;
pub mod run;

pub use event::{Event, EventStatus, EventType, NewEvent};
pub use run::{NewRun, Page, Run, RunFilter, RunList, RunStatus, RunUpdate};
