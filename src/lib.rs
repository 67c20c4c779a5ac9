//! # workflow-tracker
//!
//! Run tracking for multi-phase automation pipelines.
//!
//! An external executor creates a run, then reports progress as a stream of
//! timestamped events. The tracker keeps each run's status and position,
//! projects a phase/substep progress tree from the event history, formats a
//! display timeline, and flags runs that stall on an open step.
//!
//! Storage is pluggable behind [`store::RunStore`]: Postgres via sqlx
//! ([`db::Db`]) or an in-memory adapter ([`store::MemoryStore`]).

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod steps;
pub mod store;
pub mod telemetry;
pub mod tracker;
