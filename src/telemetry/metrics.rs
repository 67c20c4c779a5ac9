//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider these are no-ops, which keeps tests free of setup.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("workflow-tracker")
}

/// Counter: runs created.
/// Labels: `bundle`.
pub fn runs_created() -> Counter<u64> {
    meter()
        .u64_counter("wftrack.runs.created")
        .with_description("Number of workflow runs created")
        .build()
}

/// Counter: events ingested.
/// Labels: `status`, `event_type`.
pub fn events_ingested() -> Counter<u64> {
    meter()
        .u64_counter("wftrack.events.ingested")
        .with_description("Number of run events ingested")
        .build()
}

/// Counter: run status transitions.
/// Labels: `from`, `to`.
pub fn run_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("wftrack.runs.state_transitions")
        .with_description("Number of run status transitions")
        .build()
}

/// Counter: runs flipped to stuck by the detector.
pub fn runs_marked_stuck() -> Counter<u64> {
    meter()
        .u64_counter("wftrack.runs.marked_stuck")
        .with_description("Runs marked stuck by the stuck detector")
        .build()
}

/// Counter: per-run failures inside a stuck scan.
pub fn stuck_scan_failures() -> Counter<u64> {
    meter()
        .u64_counter("wftrack.stuck_scan.failures")
        .with_description("Runs the stuck detector failed to update")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("wftrack.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
