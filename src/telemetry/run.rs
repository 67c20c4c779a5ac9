//! Span helpers for run event ingestion.

use tracing::Span;

/// Start a span covering the ingestion of one event.
///
/// `run.status` is declared empty and filled by [`record_state_transition`].
pub fn start_event_span(run_id: &str, phase: &str, substep: &str) -> Span {
    tracing::info_span!(
        "run.event",
        "run.id" = run_id,
        "run.phase" = phase,
        "run.substep" = substep,
        "run.status" = tracing::field::Empty,
    )
}

/// Record a run status transition on `span`.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("run.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
