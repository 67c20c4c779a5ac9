//! HTTP surface consumed by pipeline executors and the dashboard.

pub mod error;
pub mod handlers;

pub use error::ApiError;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::tracker::{DEFAULT_STUCK_THRESHOLD, Tracker};

pub struct AppState {
    pub tracker: Tracker,
    /// Threshold for manual scans that don't pass their own.
    pub stuck_threshold: Duration,
}

impl AppState {
    pub fn new(tracker: Tracker) -> Self {
        Self {
            tracker,
            stuck_threshold: DEFAULT_STUCK_THRESHOLD,
        }
    }

    pub fn with_stuck_threshold(mut self, threshold: Duration) -> Self {
        self.stuck_threshold = threshold;
        self
    }
}

/// Build the router with all routes and layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/runs",
            get(handlers::list_runs).post(handlers::create_run),
        )
        .route(
            "/runs/:id",
            get(handlers::get_run)
                .patch(handlers::update_run)
                .delete(handlers::delete_run),
        )
        .route(
            "/runs/:id/events",
            get(handlers::list_events).post(handlers::emit_event),
        )
        .route("/runs/:id/stream", get(handlers::event_stream))
        .route("/health", get(handlers::health))
        .route("/maintenance/stuck-scan", post(handlers::stuck_scan))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}
