//! Error types for workflow-tracker.

use thiserror::Error;

use crate::model::RunStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("run already exists: {0}")]
    DuplicateRun(String),

    #[error("invalid transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: String,
        from: RunStatus,
        to: String,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::RunNotFound(_) => "run_not_found",
            Error::DuplicateRun(_) => "duplicate_run",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::Validation(_) => "validation_error",
            Error::Storage(_) => "storage_error",
            Error::Config(_) => "config_error",
            Error::Io(_) => "io_error",
            Error::Other(_) => "internal_error",
        }
    }

    /// Errors caused by the caller rather than by the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::RunNotFound(_)
                | Error::DuplicateRun(_)
                | Error::InvalidTransition { .. }
                | Error::Validation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
