//! Mapping of tracker errors onto HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::error::Error;

/// A failed request. Carries the operation and run id for server-side logs.
#[derive(Debug)]
pub struct ApiError {
    error: Error,
    operation: &'static str,
    run_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    request_id: String,
    error: ErrorBody,
}

impl ApiError {
    pub fn new(error: Error, operation: &'static str) -> Self {
        Self {
            error,
            operation,
            run_id: None,
        }
    }

    pub fn for_run(error: Error, operation: &'static str, run_id: &str) -> Self {
        Self {
            run_id: Some(run_id.to_string()),
            ..Self::new(error, operation)
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.error {
            Error::RunNotFound(_) => StatusCode::NOT_FOUND,
            Error::DuplicateRun(_) | Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self::new(error, "request")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let request_id = uuid::Uuid::new_v4().to_string();

        let message = if self.error.is_client_error() {
            self.error.to_string()
        } else {
            tracing::error!(
                request_id = %request_id,
                operation = self.operation,
                run_id = self.run_id.as_deref().unwrap_or("-"),
                kind = self.error.kind(),
                error = %self.error,
                "request failed"
            );
            "internal error, see server logs".to_string()
        };

        let body = ErrorEnvelope {
            request_id,
            error: ErrorBody {
                kind: self.error.kind(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}
