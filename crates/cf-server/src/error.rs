//! Error-to-HTTP response conversion.
//!
//! Handlers return `Result<T, AppError>`; any [`cf_core::Error`] converts
//! with `?`. Failed jobs are reported through the same body shape using the
//! error kind recorded on the job.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use cf_core::{ErrorKind, Job};

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    kind: ErrorKind,
    message: String,
    request_id: Option<String>,
}

impl AppError {
    pub fn new(inner: cf_core::Error) -> Self {
        Self {
            status: StatusCode::from_u16(inner.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            kind: inner.kind(),
            message: inner.to_string(),
            request_id: None,
        }
    }

    /// The response for a job that ended `Failed` or `Cancelled`.
    pub fn from_job(job: &Job) -> Self {
        let kind = job.error_kind.unwrap_or(ErrorKind::Internal);
        let message = match (&job.error_message, kind) {
            (Some(message), _) => message.clone(),
            (None, ErrorKind::Cancelled) => "Job cancelled".to_string(),
            (None, _) => format!("Job ended in state {}", job.state),
        };
        Self {
            status: StatusCode::from_u16(kind.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            kind,
            message,
            request_id: None,
        }
    }

    /// 409 for an operation the job's current state does not allow.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            kind: ErrorKind::InvalidTransition,
            message: message.into(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<cf_core::Error> for AppError {
    fn from(e: cf_core::Error) -> Self {
        Self::new(e)
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "Server error in API handler");
        }

        let body = json!({
            "error": self.message,
            "code": self.kind,
            "request_id": self.request_id,
        });

        (self.status, axum::Json(body)).into_response()
    }
}
