use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;

// ===================================================================
//                          JOB / ENGINE ERRORS
// ===================================================================

/// A user-supplied option that could not be turned into an invocation plan.
/// Always reported before any process is launched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid value for `{field}`: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self { field, message: message.into() }
    }
}

/// Errors raised while launching the external engine. Anything that happens
/// after a successful launch is reported through `JobOutcome` instead.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{binary} is not installed; install it or place it in {hint}")]
    BinaryMissing { binary: &'static str, hint: String },

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not create output directory {path}: {source}")]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session has already been started")]
    AlreadyStarted,
}

/// Errors surfaced by the job controller when a job is refused.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Launch(#[from] SessionError),

    #[error("a download is already in progress")]
    Busy,
}

// ===================================================================
//                          HTTP ERRORS
// ===================================================================

// Define our custom error type
pub enum AppError {
    Internal(anyhow::Error),
    YtDlp(String),
    BadRequest(String),
    NotFound(String),
    Conflict(String),
}

impl AppError {
    /// Maps a refused job onto the matching HTTP status.
    pub fn job(err: JobError) -> Self {
        match err {
            JobError::Validation(e) => AppError::BadRequest(e.to_string()),
            JobError::Busy => AppError::Conflict(err.to_string()),
            JobError::Launch(SessionError::BinaryMissing { .. }) => AppError::YtDlp(err.to_string()),
            JobError::Launch(e) => AppError::Internal(e.into()),
        }
    }
}

// This implementation allows us to convert our AppError into a valid HTTP response.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Internal(e) => {
                // Log the full error for debugging
                tracing::error!("Internal server error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred".to_string(),
                )
            }
            AppError::YtDlp(e) => (StatusCode::BAD_GATEWAY, format!("yt-dlp error: {}", e)),
            AppError::BadRequest(e) => (StatusCode::BAD_REQUEST, e),
            AppError::NotFound(e) => (StatusCode::NOT_FOUND, e),
            AppError::Conflict(e) => (StatusCode::CONFLICT, e),
        };

        let body = Json(json!({ "error": error_message }));
        (status, body).into_response()
    }
}

// Lets handlers use `?` on anything that converts into `anyhow::Error`.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Internal(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_names_the_field() {
        let err = ValidationError::new("playlist_start", "must be a positive integer");
        assert_eq!(
            err.to_string(),
            "invalid value for `playlist_start`: must be a positive integer"
        );
    }

    #[test]
    fn job_errors_map_to_distinct_statuses() {
        let busy = AppError::job(JobError::Busy).into_response();
        assert_eq!(busy.status(), StatusCode::CONFLICT);

        let invalid = AppError::job(ValidationError::new("url", "must not be empty").into()).into_response();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let missing = AppError::job(JobError::Launch(SessionError::BinaryMissing {
            binary: "yt-dlp",
            hint: "deps".to_string(),
        }))
        .into_response();
        assert_eq!(missing.status(), StatusCode::BAD_GATEWAY);
    }
}
