//! # Error Handling
//!
//! Two layers of errors live here:
//! - [`CoreError`]: what the orchestration core returns. Every variant belongs to one
//!   [`ErrorKind`] so callers can tell a precondition violation from a missing
//!   credential or a remote rejection without parsing messages.
//! - [`AppError`]: what HTTP handlers return. It converts into a JSON response.
//!
//! ## Error Categories:
//! - **Caller**: wrong task status, unknown task, missing audio (400/404)
//! - **Configuration**: provider unavailable (503)
//! - **NotAvailable**: local model not downloaded yet (409)
//! - **Remote / Transient / Internal**: everything else (500)
//!
//! Remote and history errors are wrapped transparently so their messages reach the
//! task record unchanged.

use crate::history::HistoryError;
use crate::pipeline::task::TaskStatus;
use crate::remote::RemoteError;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification used for task error records and HTTP mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Caller,
    Configuration,
    NotAvailable,
    Remote,
    Transient,
    Internal,
}

/// Errors produced by the transcription core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task {task_id} must be in '{expected}' status, current: {actual}")]
    InvalidState {
        task_id: String,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("Task {0} has no audio file recorded")]
    MissingAudio(String),

    #[error("Audio file not found: {}", .0.display())]
    InputNotFound(PathBuf),

    #[error("Invalid source: {0}")]
    InvalidSource(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Model not available: {0}")]
    ModelNotAvailable(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Transcription failed: {0}")]
    Inference(String),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::TaskNotFound(_)
            | CoreError::InvalidState { .. }
            | CoreError::MissingAudio(_)
            | CoreError::InputNotFound(_)
            | CoreError::InvalidSource(_)
            | CoreError::UnknownModel(_) => ErrorKind::Caller,
            CoreError::ProviderUnavailable(_) => ErrorKind::Configuration,
            CoreError::ModelNotAvailable(_) => ErrorKind::NotAvailable,
            CoreError::Remote(e) if crate::retry::is_retryable(e) => ErrorKind::Transient,
            CoreError::Remote(_) => ErrorKind::Remote,
            CoreError::Download(_) => ErrorKind::Transient,
            CoreError::Inference(_) | CoreError::History(_) | CoreError::Io(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// Errors returned by HTTP handlers.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "caller_error",
///     "message": "Task abc must be in 'downloaded' status, current: queued",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "caller_error", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "not_available", msg),
            AppError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "provider_unavailable", msg)
            }
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let message = err.to_string();
        match (&err, err.kind()) {
            (CoreError::TaskNotFound(_), _) => AppError::NotFound(message),
            (_, ErrorKind::Caller) => AppError::BadRequest(message),
            (_, ErrorKind::Configuration) => AppError::Unavailable(message),
            (_, ErrorKind::NotAvailable) => AppError::Conflict(message),
            _ => AppError::Internal(message),
        }
    }
}

impl From<HistoryError> for AppError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::Invalid(msg) => AppError::BadRequest(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Blocking history calls run through `web::block`, which can fail on its own.
impl From<actix_web::error::BlockingError> for AppError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>` in handlers.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_caller_errors_map_to_bad_request() {
        let err = CoreError::InvalidState {
            task_id: "t1".to_string(),
            expected: TaskStatus::Downloaded,
            actual: TaskStatus::Queued,
        };
        assert_eq!(err.kind(), ErrorKind::Caller);
        assert_eq!(
            err.to_string(),
            "Task t1 must be in 'downloaded' status, current: queued"
        );

        let app: AppError = err.into();
        assert_eq!(app.error_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_unknown_task_is_not_found() {
        let app: AppError = CoreError::TaskNotFound("nope".to_string()).into();
        assert_eq!(app.error_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_provider_unavailable_is_configuration() {
        let err = CoreError::ProviderUnavailable("missing TINGWU_APP_KEY".to_string());
        assert_eq!(err.kind(), ErrorKind::Configuration);
        let app: AppError = err.into();
        assert_eq!(app.error_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_remote_message_is_preserved() {
        let remote = RemoteError::JobFailed("audio too short".to_string());
        let expected = remote.to_string();
        let err = CoreError::from(remote);
        assert_eq!(err.to_string(), expected);
        assert_eq!(err.kind(), ErrorKind::Remote);
    }

    #[test]
    fn test_transient_remote_errors() {
        let err = CoreError::from(RemoteError::Transport("connection reset".to_string()));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}
