use crate::retry::Retryable;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the remote transcription path (object storage and job API).
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Non-success HTTP response; `code` is the service error code when one was returned
    #[error("HTTP Status: {status} Error:{code} {message}")]
    Http {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    /// 2xx response whose body carries a non-zero service code
    #[error("Request rejected: {code} {message}")]
    Rejected { code: String, message: String },

    #[error("Remote transcription failed: {0}")]
    JobFailed(String),

    #[error("Remote job {job_id} did not finish within {timeout_secs}s")]
    DeadlineExceeded { job_id: String, timeout_secs: u64 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Cannot read {}: {source}", .path.display())]
    LocalFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Retryable for RemoteError {
    fn http_status(&self) -> Option<u16> {
        match self {
            RemoteError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            RemoteError::JobFailed(_)
                | RemoteError::DeadlineExceeded { .. }
                | RemoteError::LocalFile { .. }
        )
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => RemoteError::Http {
                status: status.as_u16(),
                code: String::new(),
                message: err.to_string(),
            },
            None => RemoteError::Transport(err.to_string()),
        }
    }
}
