//! Task records and their status machine.
//!
//! ```text
//! queued -> downloading -> downloaded -> transcribing -> completed
//!    \__________\______________\______________\_______> failed
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ErrorKind;
use crate::history::SourceType;

/// Progress checkpoints.
pub mod progress {
    pub const QUEUED: f64 = 0.0;
    pub const DOWNLOADING: f64 = 0.1;
    pub const DOWNLOADED: f64 = 0.5;
    pub const TRANSCRIBING: f64 = 0.55;
    pub const COMPLETED: f64 = 1.0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Downloading,
    Downloaded,
    Transcribing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Downloaded => "downloaded",
            TaskStatus::Transcribing => "transcribing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Completed and failed tasks never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a task's media comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SourceRef {
    Url(String),
    /// Already on disk (uploads)
    LocalFile { path: PathBuf, original_name: String },
}

impl SourceRef {
    pub fn url(&self) -> Option<&str> {
        match self {
            SourceRef::Url(url) => Some(url),
            SourceRef::LocalFile { .. } => None,
        }
    }

    pub fn source_type(&self) -> SourceType {
        match self {
            SourceRef::LocalFile { .. } => SourceType::Upload,
            SourceRef::Url(url) if super::collaborators::is_site_specific(url) => SourceType::Youtube,
            SourceRef::Url(_) => SourceType::Url,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLog {
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Why a task failed. `message` is the original error text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsMeta {
    pub segments: usize,
    pub language: String,
    pub provider: String,
}

/// Artifact locations written on completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResults {
    pub json_path: PathBuf,
    pub srt_path: PathBuf,
    pub markdown_path: PathBuf,
    pub meta: ResultsMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub source: SourceRef,
    pub status: TaskStatus,
    pub progress: f64,
    /// Display title, from the upload name or the fetched media
    pub title: Option<String>,
    pub audio_path: Option<PathBuf>,
    pub mime_type: Option<String>,
    pub error: Option<TaskError>,
    pub logs: Vec<TaskLog>,
    pub results: Option<TaskResults>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, source: SourceRef) -> Self {
        let now = Utc::now();
        let title = match &source {
            SourceRef::LocalFile { original_name, .. } => Some(original_name.clone()),
            SourceRef::Url(_) => None,
        };

        Self {
            id: id.into(),
            source,
            status: TaskStatus::Queued,
            progress: progress::QUEUED,
            title,
            audio_path: None,
            mime_type: None,
            error: None,
            logs: Vec::new(),
            results: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Raise progress; never lowers it.
    pub fn advance(&mut self, value: f64) {
        self.progress = self.progress.max(value.clamp(0.0, 1.0));
    }

    /// Append a log entry and mirror it to tracing.
    pub fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => tracing::info!(task_id = %self.id, "{}", message),
            LogLevel::Warn => tracing::warn!(task_id = %self.id, "{}", message),
            LogLevel::Error => tracing::error!(task_id = %self.id, "{}", message),
        }
        self.logs.push(TaskLog {
            time: Utc::now(),
            level,
            message,
        });
    }
}
