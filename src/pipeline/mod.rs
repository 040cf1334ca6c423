//! # Task Pipeline
//!
//! Owns a task's lifecycle across two explicitly triggered stages:
//!
//! 1. **Download**: `queued -> downloading -> downloaded`. URLs are fetched into the
//!    task directory; uploaded files are already there and only checked.
//! 2. **Transcribe**: `downloaded -> transcribing -> completed`. Runs the chosen
//!    provider, writes `result.json`, `result.srt` and `result.md`, then adds a
//!    history record.
//!
//! Any failure inside a stage moves the task to `failed` with the original error
//! message. Completed and failed tasks are never modified again.
//!
//! ## Dispatch:
//! `trigger_*` checks and advances the status under the store lock, then hands the
//! stage to the [`WorkerPool`] and returns. A second trigger for the same task sees
//! the new status and is rejected, so one task never has two stages in flight.

pub mod collaborators;
pub mod store;
pub mod task;
pub mod worker;

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::error::CoreError;
use crate::history::{HistoryRecord, HistoryStatus, HistoryStore, MediaType};
use crate::transcript::Transcript;
use crate::transcription::{Provider, TranscribeOptions, TranscriptionRouter};
use collaborators::{
    BasicFormatter, FetchedMedia, FrequencyKeywords, HttpFetcher, KeywordExtractor, MediaFetcher,
    TranscriptFormatter,
};
use store::TaskStore;
use task::{progress, LogLevel, ResultsMeta, SourceRef, Task, TaskError, TaskResults, TaskStatus};
use worker::WorkerPool;

pub const RESULT_JSON: &str = "result.json";
pub const RESULT_SRT: &str = "result.srt";
pub const RESULT_MARKDOWN: &str = "result.md";
pub const DEFAULT_KEYWORD_COUNT: usize = 5;

pub struct TaskPipeline {
    store: Arc<dyn TaskStore>,
    router: Arc<TranscriptionRouter>,
    workers: WorkerPool,
    artifacts_dir: PathBuf,
    fetcher: Arc<dyn MediaFetcher>,
    keywords: Arc<dyn KeywordExtractor>,
    formatter: Arc<dyn TranscriptFormatter>,
    history: Option<Arc<HistoryStore>>,
    keyword_count: usize,
}

impl TaskPipeline {
    /// Pipeline with the default collaborators and no history.
    pub fn new(
        store: Arc<dyn TaskStore>,
        router: Arc<TranscriptionRouter>,
        workers: WorkerPool,
        artifacts_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            router,
            workers,
            artifacts_dir: artifacts_dir.into(),
            fetcher: Arc::new(HttpFetcher::new(reqwest::Client::new())),
            keywords: Arc::new(FrequencyKeywords),
            formatter: Arc::new(BasicFormatter),
            history: None,
            keyword_count: DEFAULT_KEYWORD_COUNT,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn MediaFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_keywords(mut self, keywords: Arc<dyn KeywordExtractor>, top_k: usize) -> Self {
        self.keywords = keywords;
        self.keyword_count = top_k;
        self
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn TranscriptFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn with_history(mut self, history: Arc<HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn router(&self) -> &TranscriptionRouter {
        &self.router
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// `<artifacts>/<task_id>`
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.artifacts_dir.join(task_id)
    }

    pub fn new_task_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Register a task in `queued`.
    pub fn create_task(&self, source: SourceRef) -> Result<Task, CoreError> {
        self.create_task_with_id(Self::new_task_id(), source)
    }

    /// Register a task under a caller-chosen id (uploads pick the id first so the
    /// file can be written into the task directory).
    pub fn create_task_with_id(&self, id: String, source: SourceRef) -> Result<Task, CoreError> {
        if let SourceRef::Url(url) = &source {
            let url = url.trim();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(CoreError::InvalidSource(format!(
                    "expected an http(s) URL, got '{}'",
                    url
                )));
            }
        }

        let mut task = Task::new(id, source);
        task.push_log(LogLevel::Info, "Task created");
        self.store.insert(task.clone())?;
        Ok(task)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task, CoreError> {
        self.store
            .get(task_id)
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))
    }

    /// Append to the task log. Ignored once the task is completed or failed.
    pub fn append_log(&self, task_id: &str, level: LogLevel, message: impl Into<String>) {
        let mut message = Some(message.into());
        let result = self.store.update(task_id, &mut |task| {
            if task.status.is_terminal() {
                return Ok(());
            }
            if let Some(message) = message.take() {
                task.push_log(level, message);
            }
            Ok(())
        });
        if let Err(e) = result {
            tracing::warn!(task_id = %task_id, "Dropping log entry: {}", e);
        }
    }

    /// Compare-and-set status change with a progress checkpoint and log line.
    fn transition(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        checkpoint: f64,
        message: &str,
    ) -> Result<Task, CoreError> {
        self.store.update(task_id, &mut |task| {
            if task.status != from {
                return Err(CoreError::InvalidState {
                    task_id: task.id.clone(),
                    expected: from,
                    actual: task.status,
                });
            }
            if to == TaskStatus::Transcribing && task.audio_path.is_none() {
                return Err(CoreError::MissingAudio(task.id.clone()));
            }
            task.status = to;
            task.advance(checkpoint);
            task.push_log(LogLevel::Info, message);
            Ok(())
        })
    }

    /// Record a stage failure. Progress is left where the stage got to.
    fn fail(&self, task_id: &str, err: &CoreError) -> Result<Task, CoreError> {
        let message = err.to_string();
        let kind = err.kind();
        self.store.update(task_id, &mut |task| {
            if task.status.is_terminal() {
                return Ok(());
            }
            task.push_log(LogLevel::Error, message.clone());
            task.error = Some(TaskError {
                kind,
                message: message.clone(),
            });
            task.status = TaskStatus::Failed;
            Ok(())
        })
    }

    /// Run the download stage to completion on the current task.
    ///
    /// ## Returns:
    /// - **Err**: the task was not `queued` (nothing changed)
    /// - **Ok(task)**: final snapshot, `downloaded` or `failed`
    pub async fn start_download(&self, task_id: &str) -> Result<Task, CoreError> {
        self.transition(
            task_id,
            TaskStatus::Queued,
            TaskStatus::Downloading,
            progress::DOWNLOADING,
            "Download started",
        )?;
        self.run_download(task_id).await
    }

    /// Start the download stage on the worker pool and return immediately.
    pub fn trigger_download(self: &Arc<Self>, task_id: &str) -> Result<JoinHandle<()>, CoreError> {
        self.transition(
            task_id,
            TaskStatus::Queued,
            TaskStatus::Downloading,
            progress::DOWNLOADING,
            "Download started",
        )?;

        let pipeline = self.clone();
        let task_id = task_id.to_string();
        Ok(self.workers.submit("download", async move {
            if let Err(e) = pipeline.run_download(&task_id).await {
                tracing::error!(task_id = %task_id, "Download stage lost its task: {}", e);
            }
        }))
    }

    async fn run_download(&self, task_id: &str) -> Result<Task, CoreError> {
        match self.download_media(task_id).await {
            Ok(media) => {
                let result = self.store.update(task_id, &mut |task| {
                    task.status = TaskStatus::Downloaded;
                    task.advance(progress::DOWNLOADED);
                    task.audio_path = Some(media.path.clone());
                    task.mime_type = media.mime_type.clone();
                    if task.title.is_none() {
                        task.title = Some(media.title.clone());
                    }
                    task.push_log(
                        LogLevel::Info,
                        format!("Media ready at {}", media.path.display()),
                    );
                    Ok(())
                });
                result.or_else(|e| self.fail(task_id, &e))
            }
            Err(e) => self.fail(task_id, &e),
        }
    }

    async fn download_media(&self, task_id: &str) -> Result<FetchedMedia, CoreError> {
        let task = self.get_task(task_id)?;
        match &task.source {
            SourceRef::LocalFile {
                path,
                original_name,
            } => {
                if !path.is_file() {
                    return Err(CoreError::InputNotFound(path.clone()));
                }
                Ok(FetchedMedia {
                    path: path.clone(),
                    mime_type: mime_guess::from_path(path).first().map(|m| m.to_string()),
                    title: original_name.clone(),
                })
            }
            SourceRef::Url(url) => {
                self.append_log(task_id, LogLevel::Info, format!("Fetching {}", url));
                self.fetcher.fetch(url, &self.task_dir(task_id)).await
            }
        }
    }

    /// Run the transcribe stage to completion on the current task.
    ///
    /// ## Returns:
    /// - **Err**: the task was not `downloaded` or has no audio (router not called)
    /// - **Ok(task)**: final snapshot, `completed` or `failed`
    pub async fn start_transcribe(
        &self,
        task_id: &str,
        provider: Provider,
        options: TranscribeOptions,
    ) -> Result<Task, CoreError> {
        let task = self.begin_transcribe(task_id, provider)?;
        self.run_transcribe(task, provider, options).await
    }

    /// Start the transcribe stage on the worker pool and return immediately.
    pub fn trigger_transcribe(
        self: &Arc<Self>,
        task_id: &str,
        provider: Provider,
        options: TranscribeOptions,
    ) -> Result<JoinHandle<()>, CoreError> {
        let task = self.begin_transcribe(task_id, provider)?;
        let pipeline = self.clone();
        Ok(self.workers.submit("transcribe", async move {
            let task_id = task.id.clone();
            if let Err(e) = pipeline.run_transcribe(task, provider, options).await {
                tracing::error!(task_id = %task_id, "Transcribe stage lost its task: {}", e);
            }
        }))
    }

    fn begin_transcribe(&self, task_id: &str, provider: Provider) -> Result<Task, CoreError> {
        self.transition(
            task_id,
            TaskStatus::Downloaded,
            TaskStatus::Transcribing,
            progress::TRANSCRIBING,
            &format!("Transcription started with {}", provider),
        )
    }

    async fn run_transcribe(
        &self,
        task: Task,
        provider: Provider,
        options: TranscribeOptions,
    ) -> Result<Task, CoreError> {
        let task_id = task.id.clone();
        match self.transcribe_and_write(&task, provider, &options).await {
            Ok((results, transcript)) => {
                let result = self.store.update(&task_id, &mut |task| {
                    task.status = TaskStatus::Completed;
                    task.advance(progress::COMPLETED);
                    task.results = Some(results.clone());
                    task.push_log(
                        LogLevel::Info,
                        format!("Transcription completed: {} segments", results.meta.segments),
                    );
                    Ok(())
                });
                match result {
                    Ok(done) => {
                        self.record_history(&done, &transcript).await;
                        Ok(done)
                    }
                    Err(e) => self.fail(&task_id, &e),
                }
            }
            Err(e) => self.fail(&task_id, &e),
        }
    }

    async fn transcribe_and_write(
        &self,
        task: &Task,
        provider: Provider,
        options: &TranscribeOptions,
    ) -> Result<(TaskResults, Transcript), CoreError> {
        let audio_path = task
            .audio_path
            .as_deref()
            .ok_or_else(|| CoreError::MissingAudio(task.id.clone()))?;

        let transcript = self.router.transcribe(audio_path, provider, options).await?;
        self.append_log(
            &task.id,
            LogLevel::Info,
            format!(
                "Received {} segments ({})",
                transcript.segments.len(),
                transcript.language
            ),
        );

        let dir = self.task_dir(&task.id);
        tokio::fs::create_dir_all(&dir).await?;

        let formatted = self.formatter.format(&transcript);
        let json = serde_json::to_vec_pretty(&transcript)
            .map_err(|e| CoreError::Inference(format!("Failed to serialize transcript: {}", e)))?;

        let results = TaskResults {
            json_path: dir.join(RESULT_JSON),
            srt_path: dir.join(RESULT_SRT),
            markdown_path: dir.join(RESULT_MARKDOWN),
            meta: ResultsMeta {
                segments: transcript.segments.len(),
                language: transcript.language.clone(),
                provider: provider.name().to_string(),
            },
        };
        tokio::fs::write(&results.json_path, json).await?;
        tokio::fs::write(&results.srt_path, formatted.srt).await?;
        tokio::fs::write(&results.markdown_path, formatted.markdown).await?;

        Ok((results, transcript))
    }

    /// Add the finished task to history. Failures are logged only.
    async fn record_history(&self, task: &Task, transcript: &Transcript) {
        let Some(history) = self.history.clone() else {
            return;
        };

        let record = self.history_record(task, transcript).await;
        let task_id = task.id.clone();
        let outcome = tokio::task::spawn_blocking(move || history.add(record)).await;
        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(task_id = %task_id, "Failed to write history record: {}", e),
            Err(e) => tracing::warn!(task_id = %task_id, "History writer panicked: {}", e),
        }
    }

    async fn history_record(&self, task: &Task, transcript: &Transcript) -> HistoryRecord {
        let audio_path = task.audio_path.as_deref().unwrap_or_else(|| Path::new(""));
        let file_size = match tokio::fs::metadata(audio_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let media_type = if collaborators::is_video(task.mime_type.as_deref(), audio_path) {
            MediaType::Video
        } else {
            MediaType::Audio
        };
        let title = task
            .title
            .clone()
            .or_else(|| task.source.url().map(collaborators::title_from_url))
            .unwrap_or_else(|| task.id.clone());

        HistoryRecord {
            task_id: task.id.clone(),
            title: title.chars().take(crate::history::MAX_TITLE_CHARS).collect(),
            source_url: task.source.url().map(str::to_string),
            source_type: task.source.source_type(),
            media_type,
            duration: transcript.duration().max(0.0).round() as u64,
            file_size,
            tags: self.keywords.extract(&transcript.text, self.keyword_count),
            created_at: Utc::now(),
            viewed: false,
            thumbnail_url: self.thumbnail_url(&task.id).await,
            status: HistoryStatus::Completed,
        }
    }

    /// Served path of the cover image, when the fetcher saved one.
    async fn thumbnail_url(&self, task_id: &str) -> Option<String> {
        let path = self.task_dir(task_id).join(collaborators::THUMBNAIL_FILE);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Some(format!(
                "/artifacts/{}/{}",
                task_id,
                collaborators::THUMBNAIL_FILE
            )),
            _ => None,
        }
    }
}
