//! # Application State
//!
//! Everything an HTTP handler needs, built once at startup and cloned into every
//! actix worker.
//!
//! ## Sharing:
//! Each field is either `Arc`-wrapped or cheap to clone, so cloning `AppState` only
//! bumps reference counts. Mutable data lives behind the locks of the component that
//! owns it (task store, model cache, history lock file), not here.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::AppConfig;
use crate::history::HistoryStore;
use crate::pipeline::collaborators::{FrequencyKeywords, HttpFetcher};
use crate::pipeline::store::InMemoryTaskStore;
use crate::pipeline::worker::WorkerPool;
use crate::pipeline::TaskPipeline;
use crate::transcription::{AsrBackend, LocalTranscriber, TranscriptionRouter};

#[derive(Clone)]
pub struct AppState {
    /// Read-only after startup
    pub config: Arc<AppConfig>,
    pub pipeline: Arc<TaskPipeline>,
    pub history: Arc<HistoryStore>,
    /// Kept separately from the router for model listing and downloads
    pub local: LocalTranscriber,
    pub start_time: Instant,
}

impl AppState {
    /// Wire every component from configuration.
    ///
    /// ## What gets built:
    /// - Local Whisper transcriber with its model cache
    /// - Provider router, with the remote client only when fully configured
    /// - In-memory task store and a worker pool of `pipeline.max_concurrent_tasks`
    /// - History store at `<artifacts_dir>/<history.file_name>`
    /// - Media fetcher sharing one `reqwest` client
    ///
    /// ## Errors:
    /// Fails when the artifacts directory cannot be created or the HTTP client
    /// cannot be built.
    pub fn build(config: AppConfig) -> Result<Self> {
        let artifacts_dir = config.artifacts_dir();
        std::fs::create_dir_all(&artifacts_dir).with_context(|| {
            format!("Failed to create artifacts directory {}", artifacts_dir.display())
        })?;

        let local = LocalTranscriber::new(&config.local);
        let router = TranscriptionRouter::from_config(
            &config,
            Arc::new(local.clone()) as Arc<dyn AsrBackend>,
        );

        let history = Arc::new(HistoryStore::new(
            config.history_path(),
            config.history_lock_timeout(),
            config.history.max_page_size,
        ));

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.remote.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        let pipeline = TaskPipeline::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(router),
            WorkerPool::new(config.pipeline.max_concurrent_tasks),
            artifacts_dir,
        )
        .with_fetcher(Arc::new(HttpFetcher::new(client)))
        .with_keywords(Arc::new(FrequencyKeywords), config.pipeline.keyword_count)
        .with_history(history.clone());

        tracing::info!(
            workers = config.pipeline.max_concurrent_tasks,
            remote = pipeline.router().is_remote_available(),
            history = %history.path().display(),
            "Application state ready"
        );

        Ok(Self::from_parts(config, Arc::new(pipeline), history, local))
    }

    /// Assemble state from prebuilt components.
    pub fn from_parts(
        config: AppConfig,
        pipeline: Arc<TaskPipeline>,
        history: Arc<HistoryStore>,
        local: LocalTranscriber,
    ) -> Self {
        Self {
            config: Arc::new(config),
            pipeline,
            history,
            local,
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_creates_artifacts_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.storage.artifacts_dir = dir.path().join("out").to_string_lossy().into_owned();

        let state = AppState::build(config).unwrap();

        assert!(dir.path().join("out").is_dir());
        assert_eq!(state.history.path(), dir.path().join("out").join("history.json"));
        assert!(!state.pipeline.router().is_remote_available());
        assert_eq!(state.pipeline.workers().size(), 4);
    }
}
