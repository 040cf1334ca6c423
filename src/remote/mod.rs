//! # Remote Job Client
//!
//! Drives the remote ASR service through upload → submit → poll.
//!
//! ## Workflow:
//! 1. **Upload**: put the audio into object storage under `<prefix>/<sanitized name>`
//!    and presign a GET URL (valid for at least 3 hours)
//! 2. **Submit**: create a job with a timestamp-derived key and diarization on
//! 3. **Poll**: check the job every `poll_interval` until it completes, fails, or the
//!    `poll_timeout` deadline passes
//!
//! ## Retry Budgets:
//! Upload, submit and the result download use the full [`RetryPolicy`]. Each poll
//! request gets its own, smaller budget.

mod error;
pub mod sign;
pub mod storage;
pub mod tingwu;

pub use error::RemoteError;
pub use storage::ObjectStorage;
pub use tingwu::{JobRequest, JobService, JobState};

use crate::config::{AppConfig, MIN_SIGNED_URL_TTL_SECS};
use crate::error::CoreError;
use crate::retry::RetryPolicy;
use crate::transcript::{normalize_remote, Transcript, DEFAULT_REMOTE_LANGUAGE};
use crate::transcription::{AsrBackend, TranscribeOptions};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Timing and retry settings for one client.
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub prefix: String,
    pub signed_url_ttl: Duration,
    pub source_language: String,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub retry: RetryPolicy,
    pub poll_retry: RetryPolicy,
}

impl RemoteSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let remote = &config.remote;
        let retry = RetryPolicy::new(
            remote.max_retries,
            Duration::from_millis(remote.initial_backoff_ms),
            Duration::from_millis(remote.max_backoff_ms),
        );
        Self {
            prefix: config.object_storage.prefix.clone(),
            signed_url_ttl: Duration::from_secs(
                config
                    .object_storage
                    .signed_url_ttl_secs
                    .max(MIN_SIGNED_URL_TTL_SECS),
            ),
            source_language: remote.source_language.clone(),
            poll_interval: Duration::from_secs(remote.poll_interval_secs),
            poll_timeout: Duration::from_secs(remote.poll_timeout_secs),
            poll_retry: retry.with_max_retries(remote.poll_max_retries),
            retry,
        }
    }
}

pub struct RemoteJobClient {
    storage: Arc<dyn ObjectStorage>,
    jobs: Arc<dyn JobService>,
    settings: RemoteSettings,
}

impl RemoteJobClient {
    pub fn new(storage: Arc<dyn ObjectStorage>, jobs: Arc<dyn JobService>, settings: RemoteSettings) -> Self {
        Self {
            storage,
            jobs,
            settings,
        }
    }

    /// Build the OSS/COS + Tingwu client from configuration.
    ///
    /// Returns `None` when a required setting is absent; callers check
    /// [`AppConfig::is_remote_available`] first to report what is missing.
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.remote.request_timeout_secs))
            .build()
            .ok()?;

        let storage: Arc<dyn ObjectStorage> = Arc::from(storage::from_config(config, http.clone())?);
        let jobs = tingwu::TingwuClient::new(
            http,
            config.remote.endpoint.clone(),
            config.remote.api_version.clone(),
            config.remote.app_key.clone()?,
            sign::Credentials {
                access_key_id: config.remote.access_key_id.clone()?,
                access_key_secret: config.remote.access_key_secret.clone()?,
                security_token: config.remote.security_token.clone(),
            },
        );

        Some(Self::new(storage, Arc::new(jobs), RemoteSettings::from_config(config)))
    }

    /// Upload the audio and return a presigned GET URL.
    pub async fn upload(&self, audio_path: &Path) -> Result<String, RemoteError> {
        let file_name = audio_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let key = storage::object_key(&self.settings.prefix, &file_name);
        let content_type = mime_guess::from_path(audio_path)
            .first_or_octet_stream()
            .to_string();

        info!(key = %key, content_type = %content_type, "Uploading audio for remote transcription");
        self.settings
            .retry
            .run("upload", || self.storage.put_object(&key, audio_path, &content_type))
            .await?;

        self.storage.presign_get(&key, self.settings.signed_url_ttl)
    }

    /// Create the remote job and return its id.
    pub async fn submit(
        &self,
        file_url: &str,
        language: Option<&str>,
        custom_prompt: Option<&str>,
    ) -> Result<String, RemoteError> {
        let request = JobRequest {
            task_key: job_key(),
            file_url: file_url.to_string(),
            source_language: tingwu::source_language(language, &self.settings.source_language),
            diarization: true,
            custom_prompt: custom_prompt.map(str::to_string),
        };

        let job_id = self
            .settings
            .retry
            .run("submit", || self.jobs.create_job(&request))
            .await?;
        info!(job_id = %job_id, task_key = %request.task_key, "Remote job created");
        Ok(job_id)
    }

    /// Wait for the job to finish and return its normalized transcript.
    pub async fn poll(&self, job_id: &str) -> Result<Transcript, RemoteError> {
        let started = Instant::now();
        let deadline = started + self.settings.poll_timeout;
        let mut poll_count = 0u32;
        let mut last_status = String::new();

        loop {
            poll_count += 1;
            let state = self
                .settings
                .poll_retry
                .run("poll", || self.jobs.job_state(job_id))
                .await?;

            match state {
                JobState::Completed { result_url } => {
                    info!(job_id, poll_count, elapsed_s = started.elapsed().as_secs(), "Remote job completed");
                    let Some(url) = result_url else {
                        warn!(job_id, "Completed job has no result URL");
                        return Ok(Transcript::empty(DEFAULT_REMOTE_LANGUAGE));
                    };
                    let payload = self
                        .settings
                        .retry
                        .run("fetch_result", || self.jobs.fetch_result(&url))
                        .await?;
                    return Ok(normalize_remote(&payload));
                }
                JobState::Failed(message) => {
                    warn!(job_id, message = %message, "Remote job failed");
                    return Err(RemoteError::JobFailed(message));
                }
                JobState::Running(status) => {
                    if status != last_status {
                        info!(job_id, status = %status, "Remote job status");
                        last_status = status;
                    }
                }
            }

            if Instant::now() + self.settings.poll_interval > deadline {
                return Err(RemoteError::DeadlineExceeded {
                    job_id: job_id.to_string(),
                    timeout_secs: self.settings.poll_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}

#[async_trait]
impl AsrBackend for RemoteJobClient {
    async fn transcribe(&self, audio_path: &Path, options: &TranscribeOptions) -> Result<Transcript, CoreError> {
        if !audio_path.exists() {
            return Err(CoreError::InputNotFound(audio_path.to_path_buf()));
        }
        let url = self.upload(audio_path).await?;
        let job_id = self
            .submit(&url, options.language.as_deref(), options.prompt.as_deref())
            .await?;
        Ok(self.poll(&job_id).await?)
    }
}

static JOB_SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Unique job key: microsecond timestamp plus a rolling sequence for same-tick submissions.
fn job_key() -> String {
    let seq = JOB_SEQUENCE.fetch_add(1, Ordering::Relaxed) % 10_000;
    format!("task{}{:04}", chrono::Local::now().format("%Y%m%d%H%M%S%6f"), seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStorage {
        uploads: Mutex<Vec<String>>,
        failures: Mutex<u32>,
    }

    #[async_trait]
    impl ObjectStorage for FakeStorage {
        async fn put_object(&self, key: &str, _path: &Path, _content_type: &str) -> Result<(), RemoteError> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(RemoteError::Http {
                    status: 503,
                    code: "ServiceUnavailable".to_string(),
                    message: "busy".to_string(),
                });
            }
            self.uploads.lock().unwrap().push(key.to_string());
            Ok(())
        }

        fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, RemoteError> {
            Ok(format!("https://store/{}?ttl={}", key, ttl.as_secs()))
        }
    }

    struct FakeJobs {
        states: Mutex<VecDeque<Result<JobState, RemoteError>>>,
        submitted: Mutex<Vec<JobRequest>>,
        polls: Mutex<u32>,
        result: Value,
        create_error: Option<&'static str>,
    }

    impl FakeJobs {
        fn new(states: Vec<Result<JobState, RemoteError>>) -> Self {
            Self {
                states: Mutex::new(states.into()),
                submitted: Mutex::new(Vec::new()),
                polls: Mutex::new(0),
                result: json!({
                    "Transcription": {
                        "Paragraphs": [{"SpeakerId": "1", "Words": [{"Start": 0, "End": 900, "Text": "hello"}]}]
                    }
                }),
                create_error: None,
            }
        }
    }

    #[async_trait]
    impl JobService for FakeJobs {
        async fn create_job(&self, request: &JobRequest) -> Result<String, RemoteError> {
            if let Some(code) = self.create_error {
                return Err(RemoteError::Rejected {
                    code: code.to_string(),
                    message: "rejected".to_string(),
                });
            }
            self.submitted.lock().unwrap().push(request.clone());
            Ok("job-1".to_string())
        }

        async fn job_state(&self, _job_id: &str) -> Result<JobState, RemoteError> {
            *self.polls.lock().unwrap() += 1;
            self.states
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(JobState::Running("ONGOING".to_string())))
        }

        async fn fetch_result(&self, _url: &str) -> Result<Value, RemoteError> {
            Ok(self.result.clone())
        }
    }

    fn settings() -> RemoteSettings {
        let retry = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        RemoteSettings {
            prefix: "tingwu-audio".to_string(),
            signed_url_ttl: Duration::from_secs(MIN_SIGNED_URL_TTL_SECS),
            source_language: "cn".to_string(),
            poll_interval: Duration::from_millis(5),
            poll_timeout: Duration::from_millis(60),
            poll_retry: retry.with_max_retries(1),
            retry,
        }
    }

    fn client(storage: Arc<FakeStorage>, jobs: Arc<FakeJobs>) -> RemoteJobClient {
        RemoteJobClient::new(storage, jobs, settings())
    }

    #[tokio::test]
    async fn test_upload_retries_and_presigns_for_three_hours() {
        let storage = Arc::new(FakeStorage::default());
        *storage.failures.lock().unwrap() = 2;
        let remote = client(storage.clone(), Arc::new(FakeJobs::new(vec![])));

        let url = remote.upload(Path::new("/tmp/my episode.mp3")).await.unwrap();
        assert_eq!(url, "https://store/tingwu-audio/my_episode.mp3?ttl=10800");
        assert_eq!(storage.uploads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_uses_unique_keys_and_diarization() {
        let jobs = Arc::new(FakeJobs::new(vec![]));
        let remote = client(Arc::new(FakeStorage::default()), jobs.clone());

        remote.submit("https://a", Some("en"), None).await.unwrap();
        remote.submit("https://a", None, Some("list topics")).await.unwrap();

        let submitted = jobs.submitted.lock().unwrap();
        assert_ne!(submitted[0].task_key, submitted[1].task_key);
        assert!(submitted.iter().all(|r| r.diarization));
        assert_eq!(submitted[0].source_language, "en");
        assert_eq!(submitted[1].source_language, "cn");
        assert_eq!(submitted[1].custom_prompt.as_deref(), Some("list topics"));
    }

    #[tokio::test]
    async fn test_submit_rejection_is_not_retried() {
        let mut jobs = FakeJobs::new(vec![]);
        jobs.create_error = Some("BRK.InvalidAppKey");
        let jobs = Arc::new(jobs);
        let remote = client(Arc::new(FakeStorage::default()), jobs.clone());

        let err = remote.submit("https://a", None, None).await.unwrap_err();
        assert!(err.to_string().contains("BRK.InvalidAppKey"));
    }

    #[tokio::test]
    async fn test_poll_completes_and_normalizes() {
        let jobs = Arc::new(FakeJobs::new(vec![
            Ok(JobState::Running("QUEUEING".to_string())),
            Err(RemoteError::Transport("reset".to_string())),
            Ok(JobState::Running("ONGOING".to_string())),
            Ok(JobState::Completed {
                result_url: Some("https://result".to_string()),
            }),
        ]));
        let remote = client(Arc::new(FakeStorage::default()), jobs);

        let transcript = remote.poll("job-1").await.unwrap();
        assert_eq!(transcript.text, "hello");
        assert_eq!(transcript.segments[0].end, 0.9);
        assert_eq!(transcript.segments[0].speaker, "1");
    }

    #[tokio::test]
    async fn test_poll_failed_surfaces_remote_message() {
        let jobs = Arc::new(FakeJobs::new(vec![Ok(JobState::Failed("TSC.FileError broken".to_string()))]));
        let remote = client(Arc::new(FakeStorage::default()), jobs);

        match remote.poll("job-1").await {
            Err(RemoteError::JobFailed(message)) => assert_eq!(message, "TSC.FileError broken"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_deadline_is_distinct_from_failure() {
        let remote = client(Arc::new(FakeStorage::default()), Arc::new(FakeJobs::new(vec![])));

        match remote.poll("job-9").await {
            Err(RemoteError::DeadlineExceeded { job_id, .. }) => assert_eq!(job_id, "job-9"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_gives_up_after_its_own_budget() {
        let jobs = Arc::new(FakeJobs::new(vec![
            Err(RemoteError::Transport("a".to_string())),
            Err(RemoteError::Transport("b".to_string())),
            Ok(JobState::Completed { result_url: None }),
        ]));
        let remote = client(Arc::new(FakeStorage::default()), jobs);

        match remote.poll("job-1").await {
            Err(RemoteError::Transport(message)) => assert_eq!(message, "b"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_completed_without_url_is_empty() {
        let jobs = Arc::new(FakeJobs::new(vec![Ok(JobState::Completed { result_url: None })]));
        let transcript = client(Arc::new(FakeStorage::default()), jobs).poll("j").await.unwrap();
        assert!(transcript.segments.is_empty());
        assert_eq!(transcript.language, DEFAULT_REMOTE_LANGUAGE);
    }

    fn audio_file() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("episode.mp3");
        std::fs::write(&path, b"ID3 remote audio").unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn test_transcribe_runs_upload_submit_poll() {
        let (_dir, path) = audio_file();
        let storage = Arc::new(FakeStorage::default());
        let jobs = Arc::new(FakeJobs::new(vec![
            Ok(JobState::Running("ONGOING".to_string())),
            Ok(JobState::Completed {
                result_url: Some("https://result".to_string()),
            }),
        ]));
        let remote = client(storage.clone(), jobs.clone());
        let options = TranscribeOptions {
            language: Some("en".to_string()),
            prompt: Some("rust podcast".to_string()),
            ..Default::default()
        };

        let transcript = AsrBackend::transcribe(&remote, &path, &options).await.unwrap();
        assert_eq!(transcript.text, "hello");
        assert_eq!(transcript.segments.len(), 1);
        assert_eq!(transcript.segments[0].speaker, "1");

        assert_eq!(*storage.uploads.lock().unwrap(), ["tingwu-audio/episode.mp3"]);
        let submitted = jobs.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(
            submitted[0].file_url,
            format!("https://store/tingwu-audio/episode.mp3?ttl={}", MIN_SIGNED_URL_TTL_SECS)
        );
        assert_eq!(submitted[0].source_language, "en");
        assert_eq!(submitted[0].custom_prompt.as_deref(), Some("rust podcast"));
        assert_eq!(*jobs.polls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_transcribe_job_failure_is_not_resubmitted() {
        let (_dir, path) = audio_file();
        let jobs = Arc::new(FakeJobs::new(vec![Ok(JobState::Failed(
            "TSC.AudioTooShort audio too short".to_string(),
        ))]));
        let remote = client(Arc::new(FakeStorage::default()), jobs.clone());

        let err = AsrBackend::transcribe(&remote, &path, &TranscribeOptions::default())
            .await
            .unwrap_err();
        match &err {
            CoreError::Remote(RemoteError::JobFailed(message)) => {
                assert_eq!(message, "TSC.AudioTooShort audio too short")
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(err.kind(), crate::error::ErrorKind::Remote);
        assert_eq!(jobs.submitted.lock().unwrap().len(), 1);
        assert_eq!(*jobs.polls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transcribe_missing_file_touches_nothing() {
        let storage = Arc::new(FakeStorage::default());
        let jobs = Arc::new(FakeJobs::new(vec![]));
        let remote = client(storage.clone(), jobs.clone());
        let missing = Path::new("/nonexistent/episode.mp3");

        let err = AsrBackend::transcribe(&remote, missing, &TranscribeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InputNotFound(ref p) if p == missing));
        assert!(storage.uploads.lock().unwrap().is_empty());
        assert!(jobs.submitted.lock().unwrap().is_empty());
        assert_eq!(*jobs.polls.lock().unwrap(), 0);
    }

    #[test]
    fn test_job_key_shape() {
        let key = job_key();
        assert!(key.starts_with("task"));
        assert_eq!(key.len(), "task".len() + 24);
        assert_ne!(key, job_key());
    }
}
