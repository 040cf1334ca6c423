//! Alibaba Tingwu offline transcription API.
//!
//! ## Endpoints:
//! - `PUT /openapi/tingwu/v2/tasks?type=offline` (CreateTask)
//! - `GET /openapi/tingwu/v2/tasks/{id}` (GetTaskInfo)
//!
//! Every response carries a `Code` that must be `"0"` (or `0`) for success, and a
//! `Data` object with the payload.

use super::sign::{AcsRequest, Credentials};
use super::RemoteError;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info};

const TASKS_PATH: &str = "/openapi/tingwu/v2/tasks";

/// State of a remote job as reported by one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    /// Still queued or running; carries the raw status string
    Running(String),
    Completed { result_url: Option<String> },
    Failed(String),
}

/// One submission to the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub task_key: String,
    pub file_url: String,
    pub source_language: String,
    pub diarization: bool,
    pub custom_prompt: Option<String>,
}

impl JobRequest {
    /// CreateTask request body.
    pub fn to_body(&self, app_key: &str) -> Value {
        let mut body = json!({
            "AppKey": app_key,
            "Input": {
                "SourceLanguage": self.source_language,
                "TaskKey": self.task_key,
                "FileUrl": self.file_url,
            },
            "Parameters": {
                "Transcription": {
                    "DiarizationEnabled": self.diarization,
                }
            }
        });

        if let Some(prompt) = self.custom_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            body["Parameters"]["CustomPromptEnabled"] = json!(true);
            body["Parameters"]["CustomPrompt"] = json!({
                "Contents": [{
                    "Name": "custom_analysis",
                    "Model": "tingwu-turbo",
                    "Prompt": format!("{}\n\n转写内容:\n{{Transcription}}", prompt),
                    "TransType": "chat",
                }]
            });
        }

        body
    }
}

/// The job half of the remote workflow.
#[async_trait]
pub trait JobService: Send + Sync {
    async fn create_job(&self, request: &JobRequest) -> Result<String, RemoteError>;

    async fn job_state(&self, job_id: &str) -> Result<JobState, RemoteError>;

    /// Download the raw result document a completed job points at.
    async fn fetch_result(&self, url: &str) -> Result<Value, RemoteError>;
}

/// Map an ISO language hint to a Tingwu `SourceLanguage`.
pub fn source_language(hint: Option<&str>, default: &str) -> String {
    match hint.map(|h| h.trim().to_lowercase()).as_deref() {
        Some("zh") | Some("cn") | Some("zh-cn") => "cn".to_string(),
        Some("en") => "en".to_string(),
        Some("ja") => "ja".to_string(),
        Some("yue") => "yue".to_string(),
        _ => default.to_string(),
    }
}

pub struct TingwuClient {
    client: reqwest::Client,
    host: String,
    version: String,
    app_key: String,
    credentials: Credentials,
}

impl TingwuClient {
    pub fn new(
        client: reqwest::Client,
        host: impl Into<String>,
        version: impl Into<String>,
        app_key: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            client,
            host: host.into(),
            version: version.into(),
            app_key: app_key.into(),
            credentials,
        }
    }

    /// Send one signed request and return `Data` from a successful envelope.
    async fn call(
        &self,
        method: reqwest::Method,
        action: &str,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> Result<Value, RemoteError> {
        let body = body.unwrap_or_default();
        let signed = AcsRequest {
            method: method.as_str(),
            host: &self.host,
            path,
            query,
            body: &body,
            action,
            version: &self.version,
            timestamp: Utc::now(),
            nonce: uuid::Uuid::new_v4().to_string(),
        }
        .sign(&self.credentials);

        let mut request = self
            .client
            .request(method.clone(), format!("https://{}{}", self.host, path))
            .query(query);
        for (name, value) in &signed {
            if name != "host" {
                request = request.header(name.as_str(), value.as_str());
            }
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        let envelope: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        let code = match envelope.get("Code") {
            Some(Value::String(code)) => code.clone(),
            Some(Value::Number(code)) => code.to_string(),
            _ => String::new(),
        };
        let message = envelope
            .get("Message")
            .and_then(Value::as_str)
            .unwrap_or(text.as_str())
            .to_string();

        if !status.is_success() {
            return Err(RemoteError::Http {
                status: status.as_u16(),
                code,
                message,
            });
        }
        if code != "0" {
            return Err(RemoteError::Rejected { code, message });
        }

        envelope
            .get("Data")
            .cloned()
            .ok_or_else(|| RemoteError::InvalidResponse(format!("{} response has no Data", action)))
    }
}

#[async_trait]
impl JobService for TingwuClient {
    async fn create_job(&self, request: &JobRequest) -> Result<String, RemoteError> {
        let body = serde_json::to_vec(&request.to_body(&self.app_key))
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;

        info!(task_key = %request.task_key, "Submitting remote transcription job");
        let data = self
            .call(
                reqwest::Method::PUT,
                "CreateTask",
                TASKS_PATH,
                &[("type", "offline")],
                Some(body),
            )
            .await?;

        data.get("TaskId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::InvalidResponse("CreateTask returned no TaskId".to_string()))
    }

    async fn job_state(&self, job_id: &str) -> Result<JobState, RemoteError> {
        let path = format!("{}/{}", TASKS_PATH, job_id);
        let data = self
            .call(reqwest::Method::GET, "GetTaskInfo", &path, &[], None)
            .await?;
        Ok(parse_job_state(&data))
    }

    async fn fetch_result(&self, url: &str) -> Result<Value, RemoteError> {
        debug!("Fetching remote transcription result");
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.json::<Value>().await?)
    }
}

/// Read `TaskStatus`, `Result.Transcription` and `ErrorMessage` from GetTaskInfo data.
pub fn parse_job_state(data: &Value) -> JobState {
    let status = data.get("TaskStatus").and_then(Value::as_str).unwrap_or_default();
    match status {
        "COMPLETED" => JobState::Completed {
            result_url: data
                .pointer("/Result/Transcription")
                .and_then(Value::as_str)
                .filter(|u| !u.is_empty())
                .map(str::to_string),
        },
        "FAILED" => JobState::Failed(
            data.get("ErrorMessage")
                .and_then(Value::as_str)
                .unwrap_or("Task failed")
                .to_string(),
        ),
        other => JobState::Running(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: Option<&str>) -> JobRequest {
        JobRequest {
            task_key: "task20240501080000123456".to_string(),
            file_url: "https://bucket/audio.mp3".to_string(),
            source_language: "cn".to_string(),
            diarization: true,
            custom_prompt: prompt.map(str::to_string),
        }
    }

    #[test]
    fn test_body_requests_diarization() {
        let body = request(None).to_body("app-key");
        assert_eq!(body["AppKey"], "app-key");
        assert_eq!(body["Input"]["FileUrl"], "https://bucket/audio.mp3");
        assert_eq!(body["Parameters"]["Transcription"]["DiarizationEnabled"], true);
        assert!(body["Parameters"].get("CustomPrompt").is_none());
    }

    #[test]
    fn test_custom_prompt_embeds_placeholder() {
        let body = request(Some("Summarize the episode")).to_body("app-key");
        assert_eq!(body["Parameters"]["CustomPromptEnabled"], true);
        let prompt = body["Parameters"]["CustomPrompt"]["Contents"][0]["Prompt"]
            .as_str()
            .unwrap();
        assert!(prompt.starts_with("Summarize the episode\n\n"));
        assert!(prompt.ends_with("{Transcription}"));
    }

    #[test]
    fn test_parse_job_state() {
        let done = json!({"TaskStatus": "COMPLETED", "Result": {"Transcription": "https://r"}});
        assert_eq!(
            parse_job_state(&done),
            JobState::Completed {
                result_url: Some("https://r".to_string())
            }
        );

        let failed = json!({"TaskStatus": "FAILED", "ErrorMessage": "TSC.AudioFileLink invalid"});
        assert_eq!(
            parse_job_state(&failed),
            JobState::Failed("TSC.AudioFileLink invalid".to_string())
        );

        let running = json!({"TaskStatus": "ONGOING"});
        assert_eq!(parse_job_state(&running), JobState::Running("ONGOING".to_string()));
    }

    #[test]
    fn test_source_language_mapping() {
        assert_eq!(source_language(Some("zh"), "cn"), "cn");
        assert_eq!(source_language(Some("EN"), "cn"), "en");
        assert_eq!(source_language(Some("fr"), "cn"), "cn");
        assert_eq!(source_language(None, "multilingual"), "multilingual");
    }
}
