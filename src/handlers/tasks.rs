//! # Task Endpoints
//!
//! ## Available Endpoints:
//! - `POST /api/v1/tasks` - Create a task from a media URL and start downloading
//! - `POST /api/v1/tasks/upload` - Create a task from an uploaded file
//! - `POST /api/v1/tasks/{id}/transcribe` - Start transcription of a downloaded task
//! - `GET /api/v1/tasks/{id}` - Task snapshot with status, progress, logs and results
//!
//! Stage work runs on the pipeline's worker pool; these handlers answer `202 Accepted`
//! as soon as the stage is dispatched.

use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, AppResult};
use crate::pipeline::task::SourceRef;
use crate::pipeline::TaskPipeline;
use crate::remote::storage::sanitize_filename;
use crate::state::AppState;
use crate::transcription::{Provider, TranscribeOptions};

/// Upload size ceiling (2 GiB).
const MAX_UPLOAD_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Multipart field names accepted for the media file.
const UPLOAD_FIELDS: &[&str] = &["file", "audio", "media"];

/// Stem of a stored upload; only the extension of the client's name survives.
const UPLOAD_STEM: &str = "input";

/// `input.<ext>` from the client's file name, or plain `input` without a usable extension.
fn upload_file_name(original_name: &str) -> String {
    let sanitized = sanitize_filename(original_name);
    let extension = std::path::Path::new(&sanitized)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase);

    match extension {
        Some(ext) => format!("{}.{}", UPLOAD_STEM, ext),
        None => UPLOAD_STEM.to_string(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub source_url: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct TranscribeRequest {
    /// "whisper" (default) or "tingwu"
    pub provider: Option<String>,
    pub model: Option<String>,
    pub language: Option<String>,
    pub prompt: Option<String>,
}

/// ## Request Body:
/// ```json
/// { "source_url": "https://example.com/episode.mp3" }
/// ```
pub async fn create_task(
    state: web::Data<AppState>,
    body: web::Json<CreateTaskRequest>,
) -> AppResult<HttpResponse> {
    let pipeline = &state.pipeline;
    let task = pipeline.create_task(SourceRef::Url(body.source_url.trim().to_string()))?;
    pipeline.trigger_download(&task.id)?;

    Ok(HttpResponse::Accepted().json(pipeline.get_task(&task.id)?))
}

/// Multipart upload. The file lands in the task directory before the task exists,
/// so the download stage only has to confirm it is there.
pub async fn upload_task(
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> AppResult<HttpResponse> {
    let pipeline = &state.pipeline;
    let task_id = TaskPipeline::new_task_id();
    let task_dir = pipeline.task_dir(&task_id);
    let mut saved = None;

    while let Some(item) = payload.next().await {
        let field = item.map_err(|e| AppError::BadRequest(format!("Multipart error: {}", e)))?;
        let Some(disposition) = field.content_disposition() else {
            continue;
        };
        if !disposition.get_name().is_some_and(|n| UPLOAD_FIELDS.contains(&n)) {
            continue;
        }

        let original_name = disposition
            .get_filename()
            .map(str::to_string)
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| "upload".to_string());
        let path = task_dir.join(upload_file_name(&original_name));

        tokio::fs::create_dir_all(&task_dir)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create task directory: {}", e)))?;
        let written = save_field(field, &path).await?;
        tracing::info!(task_id = %task_id, bytes = written, "Upload saved to {}", path.display());

        saved = Some((path, original_name));
        break;
    }

    let Some((path, original_name)) = saved else {
        return Err(AppError::BadRequest(format!(
            "No file provided, expected one of the fields: {}",
            UPLOAD_FIELDS.join(", ")
        )));
    };

    let task = pipeline.create_task_with_id(task_id, SourceRef::LocalFile { path, original_name })?;
    pipeline.trigger_download(&task.id)?;

    Ok(HttpResponse::Accepted().json(pipeline.get_task(&task.id)?))
}

async fn save_field(mut field: Field, path: &std::path::Path) -> AppResult<u64> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to create {}: {}", path.display(), e)))?;

    let mut written = 0u64;
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::BadRequest(format!("Upload interrupted: {}", e)))?;
        written += chunk.len() as u64;
        if written > MAX_UPLOAD_BYTES {
            drop(file);
            let _ = tokio::fs::remove_file(path).await;
            return Err(AppError::BadRequest(format!(
                "File too large (max: {} bytes)",
                MAX_UPLOAD_BYTES
            )));
        }
        file.write_all(&chunk)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to write upload: {}", e)))?;
    }
    file.flush()
        .await
        .map_err(|e| AppError::Internal(format!("Failed to write upload: {}", e)))?;

    Ok(written)
}

/// ## Request Body (all optional):
/// ```json
/// { "provider": "whisper", "model": "small", "language": "en", "prompt": "Rust podcast" }
/// ```
pub async fn transcribe_task(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: Option<web::Json<TranscribeRequest>>,
) -> AppResult<HttpResponse> {
    let task_id = path.into_inner();
    let request = body.map(web::Json::into_inner).unwrap_or_default();
    let provider = Provider::parse(request.provider.as_deref());
    let options = TranscribeOptions {
        model: request.model,
        language: request.language,
        prompt: request.prompt,
    };

    state.pipeline.trigger_transcribe(&task_id, provider, options)?;
    Ok(HttpResponse::Accepted().json(state.pipeline.get_task(&task_id)?))
}

pub async fn get_task(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.pipeline.get_task(&path)?))
}
