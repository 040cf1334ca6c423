//! # Model and Provider Endpoints
//!
//! ## Available Endpoints:
//! - `GET /api/v1/providers` - Transcription providers and what each one is missing
//! - `GET /api/v1/models` - Local Whisper checkpoints with download and load status
//! - `POST /api/v1/models/{name}/download` - Fetch a checkpoint into the local cache
//!
//! Transcription never downloads a model on its own; a missing checkpoint fails the
//! task until it is fetched here.

use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::error::AppResult;
use crate::state::AppState;

/// ## Response:
/// ```json
/// {
///   "providers": [
///     { "name": "whisper", "available": true, "missing": [] },
///     { "name": "tingwu", "available": false, "missing": ["TINGWU_APP_KEY"] }
///   ]
/// }
/// ```
pub async fn list_providers(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "providers": state.pipeline.router().providers(),
    }))
}

/// ## Response:
/// ```json
/// {
///   "default_model": "base",
///   "models": [
///     {
///       "name": "base",
///       "repo": "openai/whisper-base",
///       "description": "...",
///       "size_mb": 142,
///       "english_only": false,
///       "downloaded": true,
///       "loaded": false
///     }
///   ]
/// }
/// ```
pub async fn list_models(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let local = state.local.clone();
    // Cache lookups touch the filesystem
    let models = web::block(move || local.list_models()).await?;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "default_model": state.local.default_model(),
        "models": models,
    })))
}

pub async fn download_model(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let name = path.into_inner();
    let started = std::time::Instant::now();
    let info = state.local.download_model(&name).await?;

    tracing::info!(
        model = %info.name,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Model download finished"
    );

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "model": info,
        "download_time_seconds": started.elapsed().as_secs_f64(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::test_state;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_providers_report_missing_settings() {
        let (_dir, state) = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(crate::handlers::configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/providers").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        let providers = body["providers"].as_array().unwrap();

        assert_eq!(providers[0]["name"], "whisper");
        assert_eq!(providers[0]["available"], true);
        assert_eq!(providers[1]["name"], "tingwu");
        assert_eq!(providers[1]["available"], false);
        assert!(providers[1]["missing"]
            .as_array()
            .unwrap()
            .contains(&json!("TINGWU_APP_KEY")));
    }

    #[actix_web::test]
    async fn test_models_listed_as_not_downloaded() {
        let (_dir, state) = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(crate::handlers::configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/models").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        let models = body["models"].as_array().unwrap();

        assert_eq!(body["default_model"], "base");
        assert_eq!(models.len(), 10);
        assert!(models.iter().all(|m| m["downloaded"] == false && m["loaded"] == false));
    }

    #[actix_web::test]
    async fn test_unknown_model_download_is_rejected() {
        let (_dir, state) = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(crate::handlers::configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/models/gigantic/download")
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }
}
