//! # HTTP Handlers
//!
//! Thin translation from HTTP to pipeline, history and model operations. No handler
//! holds state of its own; everything goes through [`AppState`](crate::state::AppState).
//!
//! ## Routes (under `/api/v1`):
//! - `POST /tasks`, `POST /tasks/upload`, `POST /tasks/{id}/transcribe`, `GET /tasks/{id}`
//! - `GET /history`, `GET|PATCH|DELETE /history/{id}`
//! - `GET /providers`, `GET /models`, `POST /models/{name}/download`

pub mod history;
pub mod models;
pub mod tasks;

use actix_web::web;

/// Register every `/api/v1` route.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/tasks", web::post().to(tasks::create_task))
            .route("/tasks/upload", web::post().to(tasks::upload_task))
            .route("/tasks/{id}", web::get().to(tasks::get_task))
            .route("/tasks/{id}/transcribe", web::post().to(tasks::transcribe_task))
            .route("/history", web::get().to(history::list_history))
            .route("/history/{id}", web::get().to(history::get_history))
            .route("/history/{id}", web::patch().to(history::update_history))
            .route("/history/{id}", web::delete().to(history::delete_history))
            .route("/providers", web::get().to(models::list_providers))
            .route("/models", web::get().to(models::list_models))
            .route("/models/{name}/download", web::post().to(models::download_model))
            .route("/health", web::get().to(crate::health::health_check)),
    );
}
