//! # History Endpoints
//!
//! The history index is a locked file on disk, so every call runs on actix's
//! blocking pool through `web::block`.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::history::{HistoryStatus, HistoryUpdate, ListQuery};
use crate::state::AppState;

/// PATCH body. Only these two fields are editable; anything else is a 400.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateHistoryRequest {
    pub viewed: Option<bool>,
    pub tags: Option<Vec<String>>,
}

impl From<UpdateHistoryRequest> for HistoryUpdate {
    fn from(request: UpdateHistoryRequest) -> Self {
        HistoryUpdate {
            viewed: request.viewed,
            tags: request.tags,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<usize>,
    pub limit: Option<usize>,
    pub status: Option<String>,
    #[serde(default)]
    pub include_deleted: bool,
}

impl HistoryQuery {
    fn to_list_query(&self) -> AppResult<ListQuery> {
        let defaults = ListQuery::default();
        let status = match self.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(s) => Some(s.parse::<HistoryStatus>()?),
        };

        Ok(ListQuery {
            page: self.page.unwrap_or(defaults.page),
            limit: self.limit.unwrap_or(defaults.limit),
            status,
            include_deleted: self.include_deleted,
        })
    }
}

/// `GET /api/v1/history?page=1&limit=20&status=completed&include_deleted=false`
pub async fn list_history(
    state: web::Data<AppState>,
    query: web::Query<HistoryQuery>,
) -> AppResult<HttpResponse> {
    let list_query = query.to_list_query()?;
    let store = state.history.clone();
    let page_query = list_query.clone();
    let (records, total) = web::block(move || store.list(&page_query)).await??;

    Ok(HttpResponse::Ok().json(json!({
        "records": records,
        "total": total,
        "page": list_query.page.max(1),
        "limit": list_query.limit.clamp(1, state.config.history.max_page_size),
    })))
}

pub async fn get_history(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let task_id = path.into_inner();
    let store = state.history.clone();
    let lookup = task_id.clone();
    let record = web::block(move || store.get(&lookup)).await??;

    record
        .map(|r| HttpResponse::Ok().json(r))
        .ok_or_else(|| AppError::NotFound(format!("History record {} not found", task_id)))
}

/// ## Request Body (any subset):
/// ```json
/// { "viewed": true, "tags": ["rust"] }
/// ```
pub async fn update_history(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<UpdateHistoryRequest>,
) -> AppResult<HttpResponse> {
    let task_id = path.into_inner();
    let store = state.history.clone();
    let update = HistoryUpdate::from(body.into_inner());
    let lookup = task_id.clone();

    let record = web::block(move || {
        if store.update(&lookup, &update)? {
            store.get(&lookup)
        } else {
            Ok(None)
        }
    })
    .await??;

    record
        .map(|r| HttpResponse::Ok().json(r))
        .ok_or_else(|| AppError::NotFound(format!("History record {} not found", task_id)))
}

/// Soft delete: the record stays in the index with status `deleted`.
pub async fn delete_history(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let task_id = path.into_inner();
    let store = state.history.clone();
    let lookup = task_id.clone();

    if web::block(move || store.soft_delete(&lookup)).await?? {
        Ok(HttpResponse::NoContent().finish())
    } else {
        Err(AppError::NotFound(format!("History record {} not found", task_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::test_state;
    use crate::history::{HistoryRecord, MediaType, SourceType};
    use actix_web::http::StatusCode;
    use actix_web::{test, App};

    fn record(task_id: &str) -> HistoryRecord {
        HistoryRecord {
            task_id: task_id.to_string(),
            title: format!("Episode {}", task_id),
            source_url: Some("https://example.com/a.mp3".to_string()),
            source_type: SourceType::Url,
            media_type: MediaType::Audio,
            duration: 120,
            file_size: 2048,
            tags: vec![],
            created_at: chrono::Utc::now(),
            viewed: false,
            thumbnail_url: None,
            status: HistoryStatus::Completed,
        }
    }

    #[actix_web::test]
    async fn test_list_update_and_soft_delete() {
        let (_dir, state) = test_state();
        for id in ["a", "b", "c"] {
            state.history.add(record(id)).unwrap();
        }
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(crate::handlers::configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/history?page=1&limit=2").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["total"], 3);
        assert_eq!(body["records"].as_array().unwrap().len(), 2);
        assert_eq!(body["records"][0]["task_id"], "c");

        let req = test::TestRequest::patch()
            .uri("/api/v1/history/b")
            .set_json(json!({ "viewed": true, "tags": ["rust", "audio"] }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["viewed"], true);
        assert_eq!(body["tags"], json!(["rust", "audio"]));
        assert_eq!(body["title"], "Episode b");

        let req = test::TestRequest::delete().uri("/api/v1/history/a").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

        let req = test::TestRequest::get().uri("/api/v1/history").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["total"], 2);

        let req = test::TestRequest::get()
            .uri("/api/v1/history?include_deleted=true&status=deleted")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["records"][0]["task_id"], "a");
    }

    #[actix_web::test]
    async fn test_missing_record_and_bad_status() {
        let (_dir, state) = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(crate::handlers::configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/history/nope").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::delete().uri("/api/v1/history/nope").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get().uri("/api/v1/history?status=archived").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_patch_cannot_restore_deleted_record() {
        let (_dir, state) = test_state();
        state.history.add(record("a")).unwrap();
        state.history.soft_delete("a").unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(crate::handlers::configure),
        )
        .await;

        for body in [json!({ "status": "completed" }), json!({ "title": "x" })] {
            let req = test::TestRequest::patch()
                .uri("/api/v1/history/a")
                .set_json(body)
                .to_request();
            assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
        }

        let stored = state.history.get("a").unwrap().unwrap();
        assert_eq!(stored.status, HistoryStatus::Deleted);
        assert_eq!(stored.title, "Episode a");

        let req = test::TestRequest::get().uri("/api/v1/history").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["total"], 0);
    }
}
