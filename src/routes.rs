use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::db::Database;
use crate::error::{StoreError, SyncError};
use crate::updater::Updater;

const ENTRIES_PER_PAGE: i64 = 15;

pub struct AppState {
    pub db: Arc<Database>,
    pub updater: Arc<Updater>,
}

// Custom error type
pub struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl AppError {
    fn new(status: StatusCode, error: impl Into<anyhow::Error>) -> Self {
        Self {
            status,
            error: error.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.error.to_string() }))).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        AppError::new(StatusCode::INTERNAL_SERVER_ERROR, err)
    }
}

fn store_error(err: StoreError) -> AppError {
    match err {
        StoreError::FeedNotFound(_) | StoreError::EntryNotFound(_) => {
            AppError::new(StatusCode::NOT_FOUND, err)
        }
        other => AppError::new(StatusCode::INTERNAL_SERVER_ERROR, other),
    }
}

fn sync_error(err: SyncError) -> AppError {
    match err {
        SyncError::Fetch(_) => AppError::new(StatusCode::BAD_GATEWAY, err),
        SyncError::AlreadySubscribed(_) => AppError::new(StatusCode::CONFLICT, err),
        SyncError::Store(inner) => store_error(inner),
        other => AppError::new(StatusCode::INTERNAL_SERVER_ERROR, other),
    }
}

// Route handlers
pub async fn health() -> impl IntoResponse {
    "OK"
}

pub async fn refresh(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let updater = state.updater.clone();
    tokio::spawn(async move {
        // Manual cycles are never interrupted by shutdown
        let (_keep, shutdown) = tokio::sync::watch::channel(false);
        if let Err(e) = updater.run_sync_cycle(&shutdown).await {
            error!("Manual sync failed: {}", e);
        }
    });

    Json(json!({ "refreshing": true }))
}

pub async fn refresh_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let refreshing = state.updater.is_refreshing();
    Json(json!({ "refreshing": refreshing }))
}

#[derive(Debug, Deserialize)]
pub struct CreateFeedRequest {
    pub url: String,
    #[serde(default)]
    pub category_id: Option<i64>,
}

pub async fn create_feed(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateFeedRequest>,
) -> Result<impl IntoResponse, AppError> {
    let id = state
        .updater
        .create_feed_from_url(&request.url, request.category_id)
        .await
        .map_err(sync_error)?;

    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

pub async fn refresh_feed(
    State(state): State<Arc<AppState>>,
    Path(feed_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let stats = state
        .updater
        .refresh_feed(feed_id)
        .await
        .map_err(sync_error)?;

    Ok(Json(json!({ "created": stats.created, "updated": stats.updated })))
}

pub async fn delete_feed(
    State(state): State<Arc<AppState>>,
    Path(feed_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    state
        .db
        .soft_delete_feed(feed_id, Utc::now())
        .await
        .map_err(store_error)?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct EntriesQuery {
    #[serde(default = "first_page")]
    pub page: i64,
}

fn first_page() -> i64 {
    1
}

pub async fn feed_entries(
    State(state): State<Arc<AppState>>,
    Path(feed_id): Path<i64>,
    Query(query): Query<EntriesQuery>,
) -> Result<impl IntoResponse, AppError> {
    let entries = state
        .db
        .list_entries_for_feed(feed_id, query.page, ENTRIES_PER_PAGE, Utc::now())
        .await
        .map_err(store_error)?;

    Ok(Json(entries))
}

pub async fn read_entry(
    State(state): State<Arc<AppState>>,
    Path(entry_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let entry = state
        .db
        .mark_entry_read(entry_id, Utc::now())
        .await
        .map_err(store_error)?;

    Ok(Json(entry))
}
