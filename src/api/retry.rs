//! Retry-queue routes — operator visibility into failed sends.

use axum::Json;
use axum::extract::{Path, State};
use uuid::Uuid;

use crate::api::{ApiError, AppState};

pub async fn list(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let items = state.retries.queue().await?;
    Ok(Json(serde_json::json!({ "items": items })))
}

pub async fn manual_retry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.retries.manual_retry(id).await? {
        return Err(ApiError::NotFound("Retry item not found".into()));
    }
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.retries.cancel(id).await? {
        return Err(ApiError::NotFound("Retry item not found".into()));
    }
    Ok(Json(serde_json::json!({ "success": true })))
}
