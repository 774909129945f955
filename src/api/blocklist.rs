//! Blocklist routes — sender-filter rule management.

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;

use crate::api::{ApiError, AppState};
use crate::blocklist::BlockRule;

pub async fn list(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let rules = state.processor.blocklist().rules().await?;
    Ok(Json(serde_json::json!({ "rules": rules })))
}

pub async fn add(
    State(state): State<AppState>,
    Json(rule): Json<BlockRule>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if rule.value.trim().is_empty() {
        return Err(ApiError::BadRequest("Rule value is required".into()));
    }
    let rules = state.processor.blocklist().add_rule(rule).await?;
    Ok(Json(serde_json::json!({ "success": true, "rules": rules })))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(index): Path<usize>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.processor.blocklist().remove_rule(index).await? {
        Some(rules) => Ok(Json(serde_json::json!({ "success": true, "rules": rules }))),
        None => Err(ApiError::NotFound("Rule index out of range".into())),
    }
}

#[derive(Deserialize)]
pub struct TestBody {
    pub sender: String,
}

pub async fn test_sender(
    State(state): State<AppState>,
    Json(body): Json<TestBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let blocked = state.processor.blocklist().should_block(&body.sender).await?;
    Ok(Json(serde_json::json!({
        "sender": body.sender,
        "blocked": blocked,
    })))
}
