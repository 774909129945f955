//! Draft routes — review queue and the approve/edit/discard/regenerate
//! lifecycle.

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::{ApiError, AppState};

pub async fn list_pending(
    State(state): State<AppState>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    let pending = state.drafts.pending_with_messages().await?;
    let items = pending
        .into_iter()
        .map(|(draft, message)| {
            serde_json::json!({
                "id": draft.id,
                "email_id": draft.message_id,
                "provider_draft_id": draft.provider_draft_id,
                "ai_response": draft.response_text,
                "created_at": draft.created_at,
                "status": draft.status,
                "original_email": message,
            })
        })
        .collect();
    Ok(Json(items))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let draft = state.drafts.get(id).await?;
    Ok(Json(serde_json::to_value(&draft).unwrap_or_default()))
}

pub async fn approve(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let message_id = state.drafts.approve(id).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "message_id": message_id,
    })))
}

#[derive(Deserialize)]
pub struct EditBody {
    pub content: String,
}

pub async fn edit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<EditBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.content.trim().is_empty() {
        return Err(ApiError::BadRequest("Draft content required".into()));
    }
    let draft = state.drafts.edit(id, &body.content).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "draft_id": draft.id,
    })))
}

#[derive(Deserialize, Default)]
pub struct RegenerateBody {
    #[serde(default)]
    pub additional_context: Option<String>,
}

pub async fn regenerate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<RegenerateBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let extra = body.as_ref().and_then(|b| b.additional_context.as_deref());
    let draft = state.drafts.regenerate(id, extra).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "draft_id": draft.id,
        "ai_response": draft.response_text,
    })))
}

pub async fn discard(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.drafts.discard(id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}
