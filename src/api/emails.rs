//! Email routes — pending/history reads, manual replies, dismissal, and
//! the manual processing trigger.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;

use crate::api::{ApiError, AppState};
use crate::pipeline::retry::DEFAULT_MAX_ATTEMPTS;
use crate::store::records::{
    DISMISSED_SENTINEL, MessageRecord, MessageStatus, OutgoingReply, RetryAction,
};

#[derive(Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    50
}

pub async fn pending(
    State(state): State<AppState>,
) -> Result<Json<Vec<MessageRecord>>, ApiError> {
    Ok(Json(state.store.pending_messages().await?))
}

pub async fn history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<MessageRecord>>, ApiError> {
    Ok(Json(state.store.message_history(params.limit).await?))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageRecord>, ApiError> {
    state
        .store
        .get_message(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Email not found".into()))
}

/// Manually trigger one processing cycle.
pub async fn trigger_processing(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let processed = state.processor.process_new().await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "processed_count": processed,
    })))
}

#[derive(Deserialize)]
pub struct ReplyBody {
    pub response: String,
}

/// Send a manual reply to a message awaiting a human.
///
/// A provider failure queues the send for retry and reports 502; the
/// record stays `manual_required` until a send actually lands.
pub async fn reply(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReplyBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.response.trim().is_empty() {
        return Err(ApiError::BadRequest("Response body required".into()));
    }

    let record = state
        .store
        .get_message(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Email not found".into()))?;

    if record.status != MessageStatus::ManualRequired {
        return Err(ApiError::InvalidState(
            "Email is not awaiting a manual reply".into(),
        ));
    }

    let outgoing = OutgoingReply::to_message(&record, &body.response);
    match state.mailer.send(&outgoing).await {
        Some(message_id) => {
            state
                .store
                .update_status_if(
                    &id,
                    MessageStatus::ManualRequired,
                    MessageStatus::Replied,
                    Some(&body.response),
                )
                .await?;
            Ok(Json(serde_json::json!({
                "success": true,
                "message_id": message_id,
            })))
        }
        None => {
            state
                .retries
                .enqueue(
                    &id,
                    RetryAction::SendReply,
                    serde_json::to_value(&outgoing)
                        .map_err(|e| ApiError::Internal(e.to_string()))?,
                    "send returned no message id",
                    DEFAULT_MAX_ATTEMPTS,
                )
                .await?;
            Err(ApiError::SendFailed(
                "Failed to send reply; queued for retry".into(),
            ))
        }
    }
}

/// Dismiss a pending email without replying.
pub async fn dismiss(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state
        .store
        .get_message(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Email not found".into()))?;

    state.mailer.mark_read(&record.id).await;
    state
        .store
        .update_status(&id, MessageStatus::Replied, Some(DISMISSED_SENTINEL))
        .await?;

    Ok(Json(serde_json::json!({ "success": true })))
}

#[derive(Deserialize)]
pub struct BulkDismissBody {
    pub email_ids: Vec<String>,
}

pub async fn bulk_dismiss(
    State(state): State<AppState>,
    Json(body): Json<BulkDismissBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.email_ids.is_empty() {
        return Err(ApiError::BadRequest("No email IDs provided".into()));
    }

    let mut dismissed = 0;
    for id in &body.email_ids {
        let Some(record) = state.store.get_message(id).await? else {
            continue;
        };
        if record.status != MessageStatus::ManualRequired {
            continue;
        }
        state.mailer.mark_read(id).await;
        if state
            .store
            .update_status_if(
                id,
                MessageStatus::ManualRequired,
                MessageStatus::Replied,
                Some(DISMISSED_SENTINEL),
            )
            .await?
        {
            dismissed += 1;
        }
    }

    Ok(Json(serde_json::json!({
        "success": true,
        "dismissed": dismissed,
    })))
}

#[derive(Deserialize)]
pub struct BulkReplyBody {
    pub email_ids: Vec<String>,
    pub response: String,
}

/// Send the same reply to several pending emails. Failed sends are queued
/// for retry and reported in the `failed` count.
pub async fn bulk_reply(
    State(state): State<AppState>,
    Json(body): Json<BulkReplyBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.email_ids.is_empty() {
        return Err(ApiError::BadRequest("No email IDs provided".into()));
    }
    if body.response.trim().is_empty() {
        return Err(ApiError::BadRequest("Response body is required".into()));
    }

    let mut sent = 0;
    let mut failed = 0;

    for id in &body.email_ids {
        let Some(record) = state.store.get_message(id).await? else {
            failed += 1;
            continue;
        };

        let outgoing = OutgoingReply::to_message(&record, &body.response);
        if state.mailer.send(&outgoing).await.is_some() {
            state
                .store
                .update_status(id, MessageStatus::Replied, Some(&body.response))
                .await?;
            state.mailer.mark_read(id).await;
            sent += 1;
        } else {
            let payload = serde_json::to_value(&outgoing)
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            state
                .retries
                .enqueue(
                    id,
                    RetryAction::SendReply,
                    payload,
                    "send returned no message id",
                    DEFAULT_MAX_ATTEMPTS,
                )
                .await?;
            failed += 1;
        }
    }

    Ok(Json(serde_json::json!({
        "success": true,
        "sent": sent,
        "failed": failed,
    })))
}
