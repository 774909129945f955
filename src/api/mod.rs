//! HTTP surface — thin axum handlers over the domain services.

mod blocklist;
mod drafts;
mod emails;
mod retry;
mod search;

use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use tower_http::cors::CorsLayer;

use crate::error::{DatabaseError, Error};
use crate::mail::MailProvider;
use crate::pipeline::{DraftError, DraftService, EmailProcessor, RetryQueue};
use crate::store::RecordStore;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub mailer: Arc<dyn MailProvider>,
    pub processor: Arc<EmailProcessor>,
    pub retries: Arc<RetryQueue>,
    pub drafts: Arc<DraftService>,
}

/// Build the full application router.
pub fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health))
        .route("/api/emails/process", post(emails::trigger_processing))
        .route("/api/emails/pending", get(emails::pending))
        .route("/api/emails/history", get(emails::history))
        .route("/api/emails/bulk/dismiss", post(emails::bulk_dismiss))
        .route("/api/emails/bulk/reply", post(emails::bulk_reply))
        .route("/api/emails/reply/{id}", post(emails::reply))
        .route(
            "/api/emails/{id}",
            get(emails::get_one).delete(emails::dismiss),
        )
        .route("/api/drafts", get(drafts::list_pending))
        .route(
            "/api/drafts/{id}",
            get(drafts::get_one)
                .put(drafts::edit)
                .delete(drafts::discard),
        )
        .route("/api/drafts/{id}/approve", post(drafts::approve))
        .route("/api/drafts/{id}/regenerate", post(drafts::regenerate))
        .route("/api/retry", get(retry::list))
        .route("/api/retry/{id}/retry", post(retry::manual_retry))
        .route("/api/retry/{id}", delete(retry::cancel))
        .route("/api/search", get(search::search))
        .route("/api/stats", get(search::stats))
        .route("/api/blocklist", get(blocklist::list).post(blocklist::add))
        .route("/api/blocklist/test", post(blocklist::test_sender))
        .route("/api/blocklist/{index}", delete(blocklist::remove))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Handler-level error with its HTTP mapping.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    InvalidState(String),
    BadRequest(String),
    /// The provider refused a send; the operation was queued for retry.
    SendFailed(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::InvalidState(m) => (StatusCode::CONFLICT, m),
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::SendFailed(m) => (StatusCode::BAD_GATEWAY, m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<DraftError> for ApiError {
    fn from(e: DraftError) -> Self {
        match e {
            DraftError::NotFound | DraftError::MessageNotFound => Self::NotFound(e.to_string()),
            DraftError::NotPending => Self::InvalidState(e.to_string()),
            DraftError::SendFailed(m) => Self::SendFailed(m),
            DraftError::GenerationFailed(m) => Self::SendFailed(m),
            DraftError::Database(d) => Self::Internal(d.to_string()),
        }
    }
}
