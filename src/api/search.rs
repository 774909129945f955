//! Search and statistics routes.

use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;

use crate::api::{ApiError, AppState};
use crate::store::SearchScope;

#[derive(Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_scope() -> String {
    "all".to_string()
}

pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let query = params.q.trim();
    if query.is_empty() {
        return Err(ApiError::BadRequest("Search query is required".into()));
    }
    let scope = SearchScope::parse(&params.scope).ok_or_else(|| {
        ApiError::BadRequest("Scope must be 'all', 'pending', or 'history'".into())
    })?;

    let results = state.store.search_messages(query, scope).await?;
    Ok(Json(serde_json::json!({
        "query": query,
        "count": results.len(),
        "results": results,
    })))
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state.store.stats().await?;
    Ok(Json(serde_json::to_value(&stats).unwrap_or_default()))
}
