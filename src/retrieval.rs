//! Knowledge-retrieval client.
//!
//! The retrieval service owns the document store and embeddings; the core
//! only consumes `query`. The contract always yields a context *string* —
//! explicit sentinels for "nothing indexed" and "nothing relevant" keep
//! downstream prompting stable (never null/empty).

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::config::RetrievalConfig;

/// Context returned when the knowledge base holds no documents at all.
pub const NO_DOCUMENTS_CONTEXT: &str = "No knowledge base documents available.";

/// Context returned when nothing relevant matched the query.
pub const NO_RESULTS_CONTEXT: &str = "No relevant information found in knowledge base.";

/// Context returned when the retrieval service itself failed.
pub const SEARCH_ERROR_CONTEXT: &str = "Error searching knowledge base.";

/// True when a context string is one of the sentinel values — i.e. the
/// model would have nothing real to ground an answer in.
pub fn is_empty_context(context: &str) -> bool {
    matches!(
        context,
        NO_DOCUMENTS_CONTEXT | NO_RESULTS_CONTEXT | SEARCH_ERROR_CONTEXT
    )
}

/// Retrieval-service contract consumed by the classifier.
#[async_trait]
pub trait RetrievalClient: Send + Sync {
    /// Search the knowledge base and return relevant context.
    async fn query(&self, text: &str) -> String;
}

// ── HTTP implementation ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    content: String,
    #[serde(default)]
    source: Option<String>,
}

/// JSON client for an external vector-search service.
pub struct HttpRetrieval {
    http: reqwest::Client,
    base_url: String,
    top_k: usize,
}

impl HttpRetrieval {
    pub fn new(config: &RetrievalConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            top_k: config.top_k,
        }
    }
}

#[async_trait]
impl RetrievalClient for HttpRetrieval {
    async fn query(&self, text: &str) -> String {
        let result = self
            .http
            .post(format!("{}/search", self.base_url))
            .json(&serde_json::json!({ "query": text, "top_k": self.top_k }))
            .send()
            .await
            .and_then(|r| r.error_for_status());

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Retrieval query failed: {e}");
                return SEARCH_ERROR_CONTEXT.to_string();
            }
        };

        let search: SearchResponse = match response.json().await {
            Ok(s) => s,
            Err(e) => {
                warn!("Retrieval response unreadable: {e}");
                return SEARCH_ERROR_CONTEXT.to_string();
            }
        };

        format_context(&search.results)
    }
}

/// Format retrieval hits as source-attributed context blocks.
fn format_context(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return NO_RESULTS_CONTEXT.to_string();
    }

    hits.iter()
        .map(|hit| {
            let source = hit.source.as_deref().unwrap_or("Unknown");
            format!("[Source: {source}]\n{}", hit.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_results_use_sentinel() {
        assert_eq!(format_context(&[]), NO_RESULTS_CONTEXT);
    }

    #[test]
    fn hits_are_source_attributed() {
        let hits = vec![
            SearchHit {
                content: "Refunds take 5 days.".into(),
                source: Some("refunds.pdf".into()),
            },
            SearchHit {
                content: "Hours are 9-5.".into(),
                source: None,
            },
        ];
        let context = format_context(&hits);
        assert!(context.contains("[Source: refunds.pdf]\nRefunds take 5 days."));
        assert!(context.contains("[Source: Unknown]\nHours are 9-5."));
        assert!(context.contains("\n\n---\n\n"));
    }

    #[test]
    fn sentinels_count_as_empty_context() {
        assert!(is_empty_context(NO_DOCUMENTS_CONTEXT));
        assert!(is_empty_context(NO_RESULTS_CONTEXT));
        assert!(is_empty_context(SEARCH_ERROR_CONTEXT));
        assert!(!is_empty_context("[Source: x]\nreal content"));
    }
}
