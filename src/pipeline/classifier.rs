//! Classifier/Router — assigns a handling category to each inbound email
//! and produces the category's response text.
//!
//! Model faults never escape this module: a failed or malformed
//! classification collapses to `pending_manual`, and generation failures
//! surface as typed `GeneratedReply::Fallback` values so callers (and
//! tests) can tell "the model wrote this" from "the model failed and this
//! is the safety net".

use std::sync::Arc;

use tracing::{debug, warn};

use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::retrieval::{RetrievalClient, is_empty_context};
use crate::store::records::{Category, MessageRecord};

/// Max tokens for the classification call (kept tight — runs on every message).
const CLASSIFY_MAX_TOKENS: u32 = 512;

/// Temperature for classification (deterministic-ish).
const CLASSIFY_TEMPERATURE: f32 = 0.1;

/// Max tokens for reply/draft generation.
const GENERATE_MAX_TOKENS: u32 = 1024;

/// Safety-net reply when generic-reply generation fails.
pub const GENERIC_FALLBACK: &str =
    "Thank you for your message. We appreciate you reaching out to us.";

/// Safety-net reply when grounded-reply generation fails.
pub const RAG_FALLBACK: &str = "Thank you for your question. Let me connect you with our team \
     who can provide more detailed information.";

/// Outcome of classifying one email.
#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub category: Category,
    pub confidence: f32,
    pub reasoning: String,
}

/// Why a generation fell back instead of using model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// The model call failed or returned nothing usable.
    ModelError(String),
    /// Retrieval produced no grounding context; answering would fabricate.
    NoContext,
}

/// A generated response, tagged with its provenance.
#[derive(Debug, Clone)]
pub enum GeneratedReply {
    /// The model produced this text.
    Generated(String),
    /// The safety net produced this text.
    Fallback {
        reason: FallbackReason,
        text: String,
    },
}

impl GeneratedReply {
    pub fn text(&self) -> &str {
        match self {
            Self::Generated(text) => text,
            Self::Fallback { text, .. } => text,
        }
    }
}

/// Classifier/Router over the model and retrieval collaborators.
pub struct Classifier {
    llm: Arc<dyn LlmProvider>,
    retrieval: Arc<dyn RetrievalClient>,
}

impl Classifier {
    pub fn new(llm: Arc<dyn LlmProvider>, retrieval: Arc<dyn RetrievalClient>) -> Self {
        Self { llm, retrieval }
    }

    /// Classify and generate in one pass.
    pub async fn route(
        &self,
        record: &MessageRecord,
    ) -> (ClassificationResult, Option<GeneratedReply>) {
        let classification = self.classify(record).await;
        let reply = self
            .generate(record, classification.category, None)
            .await;
        (classification, reply)
    }

    /// Classify an email into one of the four categories.
    ///
    /// Any fault — transport, timeout, malformed JSON, unknown category
    /// string — yields `pending_manual` with confidence 0.
    pub async fn classify(&self, record: &MessageRecord) -> ClassificationResult {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(CLASSIFY_SYSTEM_PROMPT),
            ChatMessage::user(build_classify_prompt(record)),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let raw = match self.llm.complete(request).await {
            Ok(response) => response.content,
            Err(e) => {
                warn!(id = %record.id, "Classification call failed: {e}");
                return manual_fallback(format!("Classification failed: {e}"));
            }
        };

        match parse_classification(&raw) {
            Ok(result) => {
                debug!(
                    id = %record.id,
                    category = result.category.as_str(),
                    confidence = result.confidence,
                    "Email classified"
                );
                result
            }
            Err(e) => {
                warn!(id = %record.id, raw = %raw, "Unusable classification: {e}");
                manual_fallback(format!("Classification failed: {e}"))
            }
        }
    }

    /// Generate the response for an already-chosen category.
    ///
    /// `extra_context` is operator-supplied text appended to retrieved
    /// context during regeneration.
    pub async fn generate(
        &self,
        record: &MessageRecord,
        category: Category,
        extra_context: Option<&str>,
    ) -> Option<GeneratedReply> {
        match category {
            Category::PendingManual => None,
            Category::AutoReply => Some(self.generate_generic(record).await),
            Category::RagReply => match self.gather_context(record, extra_context).await {
                Some(context) => Some(self.generate_grounded(record, &context).await),
                None => Some(no_context_fallback(record)),
            },
            Category::DraftReview => match self.gather_context(record, extra_context).await {
                Some(context) => Some(self.generate_draft(record, &context).await),
                None => Some(no_context_fallback(record)),
            },
        }
    }

    /// Regenerate a response with optional operator context.
    pub async fn regenerate(
        &self,
        record: &MessageRecord,
        category: Category,
        extra_context: Option<&str>,
    ) -> Option<GeneratedReply> {
        self.generate(record, category, extra_context).await
    }

    /// Retrieve context for knowledge-dependent categories.
    ///
    /// When retrieval reports nothing and the operator added nothing, the
    /// result is a `Fallback(NoContext)` wrapped in `Some` — callers decide
    /// what that means for the message. Returns the combined context string
    /// otherwise.
    async fn gather_context(
        &self,
        record: &MessageRecord,
        extra_context: Option<&str>,
    ) -> Option<String> {
        let query = format!("{} {}", record.body, record.subject);
        let retrieved = self.retrieval.query(&query).await;

        match extra_context {
            Some(extra) if !extra.trim().is_empty() => {
                if is_empty_context(&retrieved) {
                    Some(format!("Additional context:\n{extra}"))
                } else {
                    Some(format!("{retrieved}\n\nAdditional context:\n{extra}"))
                }
            }
            _ if is_empty_context(&retrieved) => None,
            _ => Some(retrieved),
        }
    }

    async fn generate_generic(&self, record: &MessageRecord) -> GeneratedReply {
        let prompt = format!(
            "Generate a brief, polite response to this simple email.\n\
             Keep it professional but warm. 1-3 sentences max.\n\n\
             From: {from}\n\
             Subject: {subject}\n\
             Body: {body}\n\n\
             Just write the response body, no subject line or signature.",
            from = display_sender(record),
            subject = record.subject,
            body = truncate(&record.body, 500),
        );

        match self.complete_text(prompt).await {
            Ok(text) => GeneratedReply::Generated(text),
            Err(e) => {
                warn!(id = %record.id, "Generic reply generation failed: {e}");
                GeneratedReply::Fallback {
                    reason: FallbackReason::ModelError(e),
                    text: GENERIC_FALLBACK.to_string(),
                }
            }
        }
    }

    async fn generate_grounded(&self, record: &MessageRecord, context: &str) -> GeneratedReply {
        let prompt = format!(
            "You are a helpful customer service representative.\n\
             Use the provided company knowledge to answer the customer's question.\n\
             Be professional, accurate, and helpful.\n\n\
             CUSTOMER EMAIL:\n\
             From: {from}\n\
             Subject: {subject}\n\
             Question: {body}\n\n\
             COMPANY KNOWLEDGE BASE CONTEXT:\n\
             {context}\n\n\
             Instructions:\n\
             - Answer based ONLY on the provided context\n\
             - If the context doesn't contain relevant information, say you'll forward to the appropriate team\n\
             - Be concise but complete\n\
             - End with an offer to help further\n\n\
             Write only the response body:",
            from = display_sender(record),
            subject = record.subject,
            body = truncate(&record.body, 1500),
        );

        match self.complete_text(prompt).await {
            Ok(text) => GeneratedReply::Generated(text),
            Err(e) => {
                warn!(id = %record.id, "Grounded reply generation failed: {e}");
                GeneratedReply::Fallback {
                    reason: FallbackReason::ModelError(e),
                    text: RAG_FALLBACK.to_string(),
                }
            }
        }
    }

    async fn generate_draft(&self, record: &MessageRecord, context: &str) -> GeneratedReply {
        let prompt = format!(
            "Generate a professional response to this customer email.\n\
             This will be reviewed by staff before sending, so be thorough but accurate.\n\n\
             CUSTOMER EMAIL:\n\
             From: {from}\n\
             Subject: {subject}\n\
             Body: {body}\n\n\
             AVAILABLE COMPANY INFORMATION:\n\
             {context}\n\n\
             Instructions:\n\
             - Write a complete, professional response\n\
             - If you're unsure about specific details, indicate [VERIFY: detail to verify]\n\
             - Be helpful and offer to assist further\n\
             - Use a professional but friendly tone\n\n\
             Write only the response body:",
            from = display_sender(record),
            subject = record.subject,
            body = truncate(&record.body, 2000),
        );

        match self.complete_text(prompt).await {
            Ok(text) => GeneratedReply::Generated(text),
            Err(e) => {
                warn!(id = %record.id, "Draft generation failed: {e}");
                GeneratedReply::Fallback {
                    reason: FallbackReason::ModelError(e),
                    text: String::new(),
                }
            }
        }
    }

    async fn complete_text(&self, prompt: String) -> Result<String, String> {
        let request = CompletionRequest::new(vec![ChatMessage::user(prompt)])
            .with_max_tokens(GENERATE_MAX_TOKENS);

        match self.llm.complete(request).await {
            Ok(response) => {
                let text = response.content.trim().to_string();
                if text.is_empty() {
                    Err("model returned empty text".into())
                } else {
                    Ok(text)
                }
            }
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Retrieval had nothing to ground an answer in; the message goes to a
/// human rather than risking a fabricated reply.
fn no_context_fallback(record: &MessageRecord) -> GeneratedReply {
    debug!(id = %record.id, "No retrieval context — suppressing generation");
    GeneratedReply::Fallback {
        reason: FallbackReason::NoContext,
        text: String::new(),
    }
}

fn manual_fallback(reasoning: String) -> ClassificationResult {
    ClassificationResult {
        category: Category::PendingManual,
        confidence: 0.0,
        reasoning,
    }
}

fn display_sender(record: &MessageRecord) -> &str {
    record.sender_name.as_deref().unwrap_or(&record.sender)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

// ── Prompt construction ─────────────────────────────────────────────

const CLASSIFY_SYSTEM_PROMPT: &str = "You are an email triage engine for a customer-facing inbox. \
     Classify each email into exactly one category and respond with JSON only.";

fn build_classify_prompt(record: &MessageRecord) -> String {
    format!(
        "Analyze this email and classify it into ONE of these categories:\n\n\
         1. AUTO_REPLY: Generic/simple messages that don't need company knowledge or verification.\n\
            Examples: \"Thank you\", \"OK\", \"Got it\", \"Noted\", simple acknowledgments.\n\n\
         2. RAG_REPLY: Questions about company information, products, policies, FAQs.\n\
            Examples: \"What are your business hours?\", \"How do I return a product?\"\n\n\
         3. PENDING_MANUAL: Critical issues that REQUIRE human attention.\n\
            Examples: Complaints, legal matters, refund requests, urgent issues, angry customers.\n\n\
         4. DRAFT_REVIEW: Questions the AI can answer but should be verified by staff first.\n\
            Examples: Complex product questions, pricing inquiries, partnership requests.\n\n\
         EMAIL DETAILS:\n\
         From: {from}\n\
         Subject: {subject}\n\
         Body:\n\
         {body}\n\n\
         Respond in this exact JSON format:\n\
         {{\n\
             \"category\": \"AUTO_REPLY\" or \"RAG_REPLY\" or \"PENDING_MANUAL\" or \"DRAFT_REVIEW\",\n\
             \"confidence\": 0.0 to 1.0,\n\
             \"reasoning\": \"Brief explanation of why this category was chosen\"\n\
         }}\n\n\
         Only output the JSON, nothing else.",
        from = display_sender(record),
        subject = record.subject,
        body = truncate(&record.body, 2000),
    )
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct ClassifyResponse {
    category: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    reasoning: String,
}

/// Parse the model's classification output.
fn parse_classification(raw: &str) -> Result<ClassificationResult, String> {
    let json_str = extract_json_object(raw);
    let response: ClassifyResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let category = match response.category.as_str() {
        "AUTO_REPLY" => Category::AutoReply,
        "RAG_REPLY" => Category::RagReply,
        "PENDING_MANUAL" => Category::PendingManual,
        "DRAFT_REVIEW" => Category::DraftReview,
        other => return Err(format!("unknown category: '{other}'")),
    };

    Ok(ClassificationResult {
        category,
        confidence: response.confidence.clamp(0.0, 1.0),
        reasoning: response.reasoning,
    })
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::error::LlmError;
    use crate::llm::provider::{CompletionResponse, LlmProvider};
    use crate::retrieval::{NO_RESULTS_CONTEXT, RetrievalClient};
    use crate::store::records::MessageStatus;
    use chrono::Utc;

    /// Mock LLM returning queued responses in order.
    pub struct MockLlm {
        responses: Mutex<VecDeque<Result<String, String>>>,
    }

    impl MockLlm {
        pub fn new(responses: Vec<Result<String, String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
            })
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for MockLlm {
        fn model_name(&self) -> &str {
            "mock"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err("mock exhausted".into()));
            match next {
                Ok(content) => Ok(CompletionResponse { content }),
                Err(reason) => Err(LlmError::RequestFailed {
                    provider: "mock".into(),
                    reason,
                }),
            }
        }
    }

    /// Mock retrieval returning a fixed context string.
    pub struct MockRetrieval {
        pub context: String,
    }

    impl MockRetrieval {
        pub fn with_context(context: &str) -> Arc<Self> {
            Arc::new(Self {
                context: context.into(),
            })
        }
    }

    #[async_trait::async_trait]
    impl RetrievalClient for MockRetrieval {
        async fn query(&self, _text: &str) -> String {
            self.context.clone()
        }
    }

    pub fn record(id: &str) -> MessageRecord {
        MessageRecord {
            id: id.into(),
            thread_id: format!("thread-{id}"),
            sender: "alice@example.com".into(),
            sender_name: Some("Alice".into()),
            recipient: "support@company.com".into(),
            subject: "Business hours".into(),
            body: "What are your business hours?".into(),
            body_html: None,
            attachments: vec![],
            received_at: Utc::now(),
            category: None,
            status: MessageStatus::Pending,
            ai_response: None,
            processed_at: None,
        }
    }

    fn classifier(
        llm: Arc<MockLlm>,
        retrieval: Arc<MockRetrieval>,
    ) -> Classifier {
        Classifier::new(llm, retrieval)
    }

    // ── Classification parsing ──────────────────────────────────────

    #[test]
    fn parse_plain_json() {
        let result = parse_classification(
            r#"{"category": "RAG_REPLY", "confidence": 0.9, "reasoning": "policy question"}"#,
        )
        .unwrap();
        assert_eq!(result.category, Category::RagReply);
        assert!((result.confidence - 0.9).abs() < 0.01);
        assert_eq!(result.reasoning, "policy question");
    }

    #[test]
    fn parse_markdown_wrapped_json() {
        let raw = "Here you go:\n```json\n{\"category\": \"AUTO_REPLY\", \"confidence\": 0.8}\n```";
        let result = parse_classification(raw).unwrap();
        assert_eq!(result.category, Category::AutoReply);
    }

    #[test]
    fn parse_json_embedded_in_prose() {
        let raw = "Assessment: {\"category\": \"DRAFT_REVIEW\", \"confidence\": 0.7} done.";
        let result = parse_classification(raw).unwrap();
        assert_eq!(result.category, Category::DraftReview);
    }

    #[test]
    fn parse_unknown_category_fails() {
        assert!(parse_classification(r#"{"category": "ESCALATE"}"#).is_err());
    }

    #[test]
    fn parse_confidence_clamped() {
        let result =
            parse_classification(r#"{"category": "AUTO_REPLY", "confidence": 3.5}"#).unwrap();
        assert!((result.confidence - 1.0).abs() < 0.01);
    }

    // ── Classification fault absorption ─────────────────────────────

    #[tokio::test]
    async fn classify_llm_error_becomes_pending_manual() {
        let llm = MockLlm::new(vec![Err("connection timed out".into())]);
        let c = classifier(llm, MockRetrieval::with_context("ctx"));
        let result = c.classify(&record("m1")).await;
        assert_eq!(result.category, Category::PendingManual);
        assert_eq!(result.confidence, 0.0);
        assert!(result.reasoning.contains("Classification failed"));
    }

    #[tokio::test]
    async fn classify_garbage_becomes_pending_manual() {
        let llm = MockLlm::new(vec![Ok("I think this is spam maybe?".into())]);
        let c = classifier(llm, MockRetrieval::with_context("ctx"));
        let result = c.classify(&record("m1")).await;
        assert_eq!(result.category, Category::PendingManual);
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn classify_unknown_category_becomes_pending_manual() {
        let llm = MockLlm::new(vec![Ok(r#"{"category": "FORWARD", "confidence": 0.9}"#.into())]);
        let c = classifier(llm, MockRetrieval::with_context("ctx"));
        let result = c.classify(&record("m1")).await;
        assert_eq!(result.category, Category::PendingManual);
    }

    // ── Generation routing ──────────────────────────────────────────

    #[tokio::test]
    async fn route_auto_reply_generates_without_retrieval() {
        let llm = MockLlm::new(vec![
            Ok(r#"{"category": "AUTO_REPLY", "confidence": 0.95, "reasoning": "ack"}"#.into()),
            Ok("You're welcome!".into()),
        ]);
        let c = classifier(llm, MockRetrieval::with_context(NO_RESULTS_CONTEXT));
        let (classification, reply) = c.route(&record("m1")).await;
        assert_eq!(classification.category, Category::AutoReply);
        match reply.unwrap() {
            GeneratedReply::Generated(text) => assert_eq!(text, "You're welcome!"),
            other => panic!("expected Generated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn route_pending_manual_generates_nothing() {
        let llm = MockLlm::new(vec![Ok(
            r#"{"category": "PENDING_MANUAL", "confidence": 0.9}"#.into()
        )]);
        let c = classifier(llm, MockRetrieval::with_context("ctx"));
        let (classification, reply) = c.route(&record("m1")).await;
        assert_eq!(classification.category, Category::PendingManual);
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn rag_reply_uses_retrieved_context() {
        let llm = MockLlm::new(vec![Ok("We are open 9-5.".into())]);
        let c = classifier(
            llm,
            MockRetrieval::with_context("[Source: faq.txt]\nHours: 9-5"),
        );
        let reply = c
            .generate(&record("m1"), Category::RagReply, None)
            .await
            .unwrap();
        assert!(matches!(reply, GeneratedReply::Generated(_)));
    }

    #[tokio::test]
    async fn rag_reply_without_context_is_suppressed() {
        // No retrieval hits → NoContext fallback, the model is never asked.
        let llm = MockLlm::new(vec![Ok("fabricated answer".into())]);
        let c = classifier(llm, MockRetrieval::with_context(NO_RESULTS_CONTEXT));
        let reply = c
            .generate(&record("m1"), Category::RagReply, None)
            .await
            .unwrap();
        match reply {
            GeneratedReply::Fallback { reason, text } => {
                assert_eq!(reason, FallbackReason::NoContext);
                assert!(text.is_empty());
            }
            other => panic!("expected NoContext fallback, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rag_reply_generation_error_falls_back() {
        let llm = MockLlm::new(vec![Err("rate limited".into())]);
        let c = classifier(llm, MockRetrieval::with_context("[Source: x]\nctx"));
        let reply = c
            .generate(&record("m1"), Category::RagReply, None)
            .await
            .unwrap();
        match reply {
            GeneratedReply::Fallback { reason, text } => {
                assert!(matches!(reason, FallbackReason::ModelError(_)));
                assert_eq!(text, RAG_FALLBACK);
            }
            other => panic!("expected Fallback, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn auto_reply_generation_error_falls_back_to_generic_text() {
        let llm = MockLlm::new(vec![Err("boom".into())]);
        let c = classifier(llm, MockRetrieval::with_context("ctx"));
        let reply = c
            .generate(&record("m1"), Category::AutoReply, None)
            .await
            .unwrap();
        assert_eq!(reply.text(), GENERIC_FALLBACK);
    }

    #[tokio::test]
    async fn regenerate_with_operator_context_overrides_empty_retrieval() {
        // Retrieval finds nothing, but the operator supplied context, so
        // the draft is still generated.
        let llm = MockLlm::new(vec![Ok("Draft using operator notes.".into())]);
        let c = classifier(llm, MockRetrieval::with_context(NO_RESULTS_CONTEXT));
        let reply = c
            .regenerate(
                &record("m1"),
                Category::DraftReview,
                Some("We ship worldwide."),
            )
            .await
            .unwrap();
        assert!(matches!(reply, GeneratedReply::Generated(_)));
    }

    #[tokio::test]
    async fn draft_generation_error_yields_empty_fallback() {
        let llm = MockLlm::new(vec![Err("boom".into())]);
        let c = classifier(llm, MockRetrieval::with_context("[Source: x]\nctx"));
        let reply = c
            .generate(&record("m1"), Category::DraftReview, None)
            .await
            .unwrap();
        match reply {
            GeneratedReply::Fallback { reason, text } => {
                assert!(matches!(reason, FallbackReason::ModelError(_)));
                assert!(text.is_empty());
            }
            other => panic!("expected Fallback, got {other:?}"),
        }
    }
}
