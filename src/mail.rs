//! Mail provider — inbound fetch and outbound send/draft operations.
//!
//! The provider contract is deliberately forgiving: every operation
//! returns a `None`/`false` sentinel on failure instead of an error type.
//! The pipeline converts those sentinels into record statuses or retry
//! entries; nothing downstream interprets provider faults.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::MailConfig;
use crate::store::records::{Attachment, MessageRecord, MessageStatus, OutgoingReply};

/// Inline attachment content is kept only below this size.
const INLINE_ATTACHMENT_LIMIT: usize = 64 * 1024;

/// Narrow mail-provider contract consumed by the pipeline.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Fetch up to `max_results` unread inbox messages.
    async fn fetch_unread(&self, max_results: usize) -> Vec<MessageRecord>;

    /// Send a reply. Returns the sent message id, or `None` on failure.
    async fn send(&self, reply: &OutgoingReply) -> Option<String>;

    /// Create a provider-side draft. Returns the draft handle.
    async fn create_draft(&self, reply: &OutgoingReply) -> Option<String>;

    /// Send a previously created draft. Returns the sent message id.
    async fn send_draft(&self, draft_handle: &str) -> Option<String>;

    /// Delete a provider-side draft.
    async fn delete_draft(&self, draft_handle: &str) -> bool;

    /// Clear the unread flag on a message.
    async fn mark_read(&self, message_id: &str) -> bool;
}

// ── Gmail REST client ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    messages: Vec<ListEntry>,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    id: String,
    #[serde(default)]
    thread_id: String,
    #[serde(default)]
    raw: String,
    #[serde(default)]
    internal_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

/// Gmail-style REST mail provider.
pub struct GmailClient {
    http: reqwest::Client,
    base_url: String,
    access_token: SecretString,
    from_address: String,
}

impl GmailClient {
    pub fn new(config: &MailConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
            from_address: config.from_address.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{path}", self.base_url)
    }

    fn bearer(&self) -> &str {
        self.access_token.expose_secret()
    }

    /// Fetch one message in raw RFC 822 form and parse it into a record.
    async fn fetch_message(&self, id: &str) -> Option<MessageRecord> {
        let response = self
            .http
            .get(self.url(&format!("messages/{id}")))
            .query(&[("format", "raw")])
            .bearer_auth(self.bearer())
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?;

        let raw: RawMessage = response.json().await.ok()?;
        parse_inbound(&raw, &self.from_address)
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    async fn fetch_unread(&self, max_results: usize) -> Vec<MessageRecord> {
        let response = match self
            .http
            .get(self.url("messages"))
            .query(&[
                ("labelIds", "INBOX"),
                ("labelIds", "UNREAD"),
                ("maxResults", &max_results.to_string()),
            ])
            .bearer_auth(self.bearer())
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(r) => r,
            Err(e) => {
                warn!("Failed to list unread messages: {e}");
                return Vec::new();
            }
        };

        let list: ListResponse = match response.json().await {
            Ok(l) => l,
            Err(e) => {
                warn!("Failed to decode message list: {e}");
                return Vec::new();
            }
        };

        let mut records = Vec::with_capacity(list.messages.len());
        for entry in &list.messages {
            match self.fetch_message(&entry.id).await {
                Some(record) => records.push(record),
                None => warn!(id = %entry.id, "Failed to fetch message details"),
            }
        }
        debug!(count = records.len(), "Fetched unread messages");
        records
    }

    async fn send(&self, reply: &OutgoingReply) -> Option<String> {
        let raw = build_raw_message(&self.from_address, reply)?;
        let mut body = serde_json::json!({ "raw": raw });
        if let Some(ref thread_id) = reply.thread_id {
            body["threadId"] = serde_json::Value::String(thread_id.clone());
        }

        let result = self
            .http
            .post(self.url("messages/send"))
            .bearer_auth(self.bearer())
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match result {
            Ok(response) => match response.json::<IdResponse>().await {
                Ok(sent) => {
                    debug!(to = %reply.to, id = %sent.id, "Reply sent");
                    Some(sent.id)
                }
                Err(e) => {
                    warn!("Send succeeded but response was unreadable: {e}");
                    None
                }
            },
            Err(e) => {
                warn!(to = %reply.to, "Failed to send reply: {e}");
                None
            }
        }
    }

    async fn create_draft(&self, reply: &OutgoingReply) -> Option<String> {
        let raw = build_raw_message(&self.from_address, reply)?;
        let mut message = serde_json::json!({ "raw": raw });
        if let Some(ref thread_id) = reply.thread_id {
            message["threadId"] = serde_json::Value::String(thread_id.clone());
        }

        let result = self
            .http
            .post(self.url("drafts"))
            .bearer_auth(self.bearer())
            .json(&serde_json::json!({ "message": message }))
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match result {
            Ok(response) => match response.json::<IdResponse>().await {
                Ok(draft) => {
                    debug!(to = %reply.to, handle = %draft.id, "Draft created");
                    Some(draft.id)
                }
                Err(e) => {
                    warn!("Draft created but response was unreadable: {e}");
                    None
                }
            },
            Err(e) => {
                warn!(to = %reply.to, "Failed to create draft: {e}");
                None
            }
        }
    }

    async fn send_draft(&self, draft_handle: &str) -> Option<String> {
        let result = self
            .http
            .post(self.url("drafts/send"))
            .bearer_auth(self.bearer())
            .json(&serde_json::json!({ "id": draft_handle }))
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match result {
            Ok(response) => match response.json::<IdResponse>().await {
                Ok(sent) => Some(sent.id),
                Err(e) => {
                    warn!("Draft send response unreadable: {e}");
                    None
                }
            },
            Err(e) => {
                warn!(handle = draft_handle, "Failed to send draft: {e}");
                None
            }
        }
    }

    async fn delete_draft(&self, draft_handle: &str) -> bool {
        match self
            .http
            .delete(self.url(&format!("drafts/{draft_handle}")))
            .bearer_auth(self.bearer())
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(_) => true,
            Err(e) => {
                warn!(handle = draft_handle, "Failed to delete draft: {e}");
                false
            }
        }
    }

    async fn mark_read(&self, message_id: &str) -> bool {
        match self
            .http
            .post(self.url(&format!("messages/{message_id}/modify")))
            .bearer_auth(self.bearer())
            .json(&serde_json::json!({ "removeLabelIds": ["UNREAD"] }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(_) => true,
            Err(e) => {
                warn!(id = message_id, "Failed to mark message read: {e}");
                false
            }
        }
    }
}

// ── MIME helpers ────────────────────────────────────────────────────

/// Build a base64url-encoded RFC 822 message for the provider API.
fn build_raw_message(from: &str, reply: &OutgoingReply) -> Option<String> {
    let from_mbox = match from.parse() {
        Ok(m) => m,
        Err(e) => {
            warn!(from = from, "Invalid from address: {e}");
            return None;
        }
    };
    let to_mbox = match reply.to.parse() {
        Ok(m) => m,
        Err(e) => {
            warn!(to = %reply.to, "Invalid to address: {e}");
            return None;
        }
    };

    let message = match lettre::Message::builder()
        .from(from_mbox)
        .to(to_mbox)
        .subject(&reply.subject)
        .header(lettre::message::header::ContentType::TEXT_PLAIN)
        .body(reply.body.clone())
    {
        Ok(m) => m,
        Err(e) => {
            warn!("Failed to build MIME message: {e}");
            return None;
        }
    };

    Some(URL_SAFE.encode(message.formatted()))
}

/// Decode base64url with or without padding (providers vary).
fn decode_b64url(raw: &str) -> Option<Vec<u8>> {
    URL_SAFE
        .decode(raw)
        .or_else(|_| URL_SAFE_NO_PAD.decode(raw.trim_end_matches('=')))
        .ok()
}

/// Parse a raw provider message into a pending `MessageRecord`.
fn parse_inbound(raw: &RawMessage, recipient_fallback: &str) -> Option<MessageRecord> {
    let bytes = decode_b64url(&raw.raw)?;
    let parsed = MessageParser::default().parse(&bytes)?;

    let (sender, sender_name) = extract_sender(&parsed);
    let subject = parsed.subject().unwrap_or("(No Subject)").to_string();
    let body = extract_text(&parsed);
    let body_html = parsed.body_html(0).map(|h| h.to_string());

    let recipient = parsed
        .to()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| recipient_fallback.to_string());

    let received_at = raw
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms))
        .unwrap_or_else(Utc::now);

    let attachments = parsed
        .attachments()
        .map(|part| {
            let contents = part.contents();
            Attachment {
                filename: part.attachment_name().unwrap_or("attachment").to_string(),
                mime_type: part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(sub) => format!("{}/{}", ct.ctype(), sub),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size: contents.len(),
                content: (contents.len() <= INLINE_ATTACHMENT_LIMIT)
                    .then(|| STANDARD.encode(contents)),
            }
        })
        .collect();

    Some(MessageRecord {
        id: raw.id.clone(),
        thread_id: raw.thread_id.clone(),
        sender,
        sender_name,
        recipient,
        subject,
        body,
        body_html,
        attachments,
        received_at,
        category: None,
        status: MessageStatus::Pending,
        ai_response: None,
        processed_at: None,
    })
}

/// Extract the sender address and display name from a parsed email.
fn extract_sender(parsed: &mail_parser::Message) -> (String, Option<String>) {
    let addr = parsed.from().and_then(|a| a.first());
    let sender = addr
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());
    let name = addr
        .and_then(|a| a.name())
        .map(|s| s.trim_matches('"').to_string())
        .filter(|s| !s.is_empty());
    (sender, name)
}

/// Extract readable text from a parsed email, falling back to stripped HTML.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_EMAIL: &str = "From: \"Alice Example\" <alice@example.com>\r\n\
        To: support@company.com\r\n\
        Subject: Refund question\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        What is your refund policy?\r\n";

    fn raw_message(rfc822: &str) -> RawMessage {
        RawMessage {
            id: "m1".into(),
            thread_id: "t1".into(),
            raw: URL_SAFE.encode(rfc822),
            internal_date: Some("1700000000000".into()),
        }
    }

    #[test]
    fn parse_inbound_extracts_headers_and_body() {
        let record = parse_inbound(&raw_message(SAMPLE_EMAIL), "fallback@company.com").unwrap();
        assert_eq!(record.id, "m1");
        assert_eq!(record.thread_id, "t1");
        assert_eq!(record.sender, "alice@example.com");
        assert_eq!(record.sender_name.as_deref(), Some("Alice Example"));
        assert_eq!(record.recipient, "support@company.com");
        assert_eq!(record.subject, "Refund question");
        assert_eq!(record.body, "What is your refund policy?");
        assert_eq!(record.status, MessageStatus::Pending);
        assert!(record.category.is_none());
        assert_eq!(record.received_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn parse_inbound_tolerates_unpadded_base64() {
        let mut raw = raw_message(SAMPLE_EMAIL);
        raw.raw = URL_SAFE_NO_PAD.encode(SAMPLE_EMAIL);
        let record = parse_inbound(&raw, "fallback@company.com").unwrap();
        assert_eq!(record.sender, "alice@example.com");
    }

    #[test]
    fn parse_inbound_html_only_body_is_stripped() {
        let html_mail = "From: bob@example.com\r\n\
            To: support@company.com\r\n\
            Subject: hi\r\n\
            Content-Type: text/html\r\n\
            \r\n\
            <p>Hello <b>there</b></p>\r\n";
        let record = parse_inbound(&raw_message(html_mail), "x@y.com").unwrap();
        assert!(record.body.contains("Hello"));
        assert!(record.body.contains("there"));
        assert!(!record.body.contains('<'));
        assert!(record.body_html.is_some());
    }

    #[test]
    fn parse_inbound_missing_subject_gets_placeholder() {
        let no_subject = "From: bob@example.com\r\n\
            To: support@company.com\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            body\r\n";
        let record = parse_inbound(&raw_message(no_subject), "x@y.com").unwrap();
        assert_eq!(record.subject, "(No Subject)");
    }

    #[test]
    fn parse_inbound_rejects_garbage() {
        let mut raw = raw_message(SAMPLE_EMAIL);
        raw.raw = "!!not base64!!".into();
        assert!(parse_inbound(&raw, "x@y.com").is_none());
    }

    #[test]
    fn build_raw_message_round_trips() {
        let reply = OutgoingReply {
            to: "alice@example.com".into(),
            subject: "Re: Refund question".into(),
            body: "Refunds take 5 business days.".into(),
            thread_id: Some("t1".into()),
        };
        let raw = build_raw_message("support@company.com", &reply).unwrap();
        let bytes = decode_b64url(&raw).unwrap();
        let parsed = MessageParser::default().parse(&bytes[..]).unwrap();
        assert_eq!(parsed.subject(), Some("Re: Refund question"));
        assert!(
            parsed
                .body_text(0)
                .unwrap()
                .contains("Refunds take 5 business days.")
        );
    }

    #[test]
    fn build_raw_message_rejects_bad_addresses() {
        let reply = OutgoingReply {
            to: "not an address".into(),
            subject: "x".into(),
            body: "y".into(),
            thread_id: None,
        };
        assert!(build_raw_message("support@company.com", &reply).is_none());
    }

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello <b>world</b></p>"), "Hello world");
    }

    #[test]
    fn strip_html_plain_text_passthrough() {
        assert_eq!(strip_html("no tags here"), "no tags here");
    }
}
