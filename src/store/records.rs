//! Durable rows: message records, drafts, retry entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Response text stamped on records the initialization sweep marks as handled.
pub const PREEXISTING_SENTINEL: &str = "[Skipped - existed before system start]";

/// Response text stamped on records an operator dismisses without replying.
pub const DISMISSED_SENTINEL: &str = "[Dismissed by user]";

/// Response text stamped on records archived by the sender blocklist.
pub const BLOCKED_SENTINEL: &str = "[Blocked sender - auto-archived]";

// ── Message records ─────────────────────────────────────────────────

/// Handling category assigned at classification time. Fixed once set;
/// only explicit regeneration revisits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Generic message, replied to immediately.
    AutoReply,
    /// Knowledge question, replied to with retrieved context.
    RagReply,
    /// Needs a human; nothing is sent.
    PendingManual,
    /// AI drafts, staff approves before sending.
    DraftReview,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoReply => "auto_reply",
            Self::RagReply => "rag_reply",
            Self::PendingManual => "pending_manual",
            Self::DraftReview => "draft_review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto_reply" => Some(Self::AutoReply),
            "rag_reply" => Some(Self::RagReply),
            "pending_manual" => Some(Self::PendingManual),
            "draft_review" => Some(Self::DraftReview),
            _ => None,
        }
    }
}

/// Processing status of a message record.
///
/// `Pending → {Replied, Draft, ManualRequired}`; `Draft` moves to `Replied`
/// on approval or back to `ManualRequired` on discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Replied,
    Draft,
    ManualRequired,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Replied => "replied",
            Self::Draft => "draft",
            Self::ManualRequired => "manual_required",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "replied" => Self::Replied,
            "draft" => Self::Draft,
            "manual_required" => Self::ManualRequired,
            _ => Self::Pending,
        }
    }
}

/// An attachment descriptor carried on a message record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub size: usize,
    /// Base64 content for small inline attachments; larger ones stay
    /// provider-side and are fetched on demand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// One inbound email and its processing outcome. Never physically deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Provider-native message id.
    pub id: String,
    pub thread_id: String,
    pub sender: String,
    pub sender_name: Option<String>,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub body_html: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub received_at: DateTime<Utc>,
    pub category: Option<Category>,
    pub status: MessageStatus,
    pub ai_response: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

// ── Drafts ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Pending,
    Approved,
    Discarded,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Discarded => "discarded",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "approved" => Self::Approved,
            "discarded" => Self::Discarded,
            _ => Self::Pending,
        }
    }
}

/// A provider-side draft awaiting operator review.
///
/// At most one `Pending` draft exists per message; editing swaps the
/// provider handle and text in place rather than creating a second row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftRecord {
    pub id: Uuid,
    pub message_id: String,
    pub provider_draft_id: String,
    pub response_text: String,
    pub created_at: DateTime<Utc>,
    pub status: DraftStatus,
}

impl DraftRecord {
    pub fn new(message_id: &str, provider_draft_id: &str, response_text: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id: message_id.to_string(),
            provider_draft_id: provider_draft_id.to_string(),
            response_text: response_text.to_string(),
            created_at: Utc::now(),
            status: DraftStatus::Pending,
        }
    }
}

// ── Retry queue ─────────────────────────────────────────────────────

/// The operation a retry entry re-attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryAction {
    SendReply,
    SendDraft,
}

impl RetryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendReply => "send_reply",
            Self::SendDraft => "send_draft",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "send_reply" => Some(Self::SendReply),
            "send_draft" => Some(Self::SendDraft),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Pending,
    Succeeded,
    Failed,
}

impl RetryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// One failed send/draft-send awaiting backoff-scheduled re-attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEntry {
    pub id: Uuid,
    pub message_id: String,
    pub action: RetryAction,
    /// Everything needed to re-attempt, serialized.
    pub payload: serde_json::Value,
    pub last_error: String,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub status: RetryStatus,
}

// ── Outgoing mail ───────────────────────────────────────────────────

/// An outbound reply handed to the mail provider. Also the serialized
/// payload of `send_reply` retry entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingReply {
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl OutgoingReply {
    /// Build a reply to `record`, prefixing `Re:` when missing.
    pub fn to_message(record: &MessageRecord, body: &str) -> Self {
        Self {
            to: record.sender.clone(),
            subject: reply_subject(&record.subject),
            body: body.to_string(),
            thread_id: Some(record.thread_id.clone()),
        }
    }
}

/// Prefix a subject with `Re:` unless it already carries one.
pub fn reply_subject(subject: &str) -> String {
    if subject.to_lowercase().starts_with("re:") {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

/// Processing statistics surfaced to operators.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub total_messages: i64,
    pub auto_replied: i64,
    pub rag_replied: i64,
    pub pending_manual: i64,
    pub drafts_pending: i64,
    pub retries_pending: i64,
    pub retries_failed: i64,
}
