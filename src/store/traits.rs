//! Backend-agnostic `RecordStore` trait — the single mutator of all
//! durable state. Components communicate only through it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::records::{
    DraftRecord, DraftStatus, MessageRecord, MessageStatus, RetryEntry, RetryStatus, Stats,
};

/// Which slice of message records a search covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    All,
    /// `manual_required` records awaiting a human.
    Pending,
    /// `replied` records.
    History,
}

impl SearchScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(Self::All),
            "pending" => Some(Self::Pending),
            "history" => Some(Self::History),
            _ => None,
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    // ── Message records ─────────────────────────────────────────────

    /// Insert a record if no row with its id exists. Returns `true` when
    /// this call claimed the id — the caller may then process the message
    /// knowing no other writer holds it.
    async fn insert_if_absent(&self, record: &MessageRecord) -> Result<bool, DatabaseError>;

    /// Insert or replace a record wholesale (initialization sweep, forced
    /// fallback records).
    async fn save_message(&self, record: &MessageRecord) -> Result<(), DatabaseError>;

    async fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, DatabaseError>;

    /// Idempotency guard: has this message id already been recorded?
    async fn is_processed(&self, id: &str) -> Result<bool, DatabaseError>;

    /// Compare-and-set finalize for the polling cycle: writes category,
    /// status, response, and processed timestamp only while the record is
    /// still `pending`. Returns `false` when another writer got there first.
    async fn finalize_message(
        &self,
        id: &str,
        category: crate::store::records::Category,
        status: MessageStatus,
        ai_response: Option<&str>,
        processed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Compare-and-set status transition for operator-initiated updates.
    /// Returns `false` when the record was not in `expected` status.
    async fn update_status_if(
        &self,
        id: &str,
        expected: MessageStatus,
        new: MessageStatus,
        ai_response: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Unconditional status update (retry-sweep success path).
    async fn update_status(
        &self,
        id: &str,
        status: MessageStatus,
        ai_response: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Records awaiting a human, most recent first.
    async fn pending_messages(&self) -> Result<Vec<MessageRecord>, DatabaseError>;

    /// Replied records, most recently processed first.
    async fn message_history(&self, limit: usize) -> Result<Vec<MessageRecord>, DatabaseError>;

    /// Full-text search over sender/subject/body. The index is maintained
    /// in the same transaction as every message write.
    async fn search_messages(
        &self,
        query: &str,
        scope: SearchScope,
    ) -> Result<Vec<MessageRecord>, DatabaseError>;

    // ── Drafts ──────────────────────────────────────────────────────

    async fn insert_draft(&self, draft: &DraftRecord) -> Result<(), DatabaseError>;

    async fn get_draft(&self, id: Uuid) -> Result<Option<DraftRecord>, DatabaseError>;

    /// The live (`pending`) draft for a message, if any.
    async fn pending_draft_for_message(
        &self,
        message_id: &str,
    ) -> Result<Option<DraftRecord>, DatabaseError>;

    async fn pending_drafts(&self) -> Result<Vec<DraftRecord>, DatabaseError>;

    /// Compare-and-set draft status: only a `pending` draft transitions.
    async fn update_draft_status_if_pending(
        &self,
        id: Uuid,
        status: DraftStatus,
    ) -> Result<bool, DatabaseError>;

    /// Swap the provider handle and text under the same draft row (edit).
    async fn swap_draft(
        &self,
        id: Uuid,
        provider_draft_id: &str,
        response_text: &str,
    ) -> Result<bool, DatabaseError>;

    async fn delete_draft(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Retry queue ─────────────────────────────────────────────────

    async fn insert_retry(&self, entry: &RetryEntry) -> Result<(), DatabaseError>;

    async fn get_retry(&self, id: Uuid) -> Result<Option<RetryEntry>, DatabaseError>;

    /// Pending entries with `next_retry_at <= now`, soonest first.
    async fn due_retries(&self, now: DateTime<Utc>) -> Result<Vec<RetryEntry>, DatabaseError>;

    /// All entries, newest first (operator display).
    async fn list_retries(&self) -> Result<Vec<RetryEntry>, DatabaseError>;

    /// Mark an entry terminal.
    async fn mark_retry(&self, id: Uuid, status: RetryStatus) -> Result<bool, DatabaseError>;

    /// Record a failed attempt: bump the count, store the error, schedule
    /// the next attempt.
    async fn record_retry_failure(
        &self,
        id: Uuid,
        attempt_count: u32,
        error: &str,
        last_attempt_at: DateTime<Utc>,
        next_retry_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Manual retry: zero the attempt count and make the entry due now,
    /// whatever its prior status.
    async fn reset_retry(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    async fn delete_retry(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError>;

    // ── Statistics ──────────────────────────────────────────────────

    async fn stats(&self) -> Result<Stats, DatabaseError>;
}
