//! libSQL backend — async `RecordStore` implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; `libsql::Connection` is `Send + Sync` and
//! safe for concurrent async use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::records::{
    Attachment, Category, DraftRecord, DraftStatus, MessageRecord, MessageStatus, RetryAction,
    RetryEntry, RetryStatus, Stats,
};
use crate::store::traits::{RecordStore, SearchScope};

/// libSQL record store.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<Database>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_db(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_db(db).await
    }

    async fn from_db(db: Database) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        // Overlapping request handlers and periodic sweeps contend on
        // writes; wait rather than fail fast.
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy_timeout: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to a libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

const MESSAGE_COLUMNS: &str = "id, thread_id, sender, sender_name, recipient, subject, body, \
     body_html, attachments, received_at, category, status, ai_response, processed_at";

/// Map a libsql row (in MESSAGE_COLUMNS order) to a MessageRecord.
fn row_to_message(row: &libsql::Row) -> Result<MessageRecord, libsql::Error> {
    let attachments_json: String = row.get(8).unwrap_or_else(|_| "[]".into());
    let attachments: Vec<Attachment> = serde_json::from_str(&attachments_json).unwrap_or_default();

    let received_str: String = row.get(9)?;
    let category_str: Option<String> = row.get(10).ok();
    let status_str: String = row.get(11)?;
    let processed_str: Option<String> = row.get(13).ok();

    Ok(MessageRecord {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        sender: row.get(2)?,
        sender_name: row.get(3).ok(),
        recipient: row.get(4)?,
        subject: row.get(5)?,
        body: row.get(6)?,
        body_html: row.get(7).ok(),
        attachments,
        received_at: parse_datetime(&received_str),
        category: category_str.as_deref().and_then(Category::parse),
        status: MessageStatus::parse(&status_str),
        ai_response: row.get(12).ok(),
        processed_at: parse_optional_datetime(&processed_str),
    })
}

const DRAFT_COLUMNS: &str = "id, message_id, provider_draft_id, response_text, created_at, status";

fn row_to_draft(row: &libsql::Row) -> Result<DraftRecord, libsql::Error> {
    let id_str: String = row.get(0)?;
    let created_str: String = row.get(4)?;
    let status_str: String = row.get(5)?;

    Ok(DraftRecord {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        message_id: row.get(1)?,
        provider_draft_id: row.get(2)?,
        response_text: row.get(3)?,
        created_at: parse_datetime(&created_str),
        status: DraftStatus::parse(&status_str),
    })
}

const RETRY_COLUMNS: &str = "id, message_id, action, payload, last_error, attempt_count, \
     max_attempts, next_retry_at, created_at, last_attempt_at, status";

fn row_to_retry(row: &libsql::Row) -> Result<RetryEntry, libsql::Error> {
    let id_str: String = row.get(0)?;
    let action_str: String = row.get(2)?;
    let payload_str: String = row.get(3)?;
    let next_str: String = row.get(7)?;
    let created_str: String = row.get(8)?;
    let last_attempt_str: Option<String> = row.get(9).ok();
    let status_str: String = row.get(10)?;

    Ok(RetryEntry {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        message_id: row.get(1)?,
        action: RetryAction::parse(&action_str).unwrap_or(RetryAction::SendReply),
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
        last_error: row.get(4)?,
        attempt_count: row.get::<i64>(5)? as u32,
        max_attempts: row.get::<i64>(6)? as u32,
        next_retry_at: parse_datetime(&next_str),
        created_at: parse_datetime(&created_str),
        last_attempt_at: parse_optional_datetime(&last_attempt_str),
        status: RetryStatus::parse(&status_str),
    })
}

/// Quote each whitespace-separated term so user input cannot break the
/// FTS5 query grammar.
fn fts_quote(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl RecordStore for LibSqlStore {
    // ── Message records ─────────────────────────────────────────────

    async fn insert_if_absent(&self, record: &MessageRecord) -> Result<bool, DatabaseError> {
        let attachments = serde_json::to_string(&record.attachments)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let changed = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO messages ({MESSAGE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    record.id.clone(),
                    record.thread_id.clone(),
                    record.sender.clone(),
                    opt_text(record.sender_name.as_deref()),
                    record.recipient.clone(),
                    record.subject.clone(),
                    record.body.clone(),
                    opt_text(record.body_html.as_deref()),
                    attachments,
                    record.received_at.to_rfc3339(),
                    opt_text(record.category.map(|c| c.as_str())),
                    record.status.as_str(),
                    opt_text(record.ai_response.as_deref()),
                    opt_text_owned(record.processed_at.map(|t| t.to_rfc3339())),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_if_absent: {e}")))?;

        Ok(changed > 0)
    }

    async fn save_message(&self, record: &MessageRecord) -> Result<(), DatabaseError> {
        let attachments = serde_json::to_string(&record.attachments)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO messages ({MESSAGE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    record.id.clone(),
                    record.thread_id.clone(),
                    record.sender.clone(),
                    opt_text(record.sender_name.as_deref()),
                    record.recipient.clone(),
                    record.subject.clone(),
                    record.body.clone(),
                    opt_text(record.body_html.as_deref()),
                    attachments,
                    record.received_at.to_rfc3339(),
                    opt_text(record.category.map(|c| c.as_str())),
                    record.status.as_str(),
                    opt_text(record.ai_response.as_deref()),
                    opt_text_owned(record.processed_at.map(|t| t.to_rfc3339())),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_message: {e}")))?;

        debug!(id = %record.id, status = record.status.as_str(), "Message saved");
        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record = row_to_message(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_message row parse: {e}")))?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_message: {e}"))),
        }
    }

    async fn is_processed(&self, id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT 1 FROM messages WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("is_processed: {e}")))?;

        match rows.next().await {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("is_processed: {e}"))),
        }
    }

    async fn finalize_message(
        &self,
        id: &str,
        category: Category,
        status: MessageStatus,
        ai_response: Option<&str>,
        processed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE messages
                 SET category = ?1, status = ?2, ai_response = ?3, processed_at = ?4
                 WHERE id = ?5 AND status = 'pending'",
                params![
                    category.as_str(),
                    status.as_str(),
                    opt_text(ai_response),
                    processed_at.to_rfc3339(),
                    id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finalize_message: {e}")))?;

        if changed == 0 {
            warn!(id = id, "finalize_message lost the race — record no longer pending");
        }
        Ok(changed > 0)
    }

    async fn update_status_if(
        &self,
        id: &str,
        expected: MessageStatus,
        new: MessageStatus,
        ai_response: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = if let Some(response) = ai_response {
            self.conn()
                .execute(
                    "UPDATE messages SET status = ?1, ai_response = ?2, processed_at = ?3
                     WHERE id = ?4 AND status = ?5",
                    params![new.as_str(), response, now, id, expected.as_str()],
                )
                .await
        } else {
            self.conn()
                .execute(
                    "UPDATE messages SET status = ?1, ai_response = NULL, processed_at = ?2
                     WHERE id = ?3 AND status = ?4",
                    params![new.as_str(), now, id, expected.as_str()],
                )
                .await
        }
        .map_err(|e| DatabaseError::Query(format!("update_status_if: {e}")))?;

        Ok(changed > 0)
    }

    async fn update_status(
        &self,
        id: &str,
        status: MessageStatus,
        ai_response: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = if let Some(response) = ai_response {
            self.conn()
                .execute(
                    "UPDATE messages SET status = ?1, ai_response = ?2, processed_at = ?3 WHERE id = ?4",
                    params![status.as_str(), response, now, id],
                )
                .await
        } else {
            self.conn()
                .execute(
                    "UPDATE messages SET status = ?1, processed_at = ?2 WHERE id = ?3",
                    params![status.as_str(), now, id],
                )
                .await
        }
        .map_err(|e| DatabaseError::Query(format!("update_status: {e}")))?;

        Ok(changed > 0)
    }

    async fn pending_messages(&self) -> Result<Vec<MessageRecord>, DatabaseError> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE status = 'manual_required' ORDER BY received_at DESC"
            ),
            (),
        )
        .await
    }

    async fn message_history(&self, limit: usize) -> Result<Vec<MessageRecord>, DatabaseError> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE status = 'replied' ORDER BY processed_at DESC LIMIT ?1"
            ),
            params![limit as i64],
        )
        .await
    }

    async fn search_messages(
        &self,
        query: &str,
        scope: SearchScope,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let quoted = fts_quote(query);
        if quoted.is_empty() {
            return Ok(Vec::new());
        }

        let status_filter = match scope {
            SearchScope::All => "",
            SearchScope::Pending => "AND m.status = 'manual_required'",
            SearchScope::History => "AND m.status = 'replied'",
        };

        let sql = format!(
            "SELECT {cols} FROM messages m
             JOIN messages_fts ON messages_fts.rowid = m.rowid
             WHERE messages_fts MATCH ?1 {status_filter}
             ORDER BY messages_fts.rank LIMIT 100",
            cols = MESSAGE_COLUMNS
                .split(", ")
                .map(|c| format!("m.{c}"))
                .collect::<Vec<_>>()
                .join(", "),
        );

        self.query_messages(&sql, params![quoted]).await
    }

    // ── Drafts ──────────────────────────────────────────────────────

    async fn insert_draft(&self, draft: &DraftRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO drafts ({DRAFT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    draft.id.to_string(),
                    draft.message_id.clone(),
                    draft.provider_draft_id.clone(),
                    draft.response_text.clone(),
                    draft.created_at.to_rfc3339(),
                    draft.status.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_draft: {e}")))?;

        debug!(draft_id = %draft.id, message_id = %draft.message_id, "Draft saved");
        Ok(())
    }

    async fn get_draft(&self, id: Uuid) -> Result<Option<DraftRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {DRAFT_COLUMNS} FROM drafts WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_draft: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_draft(&row).map_err(|e| {
                DatabaseError::Query(format!("get_draft row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_draft: {e}"))),
        }
    }

    async fn pending_draft_for_message(
        &self,
        message_id: &str,
    ) -> Result<Option<DraftRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {DRAFT_COLUMNS} FROM drafts
                     WHERE message_id = ?1 AND status = 'pending' LIMIT 1"
                ),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("pending_draft_for_message: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_draft(&row).map_err(|e| {
                DatabaseError::Query(format!("pending_draft_for_message row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "pending_draft_for_message: {e}"
            ))),
        }
    }

    async fn pending_drafts(&self) -> Result<Vec<DraftRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {DRAFT_COLUMNS} FROM drafts
                     WHERE status = 'pending' ORDER BY created_at DESC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("pending_drafts: {e}")))?;

        let mut drafts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_draft(&row) {
                Ok(d) => drafts.push(d),
                Err(e) => warn!("Skipping draft row: {e}"),
            }
        }
        Ok(drafts)
    }

    async fn update_draft_status_if_pending(
        &self,
        id: Uuid,
        status: DraftStatus,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE drafts SET status = ?1 WHERE id = ?2 AND status = 'pending'",
                params![status.as_str(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_draft_status_if_pending: {e}")))?;

        Ok(changed > 0)
    }

    async fn swap_draft(
        &self,
        id: Uuid,
        provider_draft_id: &str,
        response_text: &str,
    ) -> Result<bool, DatabaseError> {
        // An edit re-enters `pending` (a discarded draft comes back to
        // life); an approved draft is immutable.
        let changed = self
            .conn()
            .execute(
                "UPDATE drafts SET provider_draft_id = ?1, response_text = ?2, status = 'pending'
                 WHERE id = ?3 AND status != 'approved'",
                params![provider_draft_id, response_text, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("swap_draft: {e}")))?;

        Ok(changed > 0)
    }

    async fn delete_draft(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute("DELETE FROM drafts WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_draft: {e}")))?;
        Ok(changed > 0)
    }

    // ── Retry queue ─────────────────────────────────────────────────

    async fn insert_retry(&self, entry: &RetryEntry) -> Result<(), DatabaseError> {
        let payload = serde_json::to_string(&entry.payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO retry_queue ({RETRY_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    entry.id.to_string(),
                    entry.message_id.clone(),
                    entry.action.as_str(),
                    payload,
                    entry.last_error.clone(),
                    entry.attempt_count as i64,
                    entry.max_attempts as i64,
                    entry.next_retry_at.to_rfc3339(),
                    entry.created_at.to_rfc3339(),
                    opt_text_owned(entry.last_attempt_at.map(|t| t.to_rfc3339())),
                    entry.status.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_retry: {e}")))?;

        debug!(retry_id = %entry.id, action = entry.action.as_str(), "Retry entry queued");
        Ok(())
    }

    async fn get_retry(&self, id: Uuid) -> Result<Option<RetryEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RETRY_COLUMNS} FROM retry_queue WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_retry: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_retry(&row).map_err(|e| {
                DatabaseError::Query(format!("get_retry row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_retry: {e}"))),
        }
    }

    async fn due_retries(&self, now: DateTime<Utc>) -> Result<Vec<RetryEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RETRY_COLUMNS} FROM retry_queue
                     WHERE status = 'pending' AND next_retry_at <= ?1
                     ORDER BY next_retry_at ASC"
                ),
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("due_retries: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_retry(&row) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping retry row: {e}"),
            }
        }
        Ok(entries)
    }

    async fn list_retries(&self) -> Result<Vec<RetryEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RETRY_COLUMNS} FROM retry_queue ORDER BY created_at DESC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_retries: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_retry(&row) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping retry row: {e}"),
            }
        }
        Ok(entries)
    }

    async fn mark_retry(&self, id: Uuid, status: RetryStatus) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .execute(
                "UPDATE retry_queue SET status = ?1, last_attempt_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_retry: {e}")))?;
        Ok(changed > 0)
    }

    async fn record_retry_failure(
        &self,
        id: Uuid,
        attempt_count: u32,
        error: &str,
        last_attempt_at: DateTime<Utc>,
        next_retry_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE retry_queue
                 SET attempt_count = ?1, last_error = ?2, last_attempt_at = ?3, next_retry_at = ?4
                 WHERE id = ?5",
                params![
                    attempt_count as i64,
                    error,
                    last_attempt_at.to_rfc3339(),
                    next_retry_at.to_rfc3339(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_retry_failure: {e}")))?;
        Ok(changed > 0)
    }

    async fn reset_retry(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE retry_queue
                 SET attempt_count = 0, status = 'pending',
                     last_error = 'Manual retry triggered', next_retry_at = ?1
                 WHERE id = ?2",
                params![now.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_retry: {e}")))?;
        Ok(changed > 0)
    }

    async fn delete_retry(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "DELETE FROM retry_queue WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_retry: {e}")))?;
        Ok(changed > 0)
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT value FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_setting: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get(0).unwrap_or_default())),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_setting: {e}")))?;
        Ok(())
    }

    // ── Statistics ──────────────────────────────────────────────────

    async fn stats(&self) -> Result<Stats, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT
                    (SELECT COUNT(*) FROM messages),
                    (SELECT COUNT(*) FROM messages WHERE category = 'auto_reply'),
                    (SELECT COUNT(*) FROM messages WHERE category = 'rag_reply'),
                    (SELECT COUNT(*) FROM messages WHERE status = 'manual_required'),
                    (SELECT COUNT(*) FROM drafts WHERE status = 'pending'),
                    (SELECT COUNT(*) FROM retry_queue WHERE status = 'pending'),
                    (SELECT COUNT(*) FROM retry_queue WHERE status = 'failed')",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Stats {
                total_messages: row.get(0).unwrap_or(0),
                auto_replied: row.get(1).unwrap_or(0),
                rag_replied: row.get(2).unwrap_or(0),
                pending_manual: row.get(3).unwrap_or(0),
                drafts_pending: row.get(4).unwrap_or(0),
                retries_pending: row.get(5).unwrap_or(0),
                retries_failed: row.get(6).unwrap_or(0),
            }),
            _ => Ok(Stats::default()),
        }
    }
}

impl LibSqlStore {
    async fn query_messages(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("query_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_message(&row) {
                Ok(record) => messages.push(record),
                Err(e) => warn!("Skipping message row: {e}"),
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> MessageRecord {
        MessageRecord {
            id: id.into(),
            thread_id: format!("thread-{id}"),
            sender: "alice@example.com".into(),
            sender_name: Some("Alice".into()),
            recipient: "support@company.com".into(),
            subject: "Refund policy".into(),
            body: "What is your refund policy?".into(),
            body_html: None,
            attachments: vec![],
            received_at: Utc::now(),
            category: None,
            status: MessageStatus::Pending,
            ai_response: None,
            processed_at: None,
        }
    }

    #[tokio::test]
    async fn insert_if_absent_claims_once() {
        let store = LibSqlStore::new_memory().await.unwrap();
        assert!(store.insert_if_absent(&record("m1")).await.unwrap());
        assert!(!store.insert_if_absent(&record("m1")).await.unwrap());
        assert!(store.is_processed("m1").await.unwrap());
        assert!(!store.is_processed("m2").await.unwrap());
    }

    #[tokio::test]
    async fn finalize_only_while_pending() {
        let store = LibSqlStore::new_memory().await.unwrap();
        store.insert_if_absent(&record("m1")).await.unwrap();

        let first = store
            .finalize_message(
                "m1",
                Category::AutoReply,
                MessageStatus::Replied,
                Some("Thanks!"),
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(first);

        // A second finalize (concurrent writer) must lose.
        let second = store
            .finalize_message(
                "m1",
                Category::PendingManual,
                MessageStatus::ManualRequired,
                None,
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(!second);

        let stored = store.get_message("m1").await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Replied);
        assert_eq!(stored.category, Some(Category::AutoReply));
        assert_eq!(stored.ai_response.as_deref(), Some("Thanks!"));
        assert!(stored.processed_at.is_some());
    }

    #[tokio::test]
    async fn update_status_if_checks_expected() {
        let store = LibSqlStore::new_memory().await.unwrap();
        store.insert_if_absent(&record("m1")).await.unwrap();
        store
            .finalize_message(
                "m1",
                Category::PendingManual,
                MessageStatus::ManualRequired,
                None,
                Utc::now(),
            )
            .await
            .unwrap();

        // Wrong expected status → no-op.
        assert!(
            !store
                .update_status_if("m1", MessageStatus::Pending, MessageStatus::Replied, None)
                .await
                .unwrap()
        );
        // Correct expected status → transition.
        assert!(
            store
                .update_status_if(
                    "m1",
                    MessageStatus::ManualRequired,
                    MessageStatus::Replied,
                    Some("manual reply"),
                )
                .await
                .unwrap()
        );
        let stored = store.get_message("m1").await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Replied);
    }

    #[tokio::test]
    async fn search_stays_consistent_with_writes() {
        let store = LibSqlStore::new_memory().await.unwrap();
        store.insert_if_absent(&record("m1")).await.unwrap();

        let hits = store
            .search_messages("refund", SearchScope::All)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "m1");

        // Rewrite with a different subject/body — index must follow.
        let mut updated = record("m1");
        updated.subject = "Shipping delay".into();
        updated.body = "My parcel is late".into();
        store.save_message(&updated).await.unwrap();

        assert!(
            store
                .search_messages("refund", SearchScope::All)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            store
                .search_messages("parcel", SearchScope::All)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn search_scope_filters_status() {
        let store = LibSqlStore::new_memory().await.unwrap();
        store.insert_if_absent(&record("m1")).await.unwrap();
        store
            .finalize_message(
                "m1",
                Category::PendingManual,
                MessageStatus::ManualRequired,
                None,
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(
            store
                .search_messages("refund", SearchScope::Pending)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(
            store
                .search_messages("refund", SearchScope::History)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn search_survives_hostile_input() {
        let store = LibSqlStore::new_memory().await.unwrap();
        store.insert_if_absent(&record("m1")).await.unwrap();
        // FTS operators and quotes must not produce a query error.
        let hits = store
            .search_messages("refund\" OR NEAR(", SearchScope::All)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn draft_swap_keeps_single_row() {
        let store = LibSqlStore::new_memory().await.unwrap();
        store.insert_if_absent(&record("m1")).await.unwrap();

        let draft = DraftRecord::new("m1", "prov-1", "first text");
        store.insert_draft(&draft).await.unwrap();

        assert!(store.swap_draft(draft.id, "prov-2", "second text").await.unwrap());
        assert!(store.swap_draft(draft.id, "prov-3", "third text").await.unwrap());

        let drafts = store.pending_drafts().await.unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].provider_draft_id, "prov-3");
        assert_eq!(drafts[0].response_text, "third text");
        assert_eq!(drafts[0].id, draft.id);
    }

    #[tokio::test]
    async fn draft_status_cas_rejects_double_approve() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let draft = DraftRecord::new("m1", "prov-1", "text");
        store.insert_draft(&draft).await.unwrap();

        assert!(
            store
                .update_draft_status_if_pending(draft.id, DraftStatus::Approved)
                .await
                .unwrap()
        );
        assert!(
            !store
                .update_draft_status_if_pending(draft.id, DraftStatus::Approved)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn due_retries_excludes_terminal_and_future() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let now = Utc::now();

        let mut due = RetryEntry {
            id: Uuid::new_v4(),
            message_id: "m1".into(),
            action: RetryAction::SendReply,
            payload: serde_json::json!({"to": "a@x.com"}),
            last_error: "send failed".into(),
            attempt_count: 0,
            max_attempts: 5,
            next_retry_at: now - chrono::Duration::minutes(1),
            created_at: now,
            last_attempt_at: None,
            status: RetryStatus::Pending,
        };
        store.insert_retry(&due).await.unwrap();

        due.id = Uuid::new_v4();
        due.next_retry_at = now + chrono::Duration::minutes(10);
        store.insert_retry(&due).await.unwrap();

        // Terminal entry with past next_retry_at — must never be swept.
        due.id = Uuid::new_v4();
        due.next_retry_at = now - chrono::Duration::minutes(5);
        due.status = RetryStatus::Failed;
        store.insert_retry(&due).await.unwrap();

        let entries = store.due_retries(now).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, RetryStatus::Pending);
    }

    #[tokio::test]
    async fn reset_retry_requeues_failed_entry() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let now = Utc::now();
        let entry = RetryEntry {
            id: Uuid::new_v4(),
            message_id: "m1".into(),
            action: RetryAction::SendDraft,
            payload: serde_json::json!({"provider_draft_id": "d1"}),
            last_error: "gone".into(),
            attempt_count: 5,
            max_attempts: 5,
            next_retry_at: now,
            created_at: now,
            last_attempt_at: Some(now),
            status: RetryStatus::Failed,
        };
        store.insert_retry(&entry).await.unwrap();

        assert!(store.reset_retry(entry.id, now).await.unwrap());
        let fetched = store.get_retry(entry.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, RetryStatus::Pending);
        assert_eq!(fetched.attempt_count, 0);
        assert_eq!(store.due_retries(now).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let store = LibSqlStore::new_memory().await.unwrap();
        assert_eq!(store.get_setting("system_initialized").await.unwrap(), None);
        store.set_setting("system_initialized", "true").await.unwrap();
        assert_eq!(
            store.get_setting("system_initialized").await.unwrap().as_deref(),
            Some("true")
        );
        // Seeded defaults from the initial migration.
        assert_eq!(
            store.get_setting("polling_interval").await.unwrap().as_deref(),
            Some("3")
        );
    }

    #[tokio::test]
    async fn stats_counts_by_category_and_status() {
        let store = LibSqlStore::new_memory().await.unwrap();
        store.insert_if_absent(&record("m1")).await.unwrap();
        store
            .finalize_message(
                "m1",
                Category::AutoReply,
                MessageStatus::Replied,
                Some("ok"),
                Utc::now(),
            )
            .await
            .unwrap();
        store.insert_if_absent(&record("m2")).await.unwrap();
        store
            .finalize_message(
                "m2",
                Category::PendingManual,
                MessageStatus::ManualRequired,
                None,
                Utc::now(),
            )
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.auto_replied, 1);
        assert_eq!(stats.pending_manual, 1);
    }

    #[tokio::test]
    async fn on_disk_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailpilot.db");
        {
            let store = LibSqlStore::new_local(&path).await.unwrap();
            store.insert_if_absent(&record("m1")).await.unwrap();
        }
        let store = LibSqlStore::new_local(&path).await.unwrap();
        assert!(store.is_processed("m1").await.unwrap());
    }
}
