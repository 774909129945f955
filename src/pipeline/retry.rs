//! Durable retry queue for failed provider sends.
//!
//! Operator-initiated sends (manual replies, bulk replies, draft
//! approvals) that the provider refuses land here and are re-attempted by
//! a periodic sweep on a fixed backoff schedule. Exhausted entries turn
//! terminal and stay visible to operators; they are never silently
//! dropped.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::mail::MailProvider;
use crate::store::RecordStore;
use crate::store::records::{
    DraftStatus, MessageStatus, OutgoingReply, RetryAction, RetryEntry, RetryStatus,
};

/// Backoff schedule in minutes, indexed by `min(attempt, len - 1)`.
pub const BACKOFF_MINUTES: [i64; 5] = [1, 5, 15, 30, 60];

/// Default attempt ceiling.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Delay before the next attempt after `attempt` failed tries.
pub fn backoff_delay(attempt: u32) -> Duration {
    let idx = (attempt as usize).min(BACKOFF_MINUTES.len() - 1);
    Duration::minutes(BACKOFF_MINUTES[idx])
}

/// Payload of a `send_draft` entry.
#[derive(Debug, Deserialize)]
struct SendDraftPayload {
    provider_draft_id: String,
    /// Local draft row, flipped to approved when the queued send lands.
    #[serde(default)]
    draft_id: Option<Uuid>,
    #[serde(default)]
    response_text: Option<String>,
}

/// Retry queue over the record store and mail provider.
pub struct RetryQueue {
    store: Arc<dyn RecordStore>,
    mailer: Arc<dyn MailProvider>,
    /// Sweeps never overlap themselves.
    sweep_lock: tokio::sync::Mutex<()>,
}

impl RetryQueue {
    pub fn new(store: Arc<dyn RecordStore>, mailer: Arc<dyn MailProvider>) -> Self {
        Self {
            store,
            mailer,
            sweep_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Queue a failed operation. The first re-attempt is scheduled one
    /// backoff step out, never immediately.
    pub async fn enqueue(
        &self,
        message_id: &str,
        action: RetryAction,
        payload: serde_json::Value,
        error: &str,
        max_attempts: u32,
    ) -> Result<Uuid, Error> {
        let now = Utc::now();
        let entry = RetryEntry {
            id: Uuid::new_v4(),
            message_id: message_id.to_string(),
            action,
            payload,
            last_error: error.to_string(),
            attempt_count: 0,
            max_attempts,
            next_retry_at: now + backoff_delay(0),
            created_at: now,
            last_attempt_at: None,
            status: RetryStatus::Pending,
        };
        self.store.insert_retry(&entry).await?;
        info!(
            retry_id = %entry.id,
            message_id,
            action = action.as_str(),
            "Send failure queued for retry"
        );
        Ok(entry.id)
    }

    /// Attempt every due entry once. Returns the number attempted.
    pub async fn sweep_due(&self) -> Result<usize, Error> {
        let _sweep = self.sweep_lock.lock().await;

        let now = Utc::now();
        let due = self.store.due_retries(now).await?;
        let count = due.len();

        for entry in due {
            self.attempt(entry, now).await?;
        }

        if count > 0 {
            info!(count, "Retry sweep complete");
        }
        Ok(count)
    }

    /// One attempt for one entry.
    async fn attempt(&self, entry: RetryEntry, now: DateTime<Utc>) -> Result<(), Error> {
        let attempt = entry.attempt_count + 1;

        let outcome = match entry.action {
            RetryAction::SendReply => self.attempt_send_reply(&entry).await,
            RetryAction::SendDraft => self.attempt_send_draft(&entry).await,
        };

        match outcome {
            Ok(()) => {
                self.store.mark_retry(entry.id, RetryStatus::Succeeded).await?;
                info!(retry_id = %entry.id, attempt, "Retry succeeded");
            }
            Err(reason) => {
                if attempt >= entry.max_attempts {
                    // Terminal; next_retry_at is irrelevant from here on.
                    self.store.mark_retry(entry.id, RetryStatus::Failed).await?;
                    warn!(
                        retry_id = %entry.id,
                        attempts = attempt,
                        "Retry exhausted - needs manual intervention: {reason}"
                    );
                } else {
                    let next = now + backoff_delay(attempt);
                    self.store
                        .record_retry_failure(entry.id, attempt, &reason, now, next)
                        .await?;
                    warn!(
                        retry_id = %entry.id,
                        attempt,
                        next_retry_at = %next,
                        "Retry failed: {reason}"
                    );
                }
            }
        }
        Ok(())
    }

    async fn attempt_send_reply(&self, entry: &RetryEntry) -> Result<(), String> {
        let reply: OutgoingReply = serde_json::from_value(entry.payload.clone())
            .map_err(|e| format!("unreadable payload: {e}"))?;

        match self.mailer.send(&reply).await {
            Some(_) => {
                // The owning record finally got its reply out.
                if let Err(e) = self
                    .store
                    .update_status(&entry.message_id, MessageStatus::Replied, Some(&reply.body))
                    .await
                {
                    warn!(message_id = %entry.message_id, "Reply sent but status update failed: {e}");
                }
                Ok(())
            }
            None => Err("send returned no message id".into()),
        }
    }

    async fn attempt_send_draft(&self, entry: &RetryEntry) -> Result<(), String> {
        let payload: SendDraftPayload = serde_json::from_value(entry.payload.clone())
            .map_err(|e| format!("unreadable payload: {e}"))?;

        match self.mailer.send_draft(&payload.provider_draft_id).await {
            Some(_) => {
                // Settle the local draft so the approval cannot fire twice.
                if let Some(draft_id) = payload.draft_id {
                    let _ = self
                        .store
                        .update_draft_status_if_pending(draft_id, DraftStatus::Approved)
                        .await;
                }
                if let Err(e) = self
                    .store
                    .update_status(
                        &entry.message_id,
                        MessageStatus::Replied,
                        payload.response_text.as_deref(),
                    )
                    .await
                {
                    warn!(message_id = %entry.message_id, "Draft sent but status update failed: {e}");
                }
                Ok(())
            }
            None => Err("send_draft returned no message id".into()),
        }
    }

    /// All entries, newest first.
    pub async fn queue(&self) -> Result<Vec<RetryEntry>, Error> {
        Ok(self.store.list_retries().await?)
    }

    /// Re-queue an entry immediately, whatever its prior state.
    pub async fn manual_retry(&self, id: Uuid) -> Result<bool, Error> {
        Ok(self.store.reset_retry(id, Utc::now()).await?)
    }

    /// Remove an entry unconditionally.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, Error> {
        Ok(self.store.delete_retry(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use crate::store::LibSqlStore;
    use crate::store::records::{DraftRecord, MessageRecord};

    /// Mailer whose send operations can be toggled between fail and succeed.
    #[derive(Default)]
    struct ToggleMailer {
        fail: AtomicBool,
        sent: Mutex<Vec<OutgoingReply>>,
        drafts_sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MailProvider for ToggleMailer {
        async fn fetch_unread(&self, _max_results: usize) -> Vec<MessageRecord> {
            Vec::new()
        }

        async fn send(&self, reply: &OutgoingReply) -> Option<String> {
            if self.fail.load(Ordering::SeqCst) {
                return None;
            }
            self.sent.lock().unwrap().push(reply.clone());
            Some("sent-1".into())
        }

        async fn create_draft(&self, _reply: &OutgoingReply) -> Option<String> {
            Some("draft-1".into())
        }

        async fn send_draft(&self, draft_handle: &str) -> Option<String> {
            if self.fail.load(Ordering::SeqCst) {
                return None;
            }
            self.drafts_sent.lock().unwrap().push(draft_handle.into());
            Some("sent-draft".into())
        }

        async fn delete_draft(&self, _draft_handle: &str) -> bool {
            true
        }

        async fn mark_read(&self, _message_id: &str) -> bool {
            true
        }
    }

    async fn queue_with(
        fail: bool,
    ) -> (RetryQueue, Arc<LibSqlStore>, Arc<ToggleMailer>) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let mailer = Arc::new(ToggleMailer::default());
        mailer.fail.store(fail, Ordering::SeqCst);
        let queue = RetryQueue::new(
            Arc::clone(&store) as Arc<dyn RecordStore>,
            Arc::clone(&mailer) as Arc<dyn MailProvider>,
        );
        (queue, store, mailer)
    }

    fn reply_payload() -> serde_json::Value {
        serde_json::json!({
            "to": "alice@example.com",
            "subject": "Re: hi",
            "body": "queued reply body",
        })
    }

    /// Force an entry due by rewinding its next_retry_at.
    async fn make_due(store: &LibSqlStore, id: Uuid) {
        let entry = store.get_retry(id).await.unwrap().unwrap();
        store
            .record_retry_failure(
                id,
                entry.attempt_count,
                &entry.last_error,
                Utc::now(),
                Utc::now() - Duration::minutes(1),
            )
            .await
            .unwrap();
    }

    #[test]
    fn backoff_table_is_monotone_and_capped() {
        assert_eq!(backoff_delay(0), Duration::minutes(1));
        assert_eq!(backoff_delay(1), Duration::minutes(5));
        assert_eq!(backoff_delay(2), Duration::minutes(15));
        assert_eq!(backoff_delay(3), Duration::minutes(30));
        assert_eq!(backoff_delay(4), Duration::minutes(60));
        // Past the table end, the last step repeats.
        assert_eq!(backoff_delay(9), Duration::minutes(60));
        for k in 0..4 {
            assert!(backoff_delay(k + 1) > backoff_delay(k));
        }
    }

    #[tokio::test]
    async fn enqueue_schedules_one_minute_out() {
        let (queue, store, _) = queue_with(false).await;
        let before = Utc::now();
        let id = queue
            .enqueue(
                "m1",
                RetryAction::SendReply,
                reply_payload(),
                "send failed",
                DEFAULT_MAX_ATTEMPTS,
            )
            .await
            .unwrap();

        let entry = store.get_retry(id).await.unwrap().unwrap();
        assert_eq!(entry.attempt_count, 0);
        assert_eq!(entry.status, RetryStatus::Pending);
        assert!(entry.next_retry_at >= before + Duration::minutes(1));
        // Freshly queued entries are never due immediately.
        assert!(store.due_retries(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_success_updates_owning_record() {
        let (queue, store, mailer) = queue_with(false).await;
        store
            .insert_if_absent(&crate::pipeline::classifier::tests::record("m1"))
            .await
            .unwrap();

        let id = queue
            .enqueue("m1", RetryAction::SendReply, reply_payload(), "x", 5)
            .await
            .unwrap();
        make_due(&store, id).await;

        assert_eq!(queue.sweep_due().await.unwrap(), 1);

        let entry = store.get_retry(id).await.unwrap().unwrap();
        assert_eq!(entry.status, RetryStatus::Succeeded);
        assert_eq!(mailer.sent.lock().unwrap().len(), 1);
        let record = store.get_message("m1").await.unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Replied);
        assert_eq!(record.ai_response.as_deref(), Some("queued reply body"));
    }

    #[tokio::test]
    async fn sweep_failure_advances_backoff() {
        let (queue, store, _) = queue_with(true).await;
        let id = queue
            .enqueue("m1", RetryAction::SendReply, reply_payload(), "x", 5)
            .await
            .unwrap();
        make_due(&store, id).await;

        let before = Utc::now();
        queue.sweep_due().await.unwrap();

        let entry = store.get_retry(id).await.unwrap().unwrap();
        assert_eq!(entry.status, RetryStatus::Pending);
        assert_eq!(entry.attempt_count, 1);
        assert!(entry.last_error.contains("no message id"));
        // attempt 1 → 5-minute step, strictly later than the failed attempt.
        assert!(entry.next_retry_at >= before + Duration::minutes(5));
        assert!(entry.next_retry_at > entry.last_attempt_at.unwrap());
    }

    #[tokio::test]
    async fn entry_attempted_once_per_sweep() {
        let (queue, store, _) = queue_with(true).await;
        let id = queue
            .enqueue("m1", RetryAction::SendReply, reply_payload(), "x", 5)
            .await
            .unwrap();
        make_due(&store, id).await;

        assert_eq!(queue.sweep_due().await.unwrap(), 1);
        let entry = store.get_retry(id).await.unwrap().unwrap();
        assert_eq!(entry.attempt_count, 1);
        // Entry rescheduled into the future — the next sweep skips it.
        assert_eq!(queue.sweep_due().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn final_attempt_failure_turns_terminal() {
        let (queue, store, _) = queue_with(true).await;
        let id = queue
            .enqueue("m1", RetryAction::SendReply, reply_payload(), "x", 5)
            .await
            .unwrap();
        // attempt_count = 4 of 5: the next failure exhausts the entry.
        store
            .record_retry_failure(id, 4, "still failing", Utc::now(), Utc::now() - Duration::minutes(1))
            .await
            .unwrap();
        let before = store.get_retry(id).await.unwrap().unwrap().next_retry_at;

        queue.sweep_due().await.unwrap();

        let entry = store.get_retry(id).await.unwrap().unwrap();
        assert_eq!(entry.status, RetryStatus::Failed);
        // Terminal entries keep whatever next_retry_at they had…
        assert_eq!(entry.next_retry_at, before);
        // …and are excluded from all future sweeps even though it is past.
        assert_eq!(queue.sweep_due().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn manual_retry_requeues_exhausted_entry() {
        let (queue, store, mailer) = queue_with(true).await;
        let id = queue
            .enqueue("m1", RetryAction::SendReply, reply_payload(), "x", 1)
            .await
            .unwrap();
        make_due(&store, id).await;
        queue.sweep_due().await.unwrap();
        assert_eq!(
            store.get_retry(id).await.unwrap().unwrap().status,
            RetryStatus::Failed
        );

        assert!(queue.manual_retry(id).await.unwrap());
        let entry = store.get_retry(id).await.unwrap().unwrap();
        assert_eq!(entry.status, RetryStatus::Pending);
        assert_eq!(entry.attempt_count, 0);

        // Provider recovered; the re-queued entry goes out on this sweep.
        mailer.fail.store(false, Ordering::SeqCst);
        assert_eq!(queue.sweep_due().await.unwrap(), 1);
        assert_eq!(
            store.get_retry(id).await.unwrap().unwrap().status,
            RetryStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn cancel_removes_entry() {
        let (queue, store, _) = queue_with(false).await;
        let id = queue
            .enqueue("m1", RetryAction::SendReply, reply_payload(), "x", 5)
            .await
            .unwrap();
        assert!(queue.cancel(id).await.unwrap());
        assert!(store.get_retry(id).await.unwrap().is_none());
        assert!(!queue.cancel(id).await.unwrap());
    }

    #[tokio::test]
    async fn send_draft_success_settles_draft_and_record() {
        let (queue, store, mailer) = queue_with(false).await;
        store
            .insert_if_absent(&crate::pipeline::classifier::tests::record("m1"))
            .await
            .unwrap();
        let draft = DraftRecord::new("m1", "prov-9", "approved text");
        store.insert_draft(&draft).await.unwrap();

        let id = queue
            .enqueue(
                "m1",
                RetryAction::SendDraft,
                serde_json::json!({
                    "provider_draft_id": "prov-9",
                    "draft_id": draft.id,
                    "response_text": "approved text",
                }),
                "approve failed",
                5,
            )
            .await
            .unwrap();
        make_due(&store, id).await;

        queue.sweep_due().await.unwrap();

        assert_eq!(mailer.drafts_sent.lock().unwrap().as_slice(), ["prov-9"]);
        assert_eq!(
            store.get_draft(draft.id).await.unwrap().unwrap().status,
            DraftStatus::Approved
        );
        let record = store.get_message("m1").await.unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Replied);
        assert_eq!(record.ai_response.as_deref(), Some("approved text"));
    }

    #[tokio::test]
    async fn unreadable_payload_counts_as_failed_attempt() {
        let (queue, store, _) = queue_with(false).await;
        let id = queue
            .enqueue(
                "m1",
                RetryAction::SendReply,
                serde_json::json!({"not": "a reply"}),
                "x",
                5,
            )
            .await
            .unwrap();
        make_due(&store, id).await;

        queue.sweep_due().await.unwrap();
        let entry = store.get_retry(id).await.unwrap().unwrap();
        assert_eq!(entry.attempt_count, 1);
        assert!(entry.last_error.contains("unreadable payload"));
    }
}
