//! Polling cycle — fetches unread mail, routes each new message through
//! its category's action, and records the outcome exactly once.
//!
//! Processing discipline per message: claim the id (`INSERT OR IGNORE`)
//! before any side effect, run classification/generation/provider calls,
//! then finalize with a single compare-and-set while the record is still
//! `pending`. One bad message never aborts the cycle — it is force-recorded
//! as `pending_manual` and the cycle moves on.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::blocklist::Blocklist;
use crate::config::{INIT_SWEEP_BATCH_SIZE, POLL_BATCH_SIZE};
use crate::error::Error;
use crate::mail::MailProvider;
use crate::pipeline::classifier::{Classifier, FallbackReason, GeneratedReply};
use crate::store::RecordStore;
use crate::store::records::{
    BLOCKED_SENTINEL, Category, DraftRecord, MessageRecord, MessageStatus, OutgoingReply,
    PREEXISTING_SENTINEL,
};

const INITIALIZED_KEY: &str = "system_initialized";
const INITIALIZED_AT_KEY: &str = "initialized_at";

/// Drives the classification pipeline over the mail provider.
pub struct EmailProcessor {
    mailer: Arc<dyn MailProvider>,
    classifier: Arc<Classifier>,
    store: Arc<dyn RecordStore>,
    blocklist: Blocklist,
    /// Non-reentrancy guard shared by the periodic trigger and the manual
    /// trigger endpoint: a cycle never overlaps itself.
    cycle_lock: tokio::sync::Mutex<()>,
}

impl EmailProcessor {
    pub fn new(
        mailer: Arc<dyn MailProvider>,
        classifier: Arc<Classifier>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let blocklist = Blocklist::new(Arc::clone(&store));
        Self {
            mailer,
            classifier,
            store,
            blocklist,
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// First-run initialization: record all currently-unread messages as
    /// already handled, without classifying or replying. Gated on a
    /// persisted flag so it runs exactly once; resetting the flag re-arms
    /// exactly one more sweep.
    pub async fn initialize_system(&self) -> Result<usize, Error> {
        if self.store.get_setting(INITIALIZED_KEY).await?.as_deref() == Some("true") {
            return Ok(0);
        }

        info!("First run detected - marking existing emails as seen");
        let now = Utc::now();
        let mut count = 0;

        for mut record in self.mailer.fetch_unread(INIT_SWEEP_BATCH_SIZE).await {
            record.category = None;
            record.status = MessageStatus::Replied;
            record.ai_response = Some(PREEXISTING_SENTINEL.to_string());
            record.processed_at = Some(now);
            self.store.save_message(&record).await?;
            count += 1;
        }

        self.store.set_setting(INITIALIZED_KEY, "true").await?;
        self.store
            .set_setting(INITIALIZED_AT_KEY, &now.to_rfc3339())
            .await?;

        info!(count, "Initialization complete - existing emails marked as seen");
        Ok(count)
    }

    /// Run one polling cycle. Returns the number of newly processed
    /// messages. Never runs concurrently with itself.
    pub async fn process_new(&self) -> Result<usize, Error> {
        let _cycle = self.cycle_lock.lock().await;

        let fetched = self.mailer.fetch_unread(POLL_BATCH_SIZE).await;
        let mut processed = 0;

        for record in fetched {
            // Skip anything already recorded, before any side effect.
            if self.store.is_processed(&record.id).await? {
                continue;
            }

            if self.blocklist.should_block(&record.sender).await? {
                self.archive_blocked(record).await?;
                processed += 1;
                continue;
            }

            // Claim the id; a concurrent writer holding it means skip.
            if !self.store.insert_if_absent(&record).await? {
                continue;
            }
            processed += 1;

            if let Err(e) = self.process_single(&record).await {
                error!(id = %record.id, "Error processing message: {e}");
                // Force-record so the message surfaces to a human and is
                // never re-attempted.
                let finalized = self
                    .store
                    .finalize_message(
                        &record.id,
                        Category::PendingManual,
                        MessageStatus::ManualRequired,
                        None,
                        Utc::now(),
                    )
                    .await
                    .unwrap_or(false);
                if !finalized {
                    warn!(id = %record.id, "Could not force-record failed message");
                }
            }
        }

        if processed > 0 {
            info!(processed, "Polling cycle complete");
        }
        Ok(processed)
    }

    /// Classify one claimed message and execute its category's action.
    async fn process_single(&self, record: &MessageRecord) -> Result<(), Error> {
        let (classification, reply) = self.classifier.route(record).await;
        let category = classification.category;
        let now = Utc::now();

        match category {
            Category::AutoReply | Category::RagReply => {
                match sendable_text(reply) {
                    Some(text) => {
                        let outgoing = OutgoingReply::to_message(record, &text);
                        if self.mailer.send(&outgoing).await.is_some() {
                            self.store
                                .finalize_message(
                                    &record.id,
                                    category,
                                    MessageStatus::Replied,
                                    Some(&text),
                                    now,
                                )
                                .await?;
                            self.mailer.mark_read(&record.id).await;
                        } else {
                            // Provider refused; a human takes over.
                            self.store
                                .finalize_message(
                                    &record.id,
                                    category,
                                    MessageStatus::ManualRequired,
                                    None,
                                    now,
                                )
                                .await?;
                        }
                    }
                    None => {
                        self.store
                            .finalize_message(
                                &record.id,
                                category,
                                MessageStatus::ManualRequired,
                                None,
                                now,
                            )
                            .await?;
                    }
                }
            }

            Category::DraftReview => {
                let draft_text = match reply {
                    Some(GeneratedReply::Generated(text)) => Some(text),
                    // A fallback draft would just be noise for the reviewer.
                    Some(GeneratedReply::Fallback { .. }) | None => None,
                };

                match draft_text {
                    Some(text) => {
                        let outgoing = OutgoingReply::to_message(record, &text);
                        match self.mailer.create_draft(&outgoing).await {
                            Some(handle) => {
                                self.store
                                    .insert_draft(&DraftRecord::new(&record.id, &handle, &text))
                                    .await?;
                                self.store
                                    .finalize_message(
                                        &record.id,
                                        category,
                                        MessageStatus::Draft,
                                        Some(&text),
                                        now,
                                    )
                                    .await?;
                                self.mailer.mark_read(&record.id).await;
                            }
                            None => {
                                self.store
                                    .finalize_message(
                                        &record.id,
                                        category,
                                        MessageStatus::ManualRequired,
                                        None,
                                        now,
                                    )
                                    .await?;
                            }
                        }
                    }
                    None => {
                        self.store
                            .finalize_message(
                                &record.id,
                                category,
                                MessageStatus::ManualRequired,
                                None,
                                now,
                            )
                            .await?;
                    }
                }
            }

            Category::PendingManual => {
                // Needs human attention; stays unread in the inbox.
                self.store
                    .finalize_message(
                        &record.id,
                        category,
                        MessageStatus::ManualRequired,
                        None,
                        now,
                    )
                    .await?;
            }
        }

        Ok(())
    }

    /// Archive mail from a blocked sender without classifying it.
    async fn archive_blocked(&self, mut record: MessageRecord) -> Result<(), Error> {
        info!(id = %record.id, sender = %record.sender, "Blocked sender - archiving");
        record.category = None;
        record.status = MessageStatus::Replied;
        record.ai_response = Some(BLOCKED_SENTINEL.to_string());
        record.processed_at = Some(Utc::now());
        self.store.save_message(&record).await?;
        self.mailer.mark_read(&record.id).await;
        Ok(())
    }

    /// The blocklist backing this processor (shared with the HTTP surface).
    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }
}

/// Text that may actually be sent for an immediate-reply category.
///
/// Model-error fallbacks carry a safe canned reply and are sent; a
/// no-context fallback means nothing grounded exists, so nothing goes out.
fn sendable_text(reply: Option<GeneratedReply>) -> Option<String> {
    match reply {
        Some(GeneratedReply::Generated(text)) => Some(text),
        Some(GeneratedReply::Fallback {
            reason: FallbackReason::ModelError(_),
            text,
        }) if !text.is_empty() => Some(text),
        _ => None,
    }
}
