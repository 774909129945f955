//! Draft lifecycle — approve, edit, discard, regenerate.
//!
//! State machine: `pending → approved` (terminal) or `pending → discarded`;
//! a discarded draft re-enters `pending` through an edit, otherwise its
//! message stays with the humans. Editing swaps the provider-side draft and
//! text under the same row id — there is never a second live draft for a
//! message.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::mail::MailProvider;
use crate::pipeline::classifier::{Classifier, GeneratedReply};
use crate::pipeline::retry::{DEFAULT_MAX_ATTEMPTS, RetryQueue};
use crate::store::RecordStore;
use crate::store::records::{
    Category, DraftRecord, DraftStatus, MessageRecord, MessageStatus, OutgoingReply, RetryAction,
};

/// Operator-facing draft operation failures.
#[derive(Debug, thiserror::Error)]
pub enum DraftError {
    #[error("Draft not found")]
    NotFound,

    #[error("Original message not found")]
    MessageNotFound,

    #[error("Draft is not pending")]
    NotPending,

    #[error("Provider rejected the operation: {0}")]
    SendFailed(String),

    #[error("Could not generate a new draft: {0}")]
    GenerationFailed(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Draft operations over the store, provider, and classifier.
pub struct DraftService {
    store: Arc<dyn RecordStore>,
    mailer: Arc<dyn MailProvider>,
    classifier: Arc<Classifier>,
    retries: Arc<RetryQueue>,
}

impl DraftService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        mailer: Arc<dyn MailProvider>,
        classifier: Arc<Classifier>,
        retries: Arc<RetryQueue>,
    ) -> Self {
        Self {
            store,
            mailer,
            classifier,
            retries,
        }
    }

    /// Approve a pending draft: send it and settle both rows.
    ///
    /// A provider failure queues the send for retry and reports an error;
    /// nothing changes locally, so the approve call is safe to repeat.
    pub async fn approve(&self, draft_id: Uuid) -> Result<String, DraftError> {
        let draft = self.get(draft_id).await?;
        if draft.status != DraftStatus::Pending {
            return Err(DraftError::NotPending);
        }

        match self.mailer.send_draft(&draft.provider_draft_id).await {
            Some(message_id) => {
                if !self
                    .store
                    .update_draft_status_if_pending(draft_id, DraftStatus::Approved)
                    .await?
                {
                    warn!(draft_id = %draft_id, "Draft changed state while approving");
                }
                if !self
                    .store
                    .update_status_if(
                        &draft.message_id,
                        MessageStatus::Draft,
                        MessageStatus::Replied,
                        Some(&draft.response_text),
                    )
                    .await?
                {
                    warn!(
                        message_id = %draft.message_id,
                        "Draft sent but owning message was not in draft status"
                    );
                }
                info!(draft_id = %draft_id, message_id = %message_id, "Draft approved and sent");
                Ok(message_id)
            }
            None => {
                let queued = self
                    .retries
                    .enqueue(
                        &draft.message_id,
                        RetryAction::SendDraft,
                        serde_json::json!({
                            "provider_draft_id": draft.provider_draft_id,
                            "draft_id": draft.id,
                            "response_text": draft.response_text,
                        }),
                        "send_draft returned no message id",
                        DEFAULT_MAX_ATTEMPTS,
                    )
                    .await;
                if let Err(e) = queued {
                    warn!(draft_id = %draft_id, "Could not queue failed draft send: {e}");
                }
                Err(DraftError::SendFailed(
                    "draft send failed; queued for retry".into(),
                ))
            }
        }
    }

    /// Replace a draft's content: delete the old provider-side draft,
    /// create a new one, and swap handle+text under the same row.
    pub async fn edit(&self, draft_id: Uuid, content: &str) -> Result<DraftRecord, DraftError> {
        let draft = self.get(draft_id).await?;
        if draft.status == DraftStatus::Approved {
            return Err(DraftError::NotPending);
        }
        let message = self.message_of(&draft).await?;

        self.replace_provider_draft(&draft, &message, content).await
    }

    /// Discard a pending draft: delete it provider-side and hand the
    /// message back to the humans.
    pub async fn discard(&self, draft_id: Uuid) -> Result<(), DraftError> {
        let draft = self.get(draft_id).await?;
        if draft.status != DraftStatus::Pending {
            return Err(DraftError::NotPending);
        }

        if !self.mailer.delete_draft(&draft.provider_draft_id).await {
            warn!(
                draft_id = %draft_id,
                handle = %draft.provider_draft_id,
                "Provider draft deletion failed; discarding locally anyway"
            );
        }

        self.store
            .update_draft_status_if_pending(draft_id, DraftStatus::Discarded)
            .await?;

        // The message resurfaces for manual handling, response cleared.
        if !self
            .store
            .update_status_if(
                &draft.message_id,
                MessageStatus::Draft,
                MessageStatus::ManualRequired,
                None,
            )
            .await?
        {
            warn!(message_id = %draft.message_id, "Discard: message was not in draft status");
        }

        info!(draft_id = %draft_id, "Draft discarded");
        Ok(())
    }

    /// Regenerate a draft's text, optionally with operator-supplied
    /// context, and swap it in like an edit.
    pub async fn regenerate(
        &self,
        draft_id: Uuid,
        extra_context: Option<&str>,
    ) -> Result<DraftRecord, DraftError> {
        let draft = self.get(draft_id).await?;
        if draft.status == DraftStatus::Approved {
            return Err(DraftError::NotPending);
        }
        let message = self.message_of(&draft).await?;

        let category = message.category.unwrap_or(Category::DraftReview);
        let reply = self
            .classifier
            .regenerate(&message, category, extra_context)
            .await;

        let text = match reply {
            Some(GeneratedReply::Generated(text)) => text,
            Some(GeneratedReply::Fallback { reason, .. }) => {
                return Err(DraftError::GenerationFailed(format!("{reason:?}")));
            }
            None => {
                return Err(DraftError::GenerationFailed(
                    "category produces no response".into(),
                ));
            }
        };

        self.replace_provider_draft(&draft, &message, &text).await
    }

    /// Drafts awaiting review, paired with their original messages.
    pub async fn pending_with_messages(
        &self,
    ) -> Result<Vec<(DraftRecord, Option<MessageRecord>)>, DatabaseError> {
        let drafts = self.store.pending_drafts().await?;
        let mut out = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let message = self.store.get_message(&draft.message_id).await?;
            out.push((draft, message));
        }
        Ok(out)
    }

    pub async fn get(&self, draft_id: Uuid) -> Result<DraftRecord, DraftError> {
        self.store
            .get_draft(draft_id)
            .await?
            .ok_or(DraftError::NotFound)
    }

    async fn message_of(&self, draft: &DraftRecord) -> Result<MessageRecord, DraftError> {
        self.store
            .get_message(&draft.message_id)
            .await?
            .ok_or(DraftError::MessageNotFound)
    }

    /// Shared tail of edit/regenerate: new provider draft in, old one out,
    /// same row.
    async fn replace_provider_draft(
        &self,
        draft: &DraftRecord,
        message: &MessageRecord,
        content: &str,
    ) -> Result<DraftRecord, DraftError> {
        // Delete first so the old provider draft is never silently orphaned;
        // a failed deletion is logged and does not block the replacement.
        if !self.mailer.delete_draft(&draft.provider_draft_id).await {
            warn!(
                handle = %draft.provider_draft_id,
                "Could not delete old provider draft; replacing anyway"
            );
        }

        let was_discarded = draft.status == DraftStatus::Discarded;
        let outgoing = OutgoingReply::to_message(message, content);
        let new_handle = self
            .mailer
            .create_draft(&outgoing)
            .await
            .ok_or_else(|| DraftError::SendFailed("could not create replacement draft".into()))?;

        self.store
            .swap_draft(draft.id, &new_handle, content)
            .await?;

        // An edit that revives a discarded draft pulls the message back
        // out of the manual pile.
        if was_discarded {
            self.store
                .update_status_if(
                    &draft.message_id,
                    MessageStatus::ManualRequired,
                    MessageStatus::Draft,
                    Some(content),
                )
                .await?;
        } else {
            self.store
                .update_status(&draft.message_id, MessageStatus::Draft, Some(content))
                .await?;
        }

        info!(draft_id = %draft.id, handle = %new_handle, "Draft content replaced");
        self.get(draft.id).await
    }
}
