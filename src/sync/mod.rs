use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::classifier::{LabelClassifier, TextModel, LABEL_VOCABULARY};
use crate::notify::{NullObserver, SyncObserver, SyncProgress};
use crate::providers::{
    DeltaBatch, LabelOperation, MailProvider, NormalizedMessage, NormalizedThread, OutgoingMail,
    ProviderRegistry,
};
use crate::store::models::{Attachment, Message, Provider, Thread, User};
use crate::store::{AttachmentWrite, Database, DbError, MessageWrite, ThreadWrite};

const INITIAL_SYNC_LOOKBACK_DAYS: i64 = 30;
const RESYNC_WINDOW_HOURS: i64 = 24;
const RESYNC_MAX_RESULTS: usize = 100;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no account registered for {0}")]
    UserNotFound(String),

    #[error("a sync for {0} is already running")]
    SyncInProgress(String),

    #[error("no adapter registered for provider {0}")]
    ProviderUnavailable(Provider),

    #[error("account {0} has no access token")]
    MissingAccessToken(String),

    #[error("email {0} not found")]
    EmailNotFound(String),

    #[error("unknown label {0}")]
    InvalidLabel(String),

    #[error(transparent)]
    Store(#[from] DbError),

    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}

/// Counters reported back from one sync pass. Both counts describe the
/// pass itself: `total_emails_count` is how many threads the pass touched,
/// `new_emails_count` how many of those were not cached before.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncOutcome {
    pub new_emails_count: usize,
    pub total_emails_count: usize,
}

/// One page of the cached inbox listing.
#[derive(Debug, Clone, Serialize)]
pub struct InboxPage {
    pub threads: Vec<Thread>,
    pub total_count: i64,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageContent {
    pub message: Message,
    pub labels: Vec<String>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadContent {
    pub thread: Thread,
    pub labels: Vec<String>,
    pub messages: Vec<MessageContent>,
}

/// Coordinates provider fetches, classification, and cache writes. All read
/// paths serve from the cache; the only live-API read is the read-through in
/// `get_email_content` when a requested thread is missing locally.
pub struct SyncEngine<M: TextModel> {
    db: Database,
    providers: ProviderRegistry,
    classifier: LabelClassifier<M>,
    observer: Box<dyn SyncObserver>,
    active_syncs: Mutex<HashSet<String>>,
}

/// Releases the per-user sync slot when the pass ends, also on early error
/// returns.
struct SyncSlot<'a> {
    active: &'a Mutex<HashSet<String>>,
    email: String,
}

impl Drop for SyncSlot<'_> {
    fn drop(&mut self) {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        active.remove(&self.email);
    }
}

impl<M: TextModel> SyncEngine<M> {
    pub fn new(db: Database, providers: ProviderRegistry, classifier: LabelClassifier<M>) -> Self {
        Self {
            db,
            providers,
            classifier,
            observer: Box::new(NullObserver),
            active_syncs: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    fn acquire_sync_slot(&self, email: &str) -> Result<SyncSlot<'_>, SyncError> {
        let mut active = self
            .active_syncs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !active.insert(email.to_string()) {
            return Err(SyncError::SyncInProgress(email.to_string()));
        }
        Ok(SyncSlot {
            active: &self.active_syncs,
            email: email.to_string(),
        })
    }

    fn lookup_user(&self, email: &str) -> Result<User, SyncError> {
        self.db
            .get_user_by_email(email)?
            .ok_or_else(|| SyncError::UserNotFound(email.to_string()))
    }

    fn provider_for(&self, user: &User) -> Result<&dyn MailProvider, SyncError> {
        self.providers
            .by_kind(user.provider)
            .ok_or(SyncError::ProviderUnavailable(user.provider))
    }

    fn access_token<'a>(&self, user: &'a User) -> Result<&'a str, SyncError> {
        user.access_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| SyncError::MissingAccessToken(user.email.clone()))
    }

    /// Cold-start sync: enumerate the recent inbox and establish the
    /// incremental cursor.
    pub async fn perform_initial_sync(
        &self,
        email: &str,
        max_results: Option<usize>,
    ) -> Result<SyncOutcome, SyncError> {
        let _slot = self.acquire_sync_slot(email)?;
        let user = self.lookup_user(email)?;
        let provider = self.provider_for(&user)?;
        let token = self.access_token(&user)?;

        let since = Utc::now() - Duration::days(INITIAL_SYNC_LOOKBACK_DAYS);
        let batch = provider.list_recent(token, since, max_results).await?;
        let outcome = self.finish_sync(&user, batch).await?;

        info!(
            email,
            new = outcome.new_emails_count,
            total = outcome.total_emails_count,
            "initial sync complete"
        );
        Ok(outcome)
    }

    /// Incremental sync from the stored cursor. An account that lost its
    /// cursor (or never completed an initial sync) falls back to a bounded
    /// re-listing window instead of failing.
    pub async fn perform_incremental_sync(
        &self,
        email: &str,
        max_results: Option<usize>,
    ) -> Result<SyncOutcome, SyncError> {
        let _slot = self.acquire_sync_slot(email)?;
        let user = self.lookup_user(email)?;
        let provider = self.provider_for(&user)?;
        let token = self.access_token(&user)?;

        let batch = match user.cursor() {
            Some(cursor) => provider.changes_since(token, cursor).await?,
            None => {
                warn!(email, "no sync cursor stored, re-listing recent window");
                let since = Utc::now() - Duration::hours(RESYNC_WINDOW_HOURS);
                provider
                    .list_recent(token, since, max_results.or(Some(RESYNC_MAX_RESULTS)))
                    .await?
            }
        };

        let outcome = self.finish_sync(&user, batch).await?;
        info!(
            email,
            new = outcome.new_emails_count,
            total = outcome.total_emails_count,
            "incremental sync complete"
        );
        Ok(outcome)
    }

    /// Persist a fetched batch, then advance the cursor. The cursor moves
    /// only on this path, after every thread in the batch has been written,
    /// so a failed pass is replayed in full next time. An empty batch still
    /// refreshes the cursor so it does not go stale.
    async fn finish_sync(&self, user: &User, batch: DeltaBatch) -> Result<SyncOutcome, SyncError> {
        let pass_total = batch.threads.len();
        let new_count = self.persist_threads(user, batch.threads).await?;

        if let Some(cursor) = batch.cursor.as_deref() {
            match user.provider {
                Provider::Google => self.db.set_gmail_history_id(&user.id, cursor)?,
                Provider::Outlook => self.db.set_outlook_delta_token(&user.id, cursor)?,
            }
        }
        self.db.touch_last_sync(&user.id)?;

        Ok(SyncOutcome {
            new_emails_count: new_count,
            total_emails_count: pass_total,
        })
    }

    async fn persist_threads(
        &self,
        user: &User,
        threads: Vec<NormalizedThread>,
    ) -> Result<usize, SyncError> {
        let total = threads.len();
        let mut new_count = 0usize;

        for (index, thread) in threads.into_iter().enumerate() {
            let existed = self
                .db
                .get_thread_by_external_id(&user.id, &thread.external_id)?
                .is_some();

            let external_id = thread.external_id.clone();
            self.persist_one_thread(user, thread).await?;
            if !existed {
                new_count += 1;
            }

            // Both events fire only after the thread and all its messages
            // are in the cache, so a listener can immediately read it back.
            self.observer.on_progress(&SyncProgress {
                processed: index + 1,
                total,
                current_email: external_id.clone(),
            });
            self.observer.on_thread_saved(&external_id);
        }

        Ok(new_count)
    }

    async fn persist_one_thread(
        &self,
        user: &User,
        thread: NormalizedThread,
    ) -> Result<(), SyncError> {
        let thread_id = self.db.upsert_thread(&thread_write(user, &thread))?;

        let mut thread_labels: BTreeSet<String> = BTreeSet::new();

        for message in &thread.messages {
            let message_id = self.db.upsert_message(&message_write(user, thread_id, message))?;

            for attachment in &message.attachments {
                self.db.upsert_attachment(&AttachmentWrite {
                    user_id: user.id.clone(),
                    message_id,
                    external_id: attachment.external_id.clone(),
                    filename: attachment.filename.clone(),
                    mime_type: attachment.mime_type.clone(),
                    size_bytes: attachment.size_bytes,
                    content_ref: attachment.content_ref.clone(),
                    is_inline: attachment.is_inline,
                })?;
            }

            let labels = self.classify_message(message, message_id).await?;
            if !labels.is_empty() {
                self.db.add_message_labels(message_id, &labels)?;
                thread_labels.extend(labels);
            }
        }

        if !thread_labels.is_empty() {
            let labels: Vec<String> = thread_labels.into_iter().collect();
            self.db.add_thread_labels(thread_id, &labels)?;
            self.db.mark_thread_labeled(thread_id)?;
        }

        Ok(())
    }

    /// Classify a message unless it already carries labels from an earlier
    /// pass; re-synced threads do not re-spend model calls. A classification
    /// failure is logged and yields no labels, never a failed sync.
    async fn classify_message(
        &self,
        message: &NormalizedMessage,
        message_id: i64,
    ) -> Result<Vec<String>, SyncError> {
        if !self.db.get_message_labels(message_id)?.is_empty() {
            return Ok(Vec::new());
        }

        let subject = message.subject.as_deref().unwrap_or("");
        let body = message
            .body_text
            .as_deref()
            .or(message.body_html.as_deref())
            .unwrap_or("");

        match self.classifier.classify(subject, body).await {
            Ok(labels) => Ok(labels),
            Err(error) => {
                warn!(
                    external_id = %message.external_id,
                    "classification failed, storing message without labels: {error}"
                );
                Ok(Vec::new())
            }
        }
    }

    /// Paged inbox listing, newest first, served entirely from the cache.
    pub fn get_inbox_emails(
        &self,
        email: &str,
        limit: usize,
        offset: usize,
    ) -> Result<InboxPage, SyncError> {
        let user = self.lookup_user(email)?;
        let page = self.db.list_threads(&user.id, limit, offset)?;
        let has_more = (offset + page.threads.len()) < page.total_count as usize;
        Ok(InboxPage {
            threads: page.threads,
            total_count: page.total_count,
            has_more,
        })
    }

    /// Full thread content by external id. A cache miss here means the sync
    /// pipeline fell behind (or the id came from elsewhere), so this path
    /// reads through to the provider once and caches the result.
    pub async fn get_email_content(
        &self,
        email: &str,
        external_id: &str,
    ) -> Result<ThreadContent, SyncError> {
        let user = self.lookup_user(email)?;

        if let Some(thread) = self.db.get_thread_by_external_id(&user.id, external_id)? {
            return self.assemble_thread_content(&user, thread);
        }

        warn!(email, external_id, "thread missing from cache, fetching from provider");
        let provider = self.provider_for(&user)?;
        let token = self.access_token(&user)?;

        let Some(fetched) = provider.fetch_thread(token, external_id).await? else {
            return Err(SyncError::EmailNotFound(external_id.to_string()));
        };
        self.persist_one_thread(&user, fetched).await?;

        let thread = self
            .db
            .get_thread_by_external_id(&user.id, external_id)?
            .ok_or_else(|| SyncError::EmailNotFound(external_id.to_string()))?;
        self.assemble_thread_content(&user, thread)
    }

    /// Messages of a cached thread, oldest first.
    pub fn get_thread_emails(
        &self,
        email: &str,
        thread_external_id: &str,
    ) -> Result<Vec<MessageContent>, SyncError> {
        let user = self.lookup_user(email)?;
        if self
            .db
            .get_thread_by_external_id(&user.id, thread_external_id)?
            .is_none()
        {
            return Err(SyncError::EmailNotFound(thread_external_id.to_string()));
        }

        let messages = self.db.get_messages_by_thread(&user.id, thread_external_id)?;
        messages
            .into_iter()
            .map(|message| self.assemble_message_content(message))
            .collect()
    }

    fn assemble_thread_content(
        &self,
        user: &User,
        thread: Thread,
    ) -> Result<ThreadContent, SyncError> {
        let labels = self.db.get_thread_labels(thread.id)?;
        let messages = self
            .db
            .get_messages_by_thread(&user.id, &thread.external_id)?
            .into_iter()
            .map(|message| self.assemble_message_content(message))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ThreadContent {
            thread,
            labels,
            messages,
        })
    }

    fn assemble_message_content(&self, message: Message) -> Result<MessageContent, SyncError> {
        let labels = self.db.get_message_labels(message.id)?;
        let attachments = self.db.get_attachments(message.id)?;
        Ok(MessageContent {
            message,
            labels,
            attachments,
        })
    }

    /// Change a thread's labels on the provider, then mirror the change into
    /// the cache. Provider first: if the write-back fails the cache keeps
    /// its previous state and the caller can retry.
    pub async fn update_email_labels(
        &self,
        email: &str,
        thread_external_id: &str,
        labels: &[String],
        operation: LabelOperation,
    ) -> Result<Vec<String>, SyncError> {
        let normalized = normalize_labels(labels)?;

        let user = self.lookup_user(email)?;
        let provider = self.provider_for(&user)?;
        let token = self.access_token(&user)?;

        provider
            .apply_labels(token, thread_external_id, &normalized, operation)
            .await?;

        let Some(thread) = self.db.get_thread_by_external_id(&user.id, thread_external_id)? else {
            // Provider-side change succeeded; nothing cached to mirror.
            return Ok(normalized);
        };

        match operation {
            LabelOperation::Add => self.db.add_thread_labels(thread.id, &normalized)?,
            LabelOperation::Remove => self.db.remove_thread_labels(thread.id, &normalized)?,
            LabelOperation::Replace => self.db.replace_thread_labels(thread.id, &normalized)?,
        }
        if !matches!(operation, LabelOperation::Remove) && !normalized.is_empty() {
            self.db.mark_thread_labeled(thread.id)?;
        }

        self.db.get_thread_labels(thread.id).map_err(SyncError::from)
    }

    /// Mark a thread read on the provider and in the cache. Read state only
    /// moves toward read here; unread transitions come from provider deltas.
    pub async fn mark_email_as_read(
        &self,
        email: &str,
        external_id: &str,
    ) -> Result<(), SyncError> {
        let user = self.lookup_user(email)?;
        let provider = self.provider_for(&user)?;
        let token = self.access_token(&user)?;

        provider.mark_read(token, external_id).await?;
        self.db.set_thread_read_state(&user.id, external_id, true)?;
        Ok(())
    }

    pub async fn send_email(&self, email: &str, mail: &OutgoingMail) -> Result<(), SyncError> {
        let user = self.lookup_user(email)?;
        let provider = self.provider_for(&user)?;
        let token = self.access_token(&user)?;

        provider.send_mail(token, mail).await?;
        info!(email, to = %mail.to, "email sent");
        Ok(())
    }
}

fn thread_write(user: &User, thread: &NormalizedThread) -> ThreadWrite {
    ThreadWrite {
        user_id: user.id.clone(),
        external_id: thread.external_id.clone(),
        subject: thread.subject.clone(),
        from_name: thread.from_name.clone(),
        from_address: thread.from_address.clone(),
        snippet: thread.snippet.clone(),
        timestamp: thread.timestamp.to_rfc3339(),
        is_read: thread.is_read,
        is_important: thread.is_important,
        has_attachments: thread.has_attachments,
    }
}

fn message_write(user: &User, thread_id: i64, message: &NormalizedMessage) -> MessageWrite {
    MessageWrite {
        user_id: user.id.clone(),
        thread_id,
        external_id: message.external_id.clone(),
        thread_external_id: message.thread_external_id.clone(),
        subject: message.subject.clone(),
        from_name: message.from_name.clone(),
        from_address: message.from_address.clone(),
        to_address: message.to_address.clone(),
        timestamp: message.timestamp.to_rfc3339(),
        body_text: message.body_text.clone(),
        body_html: message.body_html.clone(),
        is_read: message.is_read,
    }
}

/// Uppercase and validate caller-supplied labels against the vocabulary.
fn normalize_labels(labels: &[String]) -> Result<Vec<String>, SyncError> {
    labels
        .iter()
        .map(|label| {
            let upper = label.trim().to_ascii_uppercase();
            if LABEL_VOCABULARY.contains(&upper.as_str()) {
                Ok(upper)
            } else {
                Err(SyncError::InvalidLabel(label.clone()))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_uppercased_and_validated() {
        let normalized =
            normalize_labels(&["fyi".to_string(), "To_Respond".to_string()]).expect("valid");
        assert_eq!(normalized, vec!["FYI".to_string(), "TO_RESPOND".to_string()]);

        let error = normalize_labels(&["SPAM".to_string()]).expect_err("unknown label");
        assert!(matches!(error, SyncError::InvalidLabel(label) if label == "SPAM"));
    }
}
