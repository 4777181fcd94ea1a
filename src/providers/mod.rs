use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::models::Provider;

pub mod gmail;
pub mod outlook;

pub use gmail::GmailProvider;
pub use outlook::OutlookProvider;

/// Prefix for custom labels written back to the provider so they are
/// recognizable (and removable) across clients.
pub const LABEL_PREFIX: &str = "ZEROHANDS_";

/// A provider-agnostic conversation: Gmail threads map one-to-one, Outlook
/// messages are each wrapped as a single-message thread (the adapter has no
/// native conversation grouping here; a known simplification).
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedThread {
    pub external_id: String,
    pub subject: Option<String>,
    pub from_name: Option<String>,
    pub from_address: Option<String>,
    pub snippet: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    pub is_important: bool,
    pub has_attachments: bool,
    pub messages: Vec<NormalizedMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub external_id: String,
    pub thread_external_id: String,
    pub subject: Option<String>,
    pub from_name: Option<String>,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub is_read: bool,
    pub attachments: Vec<NormalizedAttachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedAttachment {
    pub external_id: String,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: Option<i64>,
    pub content_ref: Option<String>,
    pub is_inline: bool,
}

/// Result of one fetch pass: the affected threads plus the provider's fresh
/// cursor. The cursor is present even when `threads` is empty so the caller
/// can refresh its stored position instead of leaving it stale.
#[derive(Debug, Clone, Default)]
pub struct DeltaBatch {
    pub threads: Vec<NormalizedThread>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelOperation {
    Add,
    Remove,
    Replace,
}

impl std::str::FromStr for LabelOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "add" => Ok(Self::Add),
            "remove" => Ok(Self::Remove),
            "replace" => Ok(Self::Replace),
            other => Err(format!("invalid label operation: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub is_html: bool,
}

#[async_trait(?Send)]
pub trait MailProvider {
    fn kind(&self) -> Provider;

    /// Cold-start enumeration bounded by a lookback date. Returns the
    /// provider's current cursor alongside the threads so a first sync can
    /// establish an incremental baseline.
    async fn list_recent(
        &self,
        access_token: &str,
        since: DateTime<Utc>,
        max_results: Option<usize>,
    ) -> Result<DeltaBatch>;

    /// Incremental fetch of everything changed since `cursor`. Individual
    /// thread-fetch failures are logged and dropped from the batch, never
    /// propagated; upstream change records persist so the next pass
    /// reconsiders them.
    async fn changes_since(&self, access_token: &str, cursor: &str) -> Result<DeltaBatch>;

    /// Single-item fetch for the read-through path. `Ok(None)` means the
    /// provider no longer knows the id.
    async fn fetch_thread(
        &self,
        access_token: &str,
        external_id: &str,
    ) -> Result<Option<NormalizedThread>>;

    /// Write prefixed custom labels back to the provider.
    async fn apply_labels(
        &self,
        access_token: &str,
        thread_external_id: &str,
        labels: &[String],
        operation: LabelOperation,
    ) -> Result<()>;

    async fn mark_read(&self, access_token: &str, external_id: &str) -> Result<()>;

    async fn send_mail(&self, access_token: &str, mail: &OutgoingMail) -> Result<()>;
}

pub struct ProviderRegistry {
    providers: Vec<Box<dyn MailProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Registry with both production adapters registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(GmailProvider::new()));
        registry.register(Box::new(OutlookProvider::new()));
        registry
    }

    pub fn register(&mut self, provider: Box<dyn MailProvider>) {
        self.providers.push(provider);
    }

    pub fn by_kind(&self, kind: Provider) -> Option<&dyn MailProvider> {
        self.providers
            .iter()
            .find(|provider| provider.kind() == kind)
            .map(|provider| provider.as_ref())
    }

    pub fn all(&self) -> &[Box<dyn MailProvider>] {
        &self.providers
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Prefix a bare application label for provider-side storage.
pub fn prefixed_label(label: &str) -> String {
    format!("{LABEL_PREFIX}{label}")
}

/// Strip the write-back prefix; `None` if the label is not one of ours.
pub fn strip_label_prefix(label: &str) -> Option<&str> {
    label.strip_prefix(LABEL_PREFIX)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use super::{
        prefixed_label, strip_label_prefix, DeltaBatch, LabelOperation, MailProvider,
        NormalizedThread, OutgoingMail, ProviderRegistry,
    };
    use crate::store::models::Provider;

    struct DummyProvider;

    #[async_trait(?Send)]
    impl MailProvider for DummyProvider {
        fn kind(&self) -> Provider {
            Provider::Google
        }

        async fn list_recent(
            &self,
            _access_token: &str,
            _since: DateTime<Utc>,
            _max_results: Option<usize>,
        ) -> Result<DeltaBatch> {
            Ok(DeltaBatch::default())
        }

        async fn changes_since(&self, _access_token: &str, _cursor: &str) -> Result<DeltaBatch> {
            Ok(DeltaBatch::default())
        }

        async fn fetch_thread(
            &self,
            _access_token: &str,
            _external_id: &str,
        ) -> Result<Option<NormalizedThread>> {
            Ok(None)
        }

        async fn apply_labels(
            &self,
            _access_token: &str,
            _thread_external_id: &str,
            _labels: &[String],
            _operation: LabelOperation,
        ) -> Result<()> {
            Ok(())
        }

        async fn mark_read(&self, _access_token: &str, _external_id: &str) -> Result<()> {
            Ok(())
        }

        async fn send_mail(&self, _access_token: &str, _mail: &OutgoingMail) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn registry_finds_provider_by_kind() {
        let mut registry = ProviderRegistry::new();
        registry.register(Box::new(DummyProvider));
        assert!(registry.by_kind(Provider::Google).is_some());
        assert!(registry.by_kind(Provider::Outlook).is_none());
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn label_operation_parses_case_insensitively() {
        assert_eq!(
            "Add".parse::<LabelOperation>().expect("parse add"),
            LabelOperation::Add
        );
        assert_eq!(
            "REPLACE".parse::<LabelOperation>().expect("parse replace"),
            LabelOperation::Replace
        );
        assert!("merge".parse::<LabelOperation>().is_err());
    }

    #[test]
    fn label_prefix_round_trip() {
        let prefixed = prefixed_label("TO_RESPOND");
        assert_eq!(prefixed, "ZEROHANDS_TO_RESPOND");
        assert_eq!(strip_label_prefix(&prefixed), Some("TO_RESPOND"));
        assert_eq!(strip_label_prefix("INBOX"), None);
    }
}
