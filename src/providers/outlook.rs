use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::warn;

use crate::batch::{run_chunked, BatchPolicy};
use crate::store::models::Provider;

use super::{
    prefixed_label, DeltaBatch, LabelOperation, MailProvider, NormalizedAttachment,
    NormalizedMessage, NormalizedThread, OutgoingMail, LABEL_PREFIX,
};

const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";
const FULL_SYNC_PAGE_SIZE: usize = 100;
const MAX_RATE_LIMIT_RETRIES: usize = 5;
const REDACTED_BODY_MAX_LEN: usize = 200;

const MESSAGE_SELECT_FIELDS: &str = concat!(
    "id,subject,from,toRecipients,receivedDateTime,body,bodyPreview,",
    "importance,isRead,hasAttachments,categories"
);

/// Microsoft Graph adapter. Graph has no thread grouping in the endpoints
/// used here, so every message becomes a single-message normalized thread;
/// custom labels ride on message categories.
#[derive(Debug, Clone)]
pub struct OutlookProvider {
    client: Client,
    base_url: String,
}

impl Default for OutlookProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OutlookProvider {
    pub fn new() -> Self {
        let base_url = std::env::var("ZEROHANDS_GRAPH_API_BASE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| GRAPH_API_BASE.to_string());
        Self {
            client: Client::new(),
            base_url,
        }
    }

    async fn request_raw(
        &self,
        token: &str,
        method: Method,
        url: &str,
        payload: Option<&serde_json::Value>,
        allow_not_found: bool,
    ) -> Result<Option<String>> {
        let mut backoff_seconds = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let mut request = self
                .client
                .request(method.clone(), url)
                .bearer_auth(token)
                .header("accept", "application/json");
            if let Some(payload) = payload {
                request = request.json(payload);
            }

            let response = request
                .send()
                .await
                .with_context(|| format!("graph api request: {url}"))?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    let body = response
                        .text()
                        .await
                        .context("read graph 429 response body")?;
                    return Err(anyhow!(
                        "graph api request exhausted retries: {}",
                        redact_response_body(&body)
                    ));
                }

                let retry_after_seconds = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(backoff_seconds);

                sleep(StdDuration::from_secs(retry_after_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(32);
                continue;
            }

            if allow_not_found && response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }

            let status = response.status();
            let body = response
                .text()
                .await
                .context("read graph api response body")?;
            if !status.is_success() {
                return Err(anyhow!(
                    "graph api request failed: status={} body={}",
                    status,
                    redact_response_body(&body)
                ));
            }

            return Ok(Some(body));
        }

        Err(anyhow!("graph api request failed without response"))
    }

    async fn get(&self, token: &str, url: &str) -> Result<String> {
        self.request_raw(token, Method::GET, url, None, false)
            .await?
            .ok_or_else(|| anyhow!("graph api returned no body: {url}"))
    }

    async fn post(&self, token: &str, url: &str, payload: &serde_json::Value) -> Result<()> {
        self.request_raw(token, Method::POST, url, Some(payload), false)
            .await?;
        Ok(())
    }

    async fn patch(&self, token: &str, url: &str, payload: &serde_json::Value) -> Result<()> {
        self.request_raw(token, Method::PATCH, url, Some(payload), false)
            .await?;
        Ok(())
    }

    async fn fetch_delta_page(&self, token: &str, url: &str) -> Result<GraphDeltaPage> {
        let body = self.get(token, url).await?;
        serde_json::from_str(&body).context("decode graph delta page JSON")
    }

    fn initial_delta_url(&self) -> Result<String> {
        let endpoint = format!("{}/me/mailFolders/inbox/messages/delta", self.base_url);
        let mut url = Url::parse(&endpoint).with_context(|| format!("parse graph URL {endpoint}"))?;
        url.query_pairs_mut()
            .append_pair("$select", MESSAGE_SELECT_FIELDS);
        Ok(url.to_string())
    }

    /// Walk the delta endpoint to its end and return the fresh deltaLink.
    /// Page contents are ignored; the caller has already enumerated messages
    /// through the plain endpoint.
    async fn capture_delta_baseline(&self, token: &str) -> Result<Option<String>> {
        let mut next_url = self.initial_delta_url()?;
        let mut newest_delta_link: Option<String> = None;

        loop {
            let page = self.fetch_delta_page(token, &next_url).await?;
            if let Some(delta_link) = page.delta_link {
                newest_delta_link = Some(delta_link);
            }
            match page.next_link {
                Some(url) => next_url = url,
                None => break,
            }
        }

        Ok(newest_delta_link)
    }

    async fn get_message(&self, token: &str, message_id: &str) -> Result<Option<GraphMessage>> {
        let endpoint = format!("{}/me/messages/{message_id}", self.base_url);
        let mut url = Url::parse(&endpoint).with_context(|| format!("parse graph URL {endpoint}"))?;
        url.query_pairs_mut()
            .append_pair("$select", MESSAGE_SELECT_FIELDS);

        let Some(body) = self
            .request_raw(token, Method::GET, url.as_str(), None, true)
            .await?
        else {
            return Ok(None);
        };
        let message: GraphMessage = serde_json::from_str(&body).context("decode graph message")?;
        Ok(Some(message))
    }

    async fn list_attachments(
        &self,
        token: &str,
        message_id: &str,
    ) -> Result<Vec<NormalizedAttachment>> {
        let url = format!(
            "{}/me/messages/{message_id}/attachments?$select=id,name,contentType,size,isInline",
            self.base_url
        );
        let body = self.get(token, &url).await?;
        let page: GraphAttachmentPage =
            serde_json::from_str(&body).context("decode graph attachment list")?;
        Ok(page
            .value
            .into_iter()
            .map(|attachment| NormalizedAttachment {
                content_ref: Some(attachment.id.clone()),
                external_id: attachment.id,
                filename: attachment.name,
                mime_type: attachment.content_type,
                size_bytes: attachment.size,
                is_inline: attachment.is_inline.unwrap_or(false),
            })
            .collect())
    }

    /// Normalize messages and pull attachment metadata for those that carry
    /// any. An attachment listing failure downgrades the thread to
    /// attachment-less rather than dropping it.
    async fn hydrate_messages(
        &self,
        token: &str,
        messages: Vec<GraphMessage>,
    ) -> Vec<NormalizedThread> {
        let settled = run_chunked(messages, BatchPolicy::default(), |message| async move {
            let mut thread = normalize_message(&message)
                .ok_or_else(|| anyhow!("graph message without id, skipping"))?;
            if message.has_attachments.unwrap_or(false) {
                match self.list_attachments(token, &thread.external_id).await {
                    Ok(attachments) => {
                        if let Some(normalized) = thread.messages.first_mut() {
                            normalized.attachments = attachments;
                        }
                    }
                    Err(error) => {
                        warn!(
                            "graph attachment listing failed for {}: {error:#}",
                            thread.external_id
                        );
                    }
                }
            }
            Ok(thread)
        })
        .await;

        let mut threads = Vec::new();
        for result in settled {
            match result {
                Ok(thread) => threads.push(thread),
                Err(error) => warn!("graph message normalization failed, skipping: {error:#}"),
            }
        }
        threads
    }
}

#[async_trait(?Send)]
impl MailProvider for OutlookProvider {
    fn kind(&self) -> Provider {
        Provider::Outlook
    }

    async fn list_recent(
        &self,
        access_token: &str,
        since: DateTime<Utc>,
        max_results: Option<usize>,
    ) -> Result<DeltaBatch> {
        // Initial enumeration uses the plain /messages endpoint; the delta
        // endpoint caps its first pass and is only walked afterwards to
        // capture a baseline cursor.
        let endpoint = format!("{}/me/mailFolders/inbox/messages", self.base_url);
        let mut url = Url::parse(&endpoint).with_context(|| format!("parse graph URL {endpoint}"))?;
        url.query_pairs_mut()
            .append_pair(
                "$filter",
                &format!(
                    "receivedDateTime ge {}",
                    since.to_rfc3339_opts(SecondsFormat::Secs, true)
                ),
            )
            .append_pair("$top", &FULL_SYNC_PAGE_SIZE.to_string())
            .append_pair("$select", MESSAGE_SELECT_FIELDS)
            .append_pair("$orderby", "receivedDateTime desc");

        let cap = max_results.unwrap_or(usize::MAX);
        let mut messages: Vec<GraphMessage> = Vec::new();
        let mut next_url = url.to_string();

        loop {
            let body = self.get(access_token, &next_url).await?;
            let page: GraphMessagesPage =
                serde_json::from_str(&body).context("decode graph messages page JSON")?;
            messages.extend(page.value);

            if messages.len() >= cap {
                messages.truncate(cap);
                break;
            }
            match page.next_link {
                Some(url) => next_url = url,
                None => break,
            }
        }

        let cursor = self.capture_delta_baseline(access_token).await?;
        let threads = self.hydrate_messages(access_token, messages).await;
        Ok(DeltaBatch { threads, cursor })
    }

    async fn changes_since(&self, access_token: &str, cursor: &str) -> Result<DeltaBatch> {
        let mut next_url = cursor.to_string();
        let mut newest_delta_link: Option<String> = None;
        let mut messages: Vec<GraphMessage> = Vec::new();

        loop {
            let page = match self.fetch_delta_page(access_token, &next_url).await {
                Ok(page) => page,
                Err(error) => {
                    // Graph answers 410 Gone when a delta token has aged
                    // out. Re-enumerate a short window instead of failing
                    // the whole sync.
                    if format!("{error}").contains("status=410") {
                        warn!("graph delta link expired, re-listing recent inbox");
                        return self
                            .list_recent(
                                access_token,
                                Utc::now() - Duration::days(1),
                                Some(FULL_SYNC_PAGE_SIZE),
                            )
                            .await;
                    }
                    return Err(error);
                }
            };

            // @removed entries are skipped: the cache is additive and never
            // prunes.
            messages.extend(page.value.into_iter().filter(|m| m.removed.is_none()));

            if let Some(delta_link) = page.delta_link {
                newest_delta_link = Some(delta_link);
            }
            match page.next_link {
                Some(url) => next_url = url,
                None => break,
            }
        }

        let threads = self.hydrate_messages(access_token, messages).await;
        Ok(DeltaBatch {
            threads,
            cursor: newest_delta_link,
        })
    }

    async fn fetch_thread(
        &self,
        access_token: &str,
        external_id: &str,
    ) -> Result<Option<NormalizedThread>> {
        let Some(message) = self.get_message(access_token, external_id).await? else {
            return Ok(None);
        };
        let threads = self.hydrate_messages(access_token, vec![message]).await;
        Ok(threads.into_iter().next())
    }

    async fn apply_labels(
        &self,
        access_token: &str,
        thread_external_id: &str,
        labels: &[String],
        operation: LabelOperation,
    ) -> Result<()> {
        // Categories are read fresh right before the write so concurrent
        // edits from other clients are not clobbered wholesale.
        let url = format!(
            "{}/me/messages/{thread_external_id}?$select=categories",
            self.base_url
        );
        let body = self.get(access_token, &url).await?;
        let current: GraphCategories =
            serde_json::from_str(&body).context("decode graph message categories")?;

        let desired: Vec<String> = labels.iter().map(|label| prefixed_label(label)).collect();
        let updated = compute_categories(
            current.categories.as_deref().unwrap_or_default(),
            &desired,
            operation,
        );

        let patch_url = format!("{}/me/messages/{thread_external_id}", self.base_url);
        self.patch(
            access_token,
            &patch_url,
            &serde_json::json!({ "categories": updated }),
        )
        .await
    }

    async fn mark_read(&self, access_token: &str, external_id: &str) -> Result<()> {
        let url = format!("{}/me/messages/{external_id}", self.base_url);
        self.patch(access_token, &url, &serde_json::json!({ "isRead": true }))
            .await
    }

    async fn send_mail(&self, access_token: &str, mail: &OutgoingMail) -> Result<()> {
        let url = format!("{}/me/sendMail", self.base_url);
        let content_type = if mail.is_html { "HTML" } else { "Text" };
        let payload = serde_json::json!({
            "message": {
                "subject": mail.subject,
                "body": {
                    "contentType": content_type,
                    "content": mail.body,
                },
                "toRecipients": [
                    { "emailAddress": { "address": mail.to } }
                ],
            },
            "saveToSentItems": true,
        });
        self.post(access_token, &url, &payload).await
    }
}

/// New category list after applying `operation`. Replace clears only
/// prefixed categories; Outlook-native ones the user set by hand survive.
fn compute_categories(current: &[String], desired: &[String], operation: LabelOperation) -> Vec<String> {
    let mut updated: Vec<String> = match operation {
        LabelOperation::Add => current.to_vec(),
        LabelOperation::Remove => current
            .iter()
            .filter(|category| !desired.contains(category))
            .cloned()
            .collect(),
        LabelOperation::Replace => current
            .iter()
            .filter(|category| !category.starts_with(LABEL_PREFIX))
            .cloned()
            .collect(),
    };

    if matches!(operation, LabelOperation::Add | LabelOperation::Replace) {
        for category in desired {
            if !updated.contains(category) {
                updated.push(category.clone());
            }
        }
    }

    updated
}

fn normalize_message(message: &GraphMessage) -> Option<NormalizedThread> {
    let id = message.id.clone()?;

    let (from_name, from_address) = message
        .from
        .as_ref()
        .and_then(GraphRecipient::name_address_pair)
        .unwrap_or((None, None));
    let to_address = message
        .to_recipients
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(GraphRecipient::address)
        .collect::<Vec<_>>()
        .join(", ");
    let to_address = if to_address.is_empty() {
        None
    } else {
        Some(to_address)
    };

    let (body_text, body_html) = extract_body(message);
    let timestamp = parse_graph_timestamp(message.received_date_time.as_deref());
    let is_read = message.is_read.unwrap_or(false);

    let normalized = NormalizedMessage {
        external_id: id.clone(),
        thread_external_id: id.clone(),
        subject: message.subject.clone(),
        from_name: from_name.clone(),
        from_address: from_address.clone(),
        to_address,
        timestamp,
        body_text,
        body_html,
        is_read,
        attachments: Vec::new(),
    };

    Some(NormalizedThread {
        external_id: id,
        subject: message.subject.clone(),
        from_name,
        from_address,
        snippet: message.body_preview.clone(),
        timestamp,
        is_read,
        is_important: message
            .importance
            .as_deref()
            .is_some_and(|level| level.eq_ignore_ascii_case("high")),
        has_attachments: message.has_attachments.unwrap_or(false),
        messages: vec![normalized],
    })
}

fn extract_body(message: &GraphMessage) -> (Option<String>, Option<String>) {
    let Some(body) = &message.body else {
        return (None, None);
    };
    let Some(content) = body.content.as_deref().filter(|c| !c.trim().is_empty()) else {
        return (None, None);
    };

    let is_html = body
        .content_type
        .as_deref()
        .is_some_and(|value| value.eq_ignore_ascii_case("html"));

    if !is_html {
        return (Some(content.to_string()), None);
    }

    let text = std::panic::catch_unwind(|| {
        html2text::from_read(content.as_bytes(), 120)
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    })
    .ok()
    .filter(|t| !t.is_empty());

    (text, Some(content.to_string()))
}

fn parse_graph_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn redact_response_body(body: &str) -> String {
    let trimmed: String = body.chars().take(REDACTED_BODY_MAX_LEN).collect();
    if body.len() > trimmed.len() {
        format!("{trimmed}…")
    } else {
        trimmed
    }
}

// --- Graph API response types ---
// #[allow(dead_code)] on these structs: fields are deserialized from the API
// but not all are read directly — they exist to match the API contract.

#[derive(Debug, Clone, Deserialize)]
struct GraphDeltaPage {
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

/// Response page from the plain `/messages` list endpoint (no deltaLink).
#[derive(Debug, Clone, Deserialize)]
struct GraphMessagesPage {
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphMessage {
    id: Option<String>,
    subject: Option<String>,
    from: Option<GraphRecipient>,
    #[serde(rename = "toRecipients")]
    to_recipients: Option<Vec<GraphRecipient>>,
    body: Option<GraphBody>,
    #[serde(rename = "bodyPreview")]
    body_preview: Option<String>,
    importance: Option<String>,
    #[serde(rename = "isRead")]
    is_read: Option<bool>,
    #[serde(rename = "hasAttachments")]
    has_attachments: Option<bool>,
    #[serde(rename = "receivedDateTime")]
    received_date_time: Option<String>,
    #[serde(rename = "@removed")]
    removed: Option<GraphRemoved>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphRecipient {
    #[serde(rename = "emailAddress")]
    email_address: Option<GraphEmailAddress>,
}

impl GraphRecipient {
    fn address(&self) -> Option<&str> {
        self.email_address
            .as_ref()
            .and_then(|email| email.address.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    fn name_address_pair(&self) -> Option<(Option<String>, Option<String>)> {
        let email = self.email_address.as_ref()?;
        let name = email
            .name
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let address = email
            .address
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        Some((name, address))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GraphEmailAddress {
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphBody {
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
struct GraphRemoved {
    reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphCategories {
    categories: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphAttachmentPage {
    value: Vec<GraphAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphAttachment {
    id: String,
    name: Option<String>,
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    size: Option<i64>,
    #[serde(rename = "isInline")]
    is_inline: Option<bool>,
}
