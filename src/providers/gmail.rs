use std::collections::{HashMap, HashSet};
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::warn;

use crate::batch::{run_chunked, BatchPolicy};
use crate::store::models::Provider;

use super::{
    prefixed_label, DeltaBatch, LabelOperation, MailProvider, NormalizedAttachment,
    NormalizedMessage, NormalizedThread, OutgoingMail, LABEL_PREFIX,
};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_RATE_LIMIT_RETRIES: usize = 5;
const REDACTED_BODY_MAX_LEN: usize = 200;

/// Gmail REST adapter. Threads are native here, so one Gmail thread maps to
/// one normalized thread; history records drive incremental sync.
#[derive(Debug, Clone)]
pub struct GmailProvider {
    client: Client,
    base_url: String,
}

impl Default for GmailProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl GmailProvider {
    pub fn new() -> Self {
        let base_url = std::env::var("ZEROHANDS_GMAIL_API_BASE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| GMAIL_API_BASE.to_string());
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
                .with_context(|| format!("gmail api request: {url}"))?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    let body = response
                        .text()
                        .await
                        .context("read gmail 429 response body")?;
                    return Err(anyhow!(
                        "gmail api request exhausted retries: {}",
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
                .context("read gmail api response body")?;
            if !status.is_success() {
                return Err(anyhow!(
                    "gmail api request failed: status={} body={}",
                    status,
                    redact_response_body(&body)
                ));
            }

            return Ok(Some(body));
        }

        Err(anyhow!("gmail api request failed without response"))
    }

    async fn get(&self, token: &str, url: &str) -> Result<String> {
        self.request_raw(token, Method::GET, url, None, false)
            .await?
            .ok_or_else(|| anyhow!("gmail api returned no body: {url}"))
    }

    async fn post(&self, token: &str, url: &str, payload: &serde_json::Value) -> Result<String> {
        self.request_raw(token, Method::POST, url, Some(payload), false)
            .await?
            .ok_or_else(|| anyhow!("gmail api returned no body: {url}"))
    }

    async fn get_profile(&self, token: &str) -> Result<GmailProfile> {
        let url = format!("{}/users/me/profile", self.base_url);
        let body = self.get(token, &url).await?;
        serde_json::from_str(&body).context("decode gmail profile")
    }

    async fn list_thread_stubs(
        &self,
        token: &str,
        query: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<GmailThreadList> {
        let mut url = format!(
            "{}/users/me/threads?maxResults={page_size}&q={}",
            self.base_url,
            encode_query(query)
        );
        if let Some(pt) = page_token {
            url.push_str(&format!("&pageToken={pt}"));
        }
        let body = self.get(token, &url).await?;
        serde_json::from_str(&body).context("decode gmail thread list")
    }

    async fn get_thread(&self, token: &str, thread_id: &str) -> Result<Option<GmailThread>> {
        let url = format!("{}/users/me/threads/{thread_id}?format=full", self.base_url);
        let Some(body) = self
            .request_raw(token, Method::GET, &url, None, true)
            .await?
        else {
            return Ok(None);
        };
        let thread: GmailThread = serde_json::from_str(&body).context("decode gmail thread")?;
        Ok(Some(thread))
    }

    async fn list_history(
        &self,
        token: &str,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<GmailHistoryList> {
        let mut url = format!(
            "{}/users/me/history?startHistoryId={start_history_id}&maxResults={DEFAULT_PAGE_SIZE}",
            self.base_url
        );
        if let Some(pt) = page_token {
            url.push_str(&format!("&pageToken={pt}"));
        }
        let body = self.get(token, &url).await?;
        serde_json::from_str(&body).context("decode gmail history list")
    }

    /// Fetch full threads for `thread_ids` with bounded concurrency. A
    /// failed or vanished thread is logged and dropped; the next sync pass
    /// sees its history records again.
    async fn fetch_threads(&self, token: &str, thread_ids: Vec<String>) -> Vec<NormalizedThread> {
        let settled = run_chunked(thread_ids, BatchPolicy::default(), |thread_id| async move {
            let fetched = self.get_thread(token, &thread_id).await?;
            Ok((thread_id, fetched))
        })
        .await;

        let mut threads = Vec::new();
        for result in settled {
            match result {
                Ok((_, Some(thread))) => {
                    if let Some(normalized) = normalize_thread(thread) {
                        threads.push(normalized);
                    }
                }
                Ok((thread_id, None)) => {
                    warn!("gmail thread {thread_id} vanished before fetch, skipping");
                }
                Err(error) => {
                    warn!("gmail thread fetch failed, skipping: {error:#}");
                }
            }
        }
        threads
    }

    /// Map desired label names to Gmail label ids, creating any that do not
    /// exist yet. On a create conflict the list is re-read, which absorbs a
    /// concurrent writer having won the race.
    async fn ensure_labels(
        &self,
        token: &str,
        names: &[String],
    ) -> Result<HashMap<String, String>> {
        let mut by_name = self.list_account_labels(token).await?;

        for name in names {
            if by_name.contains_key(name) {
                continue;
            }
            let url = format!("{}/users/me/labels", self.base_url);
            let payload = serde_json::json!({
                "name": name,
                "labelListVisibility": "labelShow",
                "messageListVisibility": "show",
            });
            match self.post(token, &url, &payload).await {
                Ok(body) => {
                    let created: GmailLabel =
                        serde_json::from_str(&body).context("decode created gmail label")?;
                    by_name.insert(created.name, created.id);
                }
                Err(create_error) => {
                    by_name = self.list_account_labels(token).await?;
                    if !by_name.contains_key(name) {
                        return Err(create_error.context(format!("create gmail label {name}")));
                    }
                }
            }
        }

        Ok(by_name)
    }

    async fn list_account_labels(&self, token: &str) -> Result<HashMap<String, String>> {
        let url = format!("{}/users/me/labels", self.base_url);
        let body = self.get(token, &url).await?;
        let list: GmailLabelList = serde_json::from_str(&body).context("decode gmail label list")?;
        Ok(list
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|label| (label.name, label.id))
            .collect())
    }

    async fn modify_thread(
        &self,
        token: &str,
        thread_id: &str,
        add_label_ids: Vec<String>,
        remove_label_ids: Vec<String>,
    ) -> Result<()> {
        if add_label_ids.is_empty() && remove_label_ids.is_empty() {
            return Ok(());
        }
        let url = format!("{}/users/me/threads/{thread_id}/modify", self.base_url);
        let payload = serde_json::json!({
            "addLabelIds": add_label_ids,
            "removeLabelIds": remove_label_ids,
        });
        self.post(token, &url, &payload).await?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl MailProvider for GmailProvider {
    fn kind(&self) -> Provider {
        Provider::Google
    }

    async fn list_recent(
        &self,
        access_token: &str,
        since: DateTime<Utc>,
        max_results: Option<usize>,
    ) -> Result<DeltaBatch> {
        // Capture the cursor before enumeration so changes that land during
        // the listing are replayed by the first incremental pass.
        let profile = self.get_profile(access_token).await?;

        let query = format!("in:inbox after:{}", since.format("%Y/%m/%d"));
        let cap = max_results.unwrap_or(usize::MAX);
        let mut thread_ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let remaining = cap.saturating_sub(thread_ids.len());
            if remaining == 0 {
                break;
            }
            let page_size = remaining.min(DEFAULT_PAGE_SIZE);
            let list = self
                .list_thread_stubs(access_token, &query, page_size, page_token.as_deref())
                .await?;

            thread_ids.extend(
                list.threads
                    .unwrap_or_default()
                    .into_iter()
                    .map(|stub| stub.id),
            );
            thread_ids.truncate(cap);

            page_token = list.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        let threads = self.fetch_threads(access_token, thread_ids).await;
        Ok(DeltaBatch {
            threads,
            cursor: Some(profile.history_id),
        })
    }

    async fn changes_since(&self, access_token: &str, cursor: &str) -> Result<DeltaBatch> {
        let mut page_token: Option<String> = None;
        let mut seen_thread_ids = HashSet::new();
        let mut thread_ids = Vec::new();

        let latest_history_id = loop {
            let list = match self
                .list_history(access_token, cursor, page_token.as_deref())
                .await
            {
                Ok(list) => list,
                Err(error) => {
                    // Gmail expires history ids after roughly a week; a 404
                    // here means the cursor is unusable, not that the
                    // mailbox is gone. Re-enumerate a short window instead.
                    if format!("{error}").contains("status=404") {
                        warn!("gmail history id {cursor} expired, re-listing recent inbox");
                        return self
                            .list_recent(
                                access_token,
                                Utc::now() - Duration::days(1),
                                Some(DEFAULT_PAGE_SIZE),
                            )
                            .await;
                    }
                    return Err(error);
                }
            };

            for record in list.history.unwrap_or_default() {
                let mut touched = Vec::new();
                if let Some(added) = &record.messages_added {
                    touched.extend(added.iter().map(|entry| entry.message.thread_id.clone()));
                }
                if let Some(labels_added) = &record.labels_added {
                    touched.extend(
                        labels_added
                            .iter()
                            .map(|entry| entry.message.thread_id.clone()),
                    );
                }
                if let Some(labels_removed) = &record.labels_removed {
                    touched.extend(
                        labels_removed
                            .iter()
                            .map(|entry| entry.message.thread_id.clone()),
                    );
                }
                // messagesDeleted is intentionally ignored: the cache is
                // additive and never prunes.

                for thread_id in touched {
                    if seen_thread_ids.insert(thread_id.clone()) {
                        thread_ids.push(thread_id);
                    }
                }
            }

            page_token = list.next_page_token;
            if page_token.is_none() {
                break list.history_id;
            }
        };

        let threads = self.fetch_threads(access_token, thread_ids).await;
        Ok(DeltaBatch {
            threads,
            cursor: Some(latest_history_id),
        })
    }

    async fn fetch_thread(
        &self,
        access_token: &str,
        external_id: &str,
    ) -> Result<Option<NormalizedThread>> {
        let thread = self.get_thread(access_token, external_id).await?;
        Ok(thread.and_then(normalize_thread))
    }

    async fn apply_labels(
        &self,
        access_token: &str,
        thread_external_id: &str,
        labels: &[String],
        operation: LabelOperation,
    ) -> Result<()> {
        let desired: Vec<String> = labels.iter().map(|label| prefixed_label(label)).collect();

        let (add_ids, remove_ids) = match operation {
            LabelOperation::Add => {
                let by_name = self.ensure_labels(access_token, &desired).await?;
                let add = lookup_ids(&by_name, &desired);
                (add, Vec::new())
            }
            LabelOperation::Remove => {
                // Removing a label that was never created is a no-op.
                let by_name = self.list_account_labels(access_token).await?;
                let remove = lookup_ids(&by_name, &desired);
                (Vec::new(), remove)
            }
            LabelOperation::Replace => {
                let by_name = self.ensure_labels(access_token, &desired).await?;
                let keep: HashSet<&str> = desired.iter().map(String::as_str).collect();
                let remove = prefixed_ids_except(&by_name, &keep);
                let add = lookup_ids(&by_name, &desired);
                (add, remove)
            }
        };

        self.modify_thread(access_token, thread_external_id, add_ids, remove_ids)
            .await
    }

    async fn mark_read(&self, access_token: &str, external_id: &str) -> Result<()> {
        self.modify_thread(
            access_token,
            external_id,
            Vec::new(),
            vec!["UNREAD".to_string()],
        )
        .await
    }

    async fn send_mail(&self, access_token: &str, mail: &OutgoingMail) -> Result<()> {
        let raw = URL_SAFE_NO_PAD.encode(build_rfc822(mail));
        let url = format!("{}/users/me/messages/send", self.base_url);
        let payload = serde_json::json!({ "raw": raw });
        self.post(access_token, &url, &payload).await?;
        Ok(())
    }
}

fn lookup_ids(by_name: &HashMap<String, String>, names: &[String]) -> Vec<String> {
    names
        .iter()
        .filter_map(|name| by_name.get(name).cloned())
        .collect()
}

/// Ids of every account label carrying the custom prefix that is not in
/// `keep`. Used by replace to clear stale labels without touching system or
/// user-defined ones.
fn prefixed_ids_except(by_name: &HashMap<String, String>, keep: &HashSet<&str>) -> Vec<String> {
    by_name
        .iter()
        .filter(|(name, _)| name.starts_with(LABEL_PREFIX) && !keep.contains(name.as_str()))
        .map(|(_, id)| id.clone())
        .collect()
}

fn build_rfc822(mail: &OutgoingMail) -> String {
    let content_type = if mail.is_html {
        "text/html; charset=utf-8"
    } else {
        "text/plain; charset=utf-8"
    };
    format!(
        "To: {}\r\nSubject: {}\r\nMIME-Version: 1.0\r\nContent-Type: {}\r\n\r\n{}",
        mail.to, mail.subject, content_type, mail.body
    )
}

/// Gmail query strings carry spaces; the URL is assembled by hand, so encode
/// them the way the API expects.
fn encode_query(query: &str) -> String {
    query.replace(' ', "+")
}

fn redact_response_body(body: &str) -> String {
    let trimmed: String = body.chars().take(REDACTED_BODY_MAX_LEN).collect();
    if body.len() > trimmed.len() {
        format!("{trimmed}…")
    } else {
        trimmed
    }
}

// --- Normalization ---

fn normalize_thread(thread: GmailThread) -> Option<NormalizedThread> {
    let messages: Vec<NormalizedMessage> = thread
        .messages
        .iter()
        .map(|message| normalize_message(&thread.id, message))
        .collect();

    let first = thread.messages.first()?;
    let latest = thread.messages.last()?;

    let any_unread = thread.messages.iter().any(|m| has_label(m, "UNREAD"));
    let any_important = thread.messages.iter().any(|m| has_label(m, "IMPORTANT"));
    let has_attachments = messages.iter().any(|m| !m.attachments.is_empty());

    let (from_name, from_address) = parse_from_header(header_value(&latest.payload, "From"));
    let subject = header_value(&first.payload, "Subject").map(str::to_string);
    let timestamp = messages
        .iter()
        .map(|m| m.timestamp)
        .max()
        .unwrap_or_else(Utc::now);

    Some(NormalizedThread {
        external_id: thread.id.clone(),
        subject,
        from_name,
        from_address,
        snippet: latest.snippet.clone(),
        timestamp,
        is_read: !any_unread,
        is_important: any_important,
        has_attachments,
        messages,
    })
}

fn normalize_message(thread_id: &str, message: &GmailMessage) -> NormalizedMessage {
    let (from_name, from_address) = parse_from_header(header_value(&message.payload, "From"));
    let (body_text, body_html) = extract_body_parts(&message.payload);

    let mut attachments = Vec::new();
    collect_attachments(&message.payload, &mut attachments);

    NormalizedMessage {
        external_id: message.id.clone(),
        thread_external_id: thread_id.to_string(),
        subject: header_value(&message.payload, "Subject").map(str::to_string),
        from_name,
        from_address,
        to_address: header_value(&message.payload, "To").map(str::to_string),
        timestamp: parse_internal_date(message.internal_date.as_deref()),
        body_text,
        body_html,
        is_read: !has_label(message, "UNREAD"),
        attachments,
    }
}

fn has_label(message: &GmailMessage, label: &str) -> bool {
    message
        .label_ids
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|id| id == label)
}

fn header_value<'a>(payload: &'a GmailPayload, name: &str) -> Option<&'a str> {
    payload
        .headers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
}

fn parse_from_header(raw: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(raw) = raw else {
        return (None, None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return (None, None);
    }

    // Pattern: "Display Name <email@example.com>"
    if let Some(angle_start) = raw.rfind('<') {
        if let Some(angle_end) = raw.rfind('>') {
            let address = raw[angle_start + 1..angle_end].trim().to_string();
            let name_part = raw[..angle_start].trim();
            let name = name_part.trim_matches('"').trim().to_string();
            let name = if name.is_empty() { None } else { Some(name) };
            let address = if address.is_empty() {
                None
            } else {
                Some(address)
            };
            return (name, address);
        }
    }

    if raw.contains('@') {
        return (None, Some(raw.to_string()));
    }

    (Some(raw.to_string()), None)
}

fn parse_internal_date(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|value| value.parse::<i64>().ok())
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        .unwrap_or_else(Utc::now)
}

fn extract_body_parts(payload: &GmailPayload) -> (Option<String>, Option<String>) {
    let mut text_body = None;
    let mut html_body = None;
    collect_body_parts(payload, &mut text_body, &mut html_body);

    // If we only have HTML, generate text from it
    if text_body.is_none() && html_body.is_some() {
        text_body = html_body.as_ref().and_then(|html| {
            std::panic::catch_unwind(|| {
                html2text::from_read(html.as_bytes(), 120)
                    .lines()
                    .map(str::trim_end)
                    .collect::<Vec<_>>()
                    .join("\n")
                    .trim()
                    .to_string()
            })
            .ok()
        });
        if text_body.as_deref().is_some_and(|t| t.is_empty()) {
            text_body = None;
        }
    }

    (text_body, html_body)
}

fn collect_body_parts(
    payload: &GmailPayload,
    text_body: &mut Option<String>,
    html_body: &mut Option<String>,
) {
    let mime_type = payload
        .mime_type
        .as_deref()
        .unwrap_or("")
        .to_ascii_lowercase();

    // Leaf node with body data
    if let Some(body) = &payload.body {
        if let Some(data) = &body.data {
            if !data.is_empty() {
                if let Ok(decoded) = decode_body_data(data) {
                    if mime_type == "text/plain" && text_body.is_none() {
                        *text_body = Some(decoded);
                    } else if mime_type == "text/html" && html_body.is_none() {
                        *html_body = Some(decoded);
                    }
                }
            }
        }
    }

    if let Some(parts) = &payload.parts {
        for part in parts {
            collect_body_parts(part, text_body, html_body);
        }
    }
}

fn decode_body_data(data: &str) -> Result<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data)
        .context("base64url decode gmail body data")?;
    String::from_utf8(bytes).context("utf8 decode gmail body data")
}

/// Any part at any depth with a filename and an attachmentId is an
/// attachment; inline images carry a Content-ID header.
fn collect_attachments(payload: &GmailPayload, out: &mut Vec<NormalizedAttachment>) {
    if let (Some(filename), Some(body)) = (&payload.filename, &payload.body) {
        if !filename.is_empty() {
            if let Some(attachment_id) = &body.attachment_id {
                let is_inline = header_value(payload, "Content-ID").is_some()
                    || header_value(payload, "Content-Disposition")
                        .is_some_and(|value| value.trim_start().starts_with("inline"));
                out.push(NormalizedAttachment {
                    external_id: attachment_id.clone(),
                    filename: Some(filename.clone()),
                    mime_type: payload.mime_type.clone(),
                    size_bytes: body.size.map(|size| size as i64),
                    content_ref: Some(attachment_id.clone()),
                    is_inline,
                });
            }
        }
    }

    if let Some(parts) = &payload.parts {
        for part in parts {
            collect_attachments(part, out);
        }
    }
}

// --- Gmail API response types ---
// #[allow(dead_code)] on these structs: fields are deserialized from the API
// but not all are read directly — they exist to match the API contract.

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
struct GmailProfile {
    #[serde(rename = "emailAddress")]
    email_address: String,
    #[serde(rename = "historyId")]
    history_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
struct GmailThreadList {
    threads: Option<Vec<GmailThreadStub>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "resultSizeEstimate")]
    result_size_estimate: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
struct GmailThreadStub {
    id: String,
    snippet: Option<String>,
    #[serde(rename = "historyId")]
    history_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
struct GmailThread {
    id: String,
    #[serde(rename = "historyId")]
    history_id: Option<String>,
    #[serde(default)]
    messages: Vec<GmailMessage>,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
struct GmailMessage {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: String,
    #[serde(rename = "labelIds")]
    label_ids: Option<Vec<String>>,
    snippet: Option<String>,
    payload: GmailPayload,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailPayload {
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    headers: Option<Vec<GmailHeader>>,
    body: Option<GmailBody>,
    parts: Option<Vec<GmailPayload>>,
    filename: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
struct GmailBody {
    size: Option<u64>,
    data: Option<String>,
    #[serde(rename = "attachmentId")]
    attachment_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailLabel {
    id: String,
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailLabelList {
    labels: Option<Vec<GmailLabel>>,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
struct GmailHistoryList {
    history: Option<Vec<GmailHistoryRecord>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "historyId")]
    history_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailHistoryRecord {
    #[serde(rename = "messagesAdded")]
    messages_added: Option<Vec<GmailHistoryEntry>>,
    #[serde(rename = "labelsAdded")]
    labels_added: Option<Vec<GmailHistoryEntry>>,
    #[serde(rename = "labelsRemoved")]
    labels_removed: Option<Vec<GmailHistoryEntry>>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailHistoryEntry {
    message: GmailHistoryMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailHistoryMessage {
    #[serde(rename = "threadId")]
    thread_id: String,
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use super::*;

    fn leaf(mime: &str, data: &str) -> GmailPayload {
        GmailPayload {
            mime_type: Some(mime.to_string()),
            headers: None,
            body: Some(GmailBody {
                size: Some(data.len() as u64),
                data: Some(URL_SAFE_NO_PAD.encode(data)),
                attachment_id: None,
            }),
            parts: None,
            filename: Some(String::new()),
        }
    }

    #[test]
    fn parse_from_header_variants() {
        assert_eq!(
            parse_from_header(Some("Ada Lovelace <ada@example.com>")),
            (
                Some("Ada Lovelace".to_string()),
                Some("ada@example.com".to_string())
            )
        );
        assert_eq!(
            parse_from_header(Some("\"Lovelace, Ada\" <ada@example.com>")),
            (
                Some("Lovelace, Ada".to_string()),
                Some("ada@example.com".to_string())
            )
        );
        assert_eq!(
            parse_from_header(Some("ada@example.com")),
            (None, Some("ada@example.com".to_string()))
        );
        assert_eq!(parse_from_header(None), (None, None));
    }

    #[test]
    fn internal_date_parses_millis_since_epoch() {
        let parsed = parse_internal_date(Some("1700000000000"));
        assert_eq!(parsed.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn multipart_body_extraction_prefers_first_match_per_type() {
        let payload = GmailPayload {
            mime_type: Some("multipart/alternative".to_string()),
            headers: None,
            body: None,
            parts: Some(vec![leaf("text/plain", "hello"), leaf("text/html", "<p>hello</p>")]),
            filename: Some(String::new()),
        };

        let (text, html) = extract_body_parts(&payload);
        assert_eq!(text.as_deref(), Some("hello"));
        assert_eq!(html.as_deref(), Some("<p>hello</p>"));
    }

    #[test]
    fn html_only_body_gets_derived_text() {
        let payload = leaf("text/html", "<p>only html</p>");
        let (text, html) = extract_body_parts(&payload);
        assert!(html.is_some());
        assert_eq!(text.as_deref(), Some("only html"));
    }

    #[test]
    fn attachments_are_collected_from_nested_parts() {
        let attachment = GmailPayload {
            mime_type: Some("application/pdf".to_string()),
            headers: None,
            body: Some(GmailBody {
                size: Some(1024),
                data: None,
                attachment_id: Some("att-1".to_string()),
            }),
            parts: None,
            filename: Some("report.pdf".to_string()),
        };
        let root = GmailPayload {
            mime_type: Some("multipart/mixed".to_string()),
            headers: None,
            body: None,
            parts: Some(vec![leaf("text/plain", "see attached"), attachment]),
            filename: Some(String::new()),
        };

        let mut out = Vec::new();
        collect_attachments(&root, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].external_id, "att-1");
        assert_eq!(out[0].filename.as_deref(), Some("report.pdf"));
        assert_eq!(out[0].size_bytes, Some(1024));
        assert!(!out[0].is_inline);
    }

    #[test]
    fn replace_removes_only_prefixed_labels_outside_keep_set() {
        let mut by_name = HashMap::new();
        by_name.insert("ZEROHANDS_FYI".to_string(), "l1".to_string());
        by_name.insert("ZEROHANDS_MARKETING".to_string(), "l2".to_string());
        by_name.insert("INBOX".to_string(), "l3".to_string());
        by_name.insert("my-own-label".to_string(), "l4".to_string());

        let keep: HashSet<&str> = ["ZEROHANDS_FYI"].into_iter().collect();
        let removals = prefixed_ids_except(&by_name, &keep);
        assert_eq!(removals, vec!["l2".to_string()]);
    }

    #[test]
    fn rfc822_carries_content_type_for_html() {
        let mail = OutgoingMail {
            to: "to@example.com".to_string(),
            subject: "Hi".to_string(),
            body: "<b>yo</b>".to_string(),
            is_html: true,
        };
        let raw = build_rfc822(&mail);
        assert!(raw.contains("To: to@example.com\r\n"));
        assert!(raw.contains("Content-Type: text/html; charset=utf-8"));
        assert!(raw.ends_with("\r\n\r\n<b>yo</b>"));
    }

    #[test]
    fn query_spaces_are_encoded() {
        assert_eq!(encode_query("in:inbox after:2026/08/01"), "in:inbox+after:2026/08/01");
    }

    #[test]
    fn label_list_decodes_to_name_id_map() {
        let body = r#"{
            "labels": [
                {"id": "Label_7", "name": "ZEROHANDS_FYI", "type": "user"},
                {"id": "INBOX", "name": "INBOX", "type": "system"}
            ]
        }"#;
        let list: GmailLabelList = serde_json::from_str(body).expect("decode label list");
        let by_name: HashMap<String, String> = list
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|label| (label.name, label.id))
            .collect();
        assert_eq!(by_name.get("ZEROHANDS_FYI").map(String::as_str), Some("Label_7"));

        let created: GmailLabel =
            serde_json::from_str(r#"{"id": "Label_8", "name": "ZEROHANDS_ACTIONED"}"#)
                .expect("decode created label");
        assert_eq!(created.id, "Label_8");
        assert_eq!(created.name, "ZEROHANDS_ACTIONED");
    }

    /// Serves a two-page history listing over a local socket. Threads named
    /// by the history come back without messages so they drop out during
    /// normalization.
    async fn spawn_history_server() -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let addr = listener.local_addr().expect("listener addr");

        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let mut buffer = vec![0u8; 4096];
                    let read = socket.read(&mut buffer).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buffer[..read]).to_string();
                    let path = request
                        .lines()
                        .next()
                        .and_then(|line| line.split_whitespace().nth(1))
                        .unwrap_or("")
                        .to_string();
                    let body = if path.contains("/users/me/history") {
                        if path.contains("pageToken=page-2") {
                            r#"{"historyId":"hist-2","history":[{"messagesAdded":[{"message":{"threadId":"t-2"}}]}]}"#
                        } else {
                            r#"{"historyId":"hist-1","nextPageToken":"page-2","history":[{"messagesAdded":[{"message":{"threadId":"t-1"}}]}]}"#
                        }
                    } else {
                        r#"{"id":"t-empty"}"#
                    };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });

        addr
    }

    #[tokio::test]
    async fn incremental_cursor_comes_from_the_last_history_page() {
        let addr = spawn_history_server().await;
        let provider = GmailProvider {
            client: Client::new(),
            base_url: format!("http://{addr}"),
        };

        let batch = provider
            .changes_since("token", "hist-0")
            .await
            .expect("paginated history");

        assert_eq!(batch.cursor.as_deref(), Some("hist-2"));
        assert!(batch.threads.is_empty());
    }
}
