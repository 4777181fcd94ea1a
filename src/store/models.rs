use std::fmt::{Display, Formatter};
use std::str::FromStr;

use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Outlook,
}

impl Display for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Google => write!(f, "google"),
            Self::Outlook => write!(f, "outlook"),
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google" | "gmail" => Ok(Self::Google),
            "outlook" | "microsoft" => Ok(Self::Outlook),
            other => Err(format!("invalid provider: {other}")),
        }
    }
}

/// One authenticated mailbox account. Access tokens are handed in by the
/// credential layer; this engine never refreshes them itself. The cursor
/// columns are written only by the sync coordinator after a successful pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    pub email: String,
    pub provider: Provider,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub gmail_history_id: Option<String>,
    pub outlook_delta_token: Option<String>,
    pub last_sync_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thread {
    pub id: i64,
    pub user_id: String,
    pub external_id: String,
    pub subject: Option<String>,
    pub from_name: Option<String>,
    pub from_address: Option<String>,
    pub snippet: Option<String>,
    pub timestamp: String,
    pub is_read: bool,
    pub is_important: bool,
    pub has_attachments: bool,
    pub is_labeled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: i64,
    pub user_id: String,
    pub thread_id: i64,
    pub external_id: String,
    pub thread_external_id: String,
    pub subject: Option<String>,
    pub from_name: Option<String>,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub timestamp: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub is_read: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub id: i64,
    pub user_id: String,
    pub message_id: i64,
    pub external_id: String,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: Option<i64>,
    pub content_ref: Option<String>,
    pub is_inline: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncState {
    pub key: String,
    pub value: Option<String>,
    pub updated_at: Option<String>,
}

impl User {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let provider_raw: String = row.get("provider")?;
        let provider = Provider::from_str(&provider_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                provider_raw.len(),
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;

        Ok(Self {
            id: row.get("id")?,
            email: row.get("email")?,
            provider,
            access_token: row.get("access_token")?,
            refresh_token: row.get("refresh_token")?,
            gmail_history_id: row.get("gmail_history_id")?,
            outlook_delta_token: row.get("outlook_delta_token")?,
            last_sync_time: row.get("last_sync_time")?,
        })
    }

    /// The provider-specific cursor for this account, if one has ever been
    /// stored. `None` signals a cold start.
    pub fn cursor(&self) -> Option<&str> {
        match self.provider {
            Provider::Google => self.gmail_history_id.as_deref(),
            Provider::Outlook => self.outlook_delta_token.as_deref(),
        }
    }
}

impl Thread {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            external_id: row.get("external_id")?,
            subject: row.get("subject")?,
            from_name: row.get("from_name")?,
            from_address: row.get("from_address")?,
            snippet: row.get("snippet")?,
            timestamp: row.get("timestamp")?,
            is_read: row.get("is_read")?,
            is_important: row.get("is_important")?,
            has_attachments: row.get("has_attachments")?,
            is_labeled: row.get("is_labeled")?,
        })
    }
}

impl Message {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            thread_id: row.get("thread_id")?,
            external_id: row.get("external_id")?,
            thread_external_id: row.get("thread_external_id")?,
            subject: row.get("subject")?,
            from_name: row.get("from_name")?,
            from_address: row.get("from_address")?,
            to_address: row.get("to_address")?,
            timestamp: row.get("timestamp")?,
            body_text: row.get("body_text")?,
            body_html: row.get("body_html")?,
            is_read: row.get("is_read")?,
        })
    }
}

impl Attachment {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            message_id: row.get("message_id")?,
            external_id: row.get("external_id")?,
            filename: row.get("filename")?,
            mime_type: row.get("mime_type")?,
            size_bytes: row.get("size_bytes")?,
            content_ref: row.get("content_ref")?,
            is_inline: row.get("is_inline")?,
        })
    }
}

impl SyncState {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            key: row.get("key")?,
            value: row.get("value")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Provider, User};

    #[test]
    fn provider_display_and_parse() {
        assert_eq!(Provider::Google.to_string(), "google");
        assert_eq!(Provider::Outlook.to_string(), "outlook");
        assert_eq!(
            "gmail".parse::<Provider>().expect("parse provider"),
            Provider::Google
        );
        assert!("imap".parse::<Provider>().is_err());
    }

    #[test]
    fn cursor_follows_provider() {
        let mut user = User {
            id: "u-1".to_string(),
            email: "person@example.com".to_string(),
            provider: Provider::Google,
            access_token: Some("tok".to_string()),
            refresh_token: None,
            gmail_history_id: Some("12345".to_string()),
            outlook_delta_token: Some("delta-abc".to_string()),
            last_sync_time: None,
        };
        assert_eq!(user.cursor(), Some("12345"));

        user.provider = Provider::Outlook;
        assert_eq!(user.cursor(), Some("delta-abc"));

        user.outlook_delta_token = None;
        assert_eq!(user.cursor(), None);
    }
}
