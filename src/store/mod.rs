use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use serde::Serialize;
use thiserror::Error;

use self::models::{Attachment, Message, SyncState, Thread, User};

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),
}

pub mod models;
pub mod schema;

/// Scalar fields of a thread as produced by a provider adapter, before the
/// row exists. Upserting returns the persisted row id.
#[derive(Debug, Clone)]
pub struct ThreadWrite {
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
}

#[derive(Debug, Clone)]
pub struct MessageWrite {
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

#[derive(Debug, Clone)]
pub struct AttachmentWrite {
    pub user_id: String,
    pub message_id: i64,
    pub external_id: String,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: Option<i64>,
    pub content_ref: Option<String>,
    pub is_inline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadPage {
    pub threads: Vec<Thread>,
    pub total_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserThreadCount {
    pub user_id: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_users: i64,
    pub total_threads: i64,
    pub total_messages: i64,
    pub threads_by_user: Vec<UserThreadCount>,
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let mut db = Self {
            conn,
            path: path.to_path_buf(),
        };
        db.initialize()?;
        Ok(db)
    }

    pub fn initialize(&mut self) -> Result<(), DbError> {
        schema::prepare(&self.conn)
            .map_err(|e| DbError::Config(format!("schema preparation failed: {e}")))
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".zerohands").join("zerohands.db"))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // --- users ---

    pub fn upsert_user(&self, user: &User) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO users (
                id, email, provider, access_token, refresh_token,
                gmail_history_id, outlook_delta_token, last_sync_time
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(email) DO UPDATE SET
                provider = excluded.provider,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token
            "#,
            params![
                user.id,
                user.email,
                user.provider.to_string(),
                user.access_token,
                user.refresh_token,
                user.gmail_history_id,
                user.outlook_delta_token,
                user.last_sync_time,
            ],
        )?;
        Ok(())
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, email, provider, access_token, refresh_token,
                   gmail_history_id, outlook_delta_token, last_sync_time
            FROM users
            WHERE email = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query([email])?;
        if let Some(row) = rows.next()? {
            Ok(Some(User::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_users(&self) -> Result<Vec<User>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, email, provider, access_token, refresh_token,
                   gmail_history_id, outlook_delta_token, last_sync_time
            FROM users
            ORDER BY email ASC
            "#,
        )?;

        let users = stmt
            .query_map([], User::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(users)
    }

    pub fn remove_user(&self, email: &str) -> Result<usize, DbError> {
        let deleted = self
            .conn
            .execute("DELETE FROM users WHERE email = ?", [email])?;
        Ok(deleted)
    }

    pub fn set_gmail_history_id(&self, user_id: &str, history_id: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE users SET gmail_history_id = ? WHERE id = ?",
            params![history_id, user_id],
        )?;
        Ok(())
    }

    pub fn set_outlook_delta_token(&self, user_id: &str, delta_token: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE users SET outlook_delta_token = ? WHERE id = ?",
            params![delta_token, user_id],
        )?;
        Ok(())
    }

    pub fn touch_last_sync(&self, user_id: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE users SET last_sync_time = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?",
            [user_id],
        )?;
        Ok(())
    }

    // --- threads ---

    /// Insert-or-replace on (user, external id); scalar fields are
    /// last-write-wins and the timestamp is always refreshed. `is_labeled`
    /// survives updates so an already-classified thread keeps its flag.
    pub fn upsert_thread(&self, thread: &ThreadWrite) -> Result<i64, DbError> {
        let id = self.conn.query_row(
            r#"
            INSERT INTO threads (
                user_id, external_id, subject, from_name, from_address,
                snippet, timestamp, is_read, is_important, has_attachments
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, external_id) DO UPDATE SET
                subject = excluded.subject,
                from_name = excluded.from_name,
                from_address = excluded.from_address,
                snippet = excluded.snippet,
                timestamp = excluded.timestamp,
                is_read = excluded.is_read,
                is_important = excluded.is_important,
                has_attachments = excluded.has_attachments
            RETURNING id
            "#,
            params![
                thread.user_id,
                thread.external_id,
                thread.subject,
                thread.from_name,
                thread.from_address,
                thread.snippet,
                thread.timestamp,
                thread.is_read,
                thread.is_important,
                thread.has_attachments,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_thread_by_external_id(
        &self,
        user_id: &str,
        external_id: &str,
    ) -> Result<Option<Thread>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, user_id, external_id, subject, from_name, from_address,
                   snippet, timestamp, is_read, is_important, has_attachments, is_labeled
            FROM threads
            WHERE user_id = ? AND external_id = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query(params![user_id, external_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Thread::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_threads(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<ThreadPage, DbError> {
        let total_count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM threads WHERE user_id = ?",
            [user_id],
            |row| row.get(0),
        )?;

        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, user_id, external_id, subject, from_name, from_address,
                   snippet, timestamp, is_read, is_important, has_attachments, is_labeled
            FROM threads
            WHERE user_id = ?
            ORDER BY timestamp DESC
            LIMIT ? OFFSET ?
            "#,
        )?;

        let threads = stmt
            .query_map(
                params![user_id, limit as i64, offset as i64],
                Thread::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(ThreadPage {
            threads,
            total_count,
        })
    }

    pub fn set_thread_read_state(
        &self,
        user_id: &str,
        external_id: &str,
        is_read: bool,
    ) -> Result<usize, DbError> {
        let updated = self.conn.execute(
            "UPDATE threads SET is_read = ? WHERE user_id = ? AND external_id = ?",
            params![is_read, user_id, external_id],
        )?;
        Ok(updated)
    }

    pub fn mark_thread_labeled(&self, thread_id: i64) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE threads SET is_labeled = true WHERE id = ?",
            [thread_id],
        )?;
        Ok(())
    }

    // --- messages ---

    pub fn upsert_message(&self, message: &MessageWrite) -> Result<i64, DbError> {
        let id = self.conn.query_row(
            r#"
            INSERT INTO messages (
                user_id, thread_id, external_id, thread_external_id, subject,
                from_name, from_address, to_address, timestamp, body_text,
                body_html, is_read
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, external_id) DO UPDATE SET
                thread_id = excluded.thread_id,
                thread_external_id = excluded.thread_external_id,
                subject = excluded.subject,
                from_name = excluded.from_name,
                from_address = excluded.from_address,
                to_address = excluded.to_address,
                timestamp = excluded.timestamp,
                body_text = excluded.body_text,
                body_html = excluded.body_html,
                is_read = excluded.is_read
            RETURNING id
            "#,
            params![
                message.user_id,
                message.thread_id,
                message.external_id,
                message.thread_external_id,
                message.subject,
                message.from_name,
                message.from_address,
                message.to_address,
                message.timestamp,
                message.body_text,
                message.body_html,
                message.is_read,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_messages_by_thread(
        &self,
        user_id: &str,
        thread_external_id: &str,
    ) -> Result<Vec<Message>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, user_id, thread_id, external_id, thread_external_id, subject,
                   from_name, from_address, to_address, timestamp, body_text,
                   body_html, is_read
            FROM messages
            WHERE user_id = ? AND thread_external_id = ?
            ORDER BY timestamp ASC
            "#,
        )?;

        let messages = stmt
            .query_map(params![user_id, thread_external_id], Message::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    // --- attachments ---

    pub fn upsert_attachment(&self, attachment: &AttachmentWrite) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO attachments (
                user_id, message_id, external_id, filename, mime_type,
                size_bytes, content_ref, is_inline
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, external_id) DO UPDATE SET
                message_id = excluded.message_id,
                filename = excluded.filename,
                mime_type = excluded.mime_type,
                size_bytes = excluded.size_bytes,
                content_ref = excluded.content_ref,
                is_inline = excluded.is_inline
            "#,
            params![
                attachment.user_id,
                attachment.message_id,
                attachment.external_id,
                attachment.filename,
                attachment.mime_type,
                attachment.size_bytes,
                attachment.content_ref,
                attachment.is_inline,
            ],
        )?;
        Ok(())
    }

    pub fn get_attachments(&self, message_id: i64) -> Result<Vec<Attachment>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, user_id, message_id, external_id, filename, mime_type,
                   size_bytes, content_ref, is_inline
            FROM attachments
            WHERE message_id = ?
            ORDER BY id ASC
            "#,
        )?;

        let attachments = stmt
            .query_map([message_id], Attachment::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(attachments)
    }

    // --- labels ---
    // Label membership is a set: INSERT OR IGNORE makes re-adding a present
    // label (and concurrent duplicate-key races) a silent no-op.

    pub fn add_thread_labels(&self, thread_id: i64, labels: &[String]) -> Result<(), DbError> {
        for label in labels {
            self.conn.execute(
                "INSERT OR IGNORE INTO thread_labels (thread_id, label) VALUES (?, ?)",
                params![thread_id, label],
            )?;
        }
        Ok(())
    }

    pub fn remove_thread_labels(&self, thread_id: i64, labels: &[String]) -> Result<(), DbError> {
        for label in labels {
            self.conn.execute(
                "DELETE FROM thread_labels WHERE thread_id = ? AND label = ?",
                params![thread_id, label],
            )?;
        }
        Ok(())
    }

    pub fn replace_thread_labels(&self, thread_id: i64, labels: &[String]) -> Result<(), DbError> {
        self.conn.execute(
            "DELETE FROM thread_labels WHERE thread_id = ?",
            [thread_id],
        )?;
        self.add_thread_labels(thread_id, labels)
    }

    pub fn get_thread_labels(&self, thread_id: i64) -> Result<Vec<String>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT label FROM thread_labels WHERE thread_id = ? ORDER BY label ASC")?;
        let labels = stmt
            .query_map([thread_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(labels)
    }

    pub fn add_message_labels(&self, message_id: i64, labels: &[String]) -> Result<(), DbError> {
        for label in labels {
            self.conn.execute(
                "INSERT OR IGNORE INTO message_labels (message_id, label) VALUES (?, ?)",
                params![message_id, label],
            )?;
        }
        Ok(())
    }

    pub fn remove_message_labels(&self, message_id: i64, labels: &[String]) -> Result<(), DbError> {
        for label in labels {
            self.conn.execute(
                "DELETE FROM message_labels WHERE message_id = ? AND label = ?",
                params![message_id, label],
            )?;
        }
        Ok(())
    }

    pub fn replace_message_labels(&self, message_id: i64, labels: &[String]) -> Result<(), DbError> {
        self.conn.execute(
            "DELETE FROM message_labels WHERE message_id = ?",
            [message_id],
        )?;
        self.add_message_labels(message_id, labels)
    }

    pub fn get_message_labels(&self, message_id: i64) -> Result<Vec<String>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT label FROM message_labels WHERE message_id = ? ORDER BY label ASC")?;
        let labels = stmt
            .query_map([message_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(labels)
    }

    // --- sync state / stats ---

    pub fn get_sync_state(&self, key: &str) -> Result<Option<models::SyncState>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value, updated_at FROM sync_state WHERE key = ? LIMIT 1")?;
        let mut rows = stmt.query([key])?;
        if let Some(row) = rows.next()? {
            Ok(Some(SyncState::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn set_sync_state(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO sync_state (key, value, updated_at)
            VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_stats(&self) -> Result<CacheStats, DbError> {
        let total_users: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        let total_threads: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM threads", [], |row| row.get(0))?;
        let total_messages: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;

        let mut stmt = self.conn.prepare(
            "SELECT user_id, COUNT(*) AS count FROM threads GROUP BY user_id ORDER BY count DESC",
        )?;
        let threads_by_user = stmt
            .query_map([], |row| {
                Ok(UserThreadCount {
                    user_id: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(CacheStats {
            total_users,
            total_threads,
            total_messages,
            threads_by_user,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;

    use super::{Database, MessageWrite, ThreadWrite};
    use crate::store::models::{Provider, User};

    fn temp_db_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("zerohands-store-test-{}.db", Uuid::new_v4()));
        path
    }

    fn sample_user() -> User {
        User {
            id: "u-1".to_string(),
            email: "owner@example.com".to_string(),
            provider: Provider::Google,
            access_token: Some("token".to_string()),
            refresh_token: None,
            gmail_history_id: None,
            outlook_delta_token: None,
            last_sync_time: None,
        }
    }

    fn sample_thread(external_id: &str, timestamp: &str) -> ThreadWrite {
        ThreadWrite {
            user_id: "u-1".to_string(),
            external_id: external_id.to_string(),
            subject: Some("Project kickoff".to_string()),
            from_name: Some("Sender".to_string()),
            from_address: Some("sender@example.com".to_string()),
            snippet: Some("Let us meet tomorrow".to_string()),
            timestamp: timestamp.to_string(),
            is_read: false,
            is_important: false,
            has_attachments: false,
        }
    }

    #[test]
    fn thread_upsert_is_stable_on_conflict() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        db.upsert_user(&sample_user()).expect("upsert user");

        let first = db
            .upsert_thread(&sample_thread("t-1", "2026-02-01T12:00:00Z"))
            .expect("insert thread");

        let mut updated = sample_thread("t-1", "2026-02-02T09:00:00Z");
        updated.subject = Some("Project kickoff (rescheduled)".to_string());
        updated.is_read = true;
        let second = db.upsert_thread(&updated).expect("upsert thread");

        // Same row, refreshed scalars, no duplicate.
        assert_eq!(first, second);
        let page = db.list_threads("u-1", 10, 0).expect("list threads");
        assert_eq!(page.total_count, 1);
        assert_eq!(
            page.threads[0].subject.as_deref(),
            Some("Project kickoff (rescheduled)")
        );
        assert!(page.threads[0].is_read);
        assert_eq!(page.threads[0].timestamp, "2026-02-02T09:00:00Z");

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn message_upsert_keys_on_user_and_external_id() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        db.upsert_user(&sample_user()).expect("upsert user");
        let thread_id = db
            .upsert_thread(&sample_thread("t-1", "2026-02-01T12:00:00Z"))
            .expect("insert thread");

        let message = MessageWrite {
            user_id: "u-1".to_string(),
            thread_id,
            external_id: "m-1".to_string(),
            thread_external_id: "t-1".to_string(),
            subject: Some("Project kickoff".to_string()),
            from_name: Some("Sender".to_string()),
            from_address: Some("sender@example.com".to_string()),
            to_address: Some("owner@example.com".to_string()),
            timestamp: "2026-02-01T12:00:00Z".to_string(),
            body_text: Some("Let us meet tomorrow".to_string()),
            body_html: None,
            is_read: false,
        };

        let first = db.upsert_message(&message).expect("insert message");
        let second = db.upsert_message(&message).expect("upsert message");
        assert_eq!(first, second);

        let messages = db
            .get_messages_by_thread("u-1", "t-1")
            .expect("load messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].external_id, "m-1");
        assert_eq!(messages[0].thread_id, thread_id);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn label_sets_suppress_duplicates() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        db.upsert_user(&sample_user()).expect("upsert user");
        let thread_id = db
            .upsert_thread(&sample_thread("t-1", "2026-02-01T12:00:00Z"))
            .expect("insert thread");

        db.add_thread_labels(thread_id, &["FYI".to_string(), "TO_RESPOND".to_string()])
            .expect("add labels");
        db.add_thread_labels(thread_id, &["FYI".to_string()])
            .expect("re-add label");

        let labels = db.get_thread_labels(thread_id).expect("get labels");
        assert_eq!(labels, vec!["FYI".to_string(), "TO_RESPOND".to_string()]);

        db.replace_thread_labels(thread_id, &["ACTIONED".to_string()])
            .expect("replace labels");
        let labels = db.get_thread_labels(thread_id).expect("get labels");
        assert_eq!(labels, vec!["ACTIONED".to_string()]);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn cursor_columns_update_independently() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        db.upsert_user(&sample_user()).expect("upsert user");

        db.set_gmail_history_id("u-1", "99001").expect("set cursor");
        db.touch_last_sync("u-1").expect("touch last sync");

        let user = db
            .get_user_by_email("owner@example.com")
            .expect("get user")
            .expect("user exists");
        assert_eq!(user.gmail_history_id.as_deref(), Some("99001"));
        assert!(user.outlook_delta_token.is_none());
        assert!(user.last_sync_time.is_some());

        let _ = std::fs::remove_file(path);
    }
}
