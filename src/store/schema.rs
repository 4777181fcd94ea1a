use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// Bump when the mailbox cache layout changes incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Create or upgrade the mailbox cache layout. The version marker lives in
/// `sync_state` next to the per-account cursors, so that table exists before
/// anything reads it.
pub fn prepare(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
    )
    .context("ensure sync_state table")?;

    let found = stored_version(conn)?;
    if found > SCHEMA_VERSION {
        return Err(anyhow!(
            "mailbox cache is at schema version {found}, this build supports up to {SCHEMA_VERSION}"
        ));
    }
    if found < SCHEMA_VERSION {
        create_mailbox_tables(conn).context("create mailbox cache tables")?;
        record_version(conn, SCHEMA_VERSION)?;
    }

    Ok(())
}

pub fn stored_version(conn: &Connection) -> Result<u32> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_state WHERE key = ?1 LIMIT 1",
            params![SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()
        .context("read stored schema version")?;

    match raw {
        None => Ok(0),
        Some(version) => version
            .parse::<u32>()
            .with_context(|| format!("invalid schema version in database: {version}")),
    }
}

fn record_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO sync_state (key, value, updated_at)
        VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at
        "#,
        params![SCHEMA_VERSION_KEY, version.to_string()],
    )
    .with_context(|| format!("record schema version {version}"))?;

    Ok(())
}

fn create_mailbox_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            provider TEXT NOT NULL CHECK(provider IN ('google', 'outlook')),
            access_token TEXT,
            refresh_token TEXT,
            gmail_history_id TEXT,
            outlook_delta_token TEXT,
            last_sync_time TEXT
        );

        CREATE TABLE IF NOT EXISTS threads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            external_id TEXT NOT NULL,
            subject TEXT,
            from_name TEXT,
            from_address TEXT,
            snippet TEXT,
            timestamp TEXT NOT NULL,
            is_read BOOLEAN NOT NULL DEFAULT false,
            is_important BOOLEAN NOT NULL DEFAULT false,
            has_attachments BOOLEAN NOT NULL DEFAULT false,
            is_labeled BOOLEAN NOT NULL DEFAULT false,
            UNIQUE(user_id, external_id)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            thread_id INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            external_id TEXT NOT NULL,
            thread_external_id TEXT NOT NULL,
            subject TEXT,
            from_name TEXT,
            from_address TEXT,
            to_address TEXT,
            timestamp TEXT NOT NULL,
            body_text TEXT,
            body_html TEXT,
            is_read BOOLEAN NOT NULL DEFAULT false,
            UNIQUE(user_id, external_id)
        );

        CREATE TABLE IF NOT EXISTS attachments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            external_id TEXT NOT NULL,
            filename TEXT,
            mime_type TEXT,
            size_bytes INTEGER,
            content_ref TEXT,
            is_inline BOOLEAN NOT NULL DEFAULT false,
            UNIQUE(user_id, external_id)
        );

        CREATE TABLE IF NOT EXISTS thread_labels (
            thread_id INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            label TEXT NOT NULL,
            UNIQUE(thread_id, label)
        );

        CREATE TABLE IF NOT EXISTS message_labels (
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            label TEXT NOT NULL,
            UNIQUE(message_id, label)
        );

        CREATE INDEX IF NOT EXISTS idx_threads_user_timestamp ON threads(user_id, timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_messages_thread_id ON messages(thread_id);
        CREATE INDEX IF NOT EXISTS idx_messages_thread_external_id ON messages(user_id, thread_external_id);
        CREATE INDEX IF NOT EXISTS idx_attachments_message_id ON attachments(message_id);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use anyhow::Result;
    use rusqlite::{params, Connection};
    use uuid::Uuid;

    use super::{prepare, stored_version, SCHEMA_VERSION};

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("zerohands-schema-{}.db", Uuid::new_v4()))
    }

    #[test]
    fn prepare_stamps_a_fresh_database() -> Result<()> {
        let db_path = temp_db_path();
        let conn = Connection::open(&db_path)?;

        prepare(&conn)?;
        assert_eq!(stored_version(&conn)?, SCHEMA_VERSION);
        conn.execute(
            "INSERT INTO threads (user_id, external_id, timestamp) VALUES ('u', 't', '2026-01-01T00:00:00Z')",
            [],
        )?;

        let _ = std::fs::remove_file(db_path);
        Ok(())
    }

    #[test]
    fn prepare_is_idempotent() -> Result<()> {
        let db_path = temp_db_path();
        let conn = Connection::open(&db_path)?;

        prepare(&conn)?;
        prepare(&conn)?;
        assert_eq!(stored_version(&conn)?, SCHEMA_VERSION);

        let _ = std::fs::remove_file(db_path);
        Ok(())
    }

    #[test]
    fn prepare_refuses_a_newer_database() -> Result<()> {
        let db_path = temp_db_path();
        let conn = Connection::open(&db_path)?;

        prepare(&conn)?;
        conn.execute(
            "UPDATE sync_state SET value = ?1 WHERE key = 'schema_version'",
            params![(SCHEMA_VERSION + 1).to_string()],
        )?;
        assert!(prepare(&conn).is_err());

        let _ = std::fs::remove_file(db_path);
        Ok(())
    }
}
