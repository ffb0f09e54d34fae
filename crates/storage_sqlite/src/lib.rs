mod conversations;
mod error;
mod profiles;

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

pub use error::{Result, StorageError};

pub const CURRENT_DB_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_PAGE_SIZE: u32 = 50;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS profiles (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        api_endpoint TEXT NOT NULL,
        model_name TEXT NOT NULL,
        temperature REAL NOT NULL,
        max_tokens INTEGER NOT NULL,
        top_p REAL NOT NULL,
        frequency_penalty REAL NOT NULL,
        presence_penalty REAL NOT NULL,
        is_default INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_profiles_single_default
        ON profiles(is_default) WHERE is_default = 1
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY NOT NULL,
        title TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        profile_id TEXT,
        FOREIGN KEY(profile_id) REFERENCES profiles(id)
            ON UPDATE CASCADE ON DELETE SET NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_conversations_updated_at
        ON conversations(updated_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY NOT NULL,
        conversation_id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        FOREIGN KEY(conversation_id) REFERENCES conversations(id)
            ON UPDATE CASCADE ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_messages_conversation_id
        ON messages(conversation_id)
    "#,
];

/// Relational store for profiles, conversations and messages.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                StorageError::Unavailable(format!(
                    "failed to create {}: {err}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        info!(path = %path.display(), "opened conversation store");
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // A single connection that never expires keeps the in-memory database alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> Result<()> {
        for sql in MIGRATIONS {
            sqlx::query(sql).execute(&self.pool).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO metadata(key, value)
            VALUES ('schema_version', ?1)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(CURRENT_DB_SCHEMA_VERSION.to_string())
        .execute(&self.pool)
        .await?;

        debug!(version = CURRENT_DB_SCHEMA_VERSION, "schema migrated");
        Ok(())
    }

    pub async fn schema_version(&self) -> Result<u32> {
        let row = sqlx::query("SELECT value FROM metadata WHERE key = 'schema_version'")
            .fetch_one(&self.pool)
            .await?;
        let raw: String = row.try_get("value")?;
        raw.parse::<u32>()
            .map_err(|err| StorageError::Unavailable(format!("corrupt schema version: {err}")))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| StorageError::Unavailable(format!("corrupt timestamp `{value}`: {err}")))
}

pub(crate) fn parse_id(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|err| StorageError::Unavailable(format!("corrupt id `{value}`: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrates_fresh_database() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let version = storage.schema_version().await.expect("schema version");
        assert_eq!(version, CURRENT_DB_SCHEMA_VERSION);
        assert_eq!(storage.count_conversations().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn reopens_file_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("murmur.db");
        {
            let storage = SqliteStorage::connect(&path).await.expect("connect");
            storage
                .create_conversation("kept", None)
                .await
                .expect("create");
            storage.close().await;
        }
        let reopened = SqliteStorage::connect(&path).await.expect("reopen");
        assert_eq!(reopened.count_conversations().await.expect("count"), 1);
    }

    #[test]
    fn timestamps_sort_as_text() {
        let earlier = DateTime::parse_from_rfc3339("2024-01-01T00:00:05Z")
            .expect("parse")
            .with_timezone(&Utc);
        let later = DateTime::parse_from_rfc3339("2024-01-01T00:00:05.000001Z")
            .expect("parse")
            .with_timezone(&Utc);
        assert!(format_timestamp(&earlier) < format_timestamp(&later));
        assert_eq!(
            parse_timestamp(&format_timestamp(&later)).expect("roundtrip"),
            later
        );
    }
}
