//! Data Access Layer
//!
//! Postgres-backed [`ChatStore`]. Each chat is one row keyed by `(user_id, id)` with its
//! transcript stored as JSONB, so persisting a turn is a single upsert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::error::PersistenceError;
use parley_core::{ChatRecord, ChatStore, Message};
use sqlx::{FromRow, PgPool, types::Json};

const SELECT_CHAT: &str =
    "SELECT id, user_id, title, created_at, path, share_path, messages FROM chats";

#[derive(FromRow)]
struct ChatRow {
    id: String,
    user_id: String,
    title: String,
    created_at: DateTime<Utc>,
    path: String,
    share_path: Option<String>,
    messages: Json<Vec<Message>>,
}

impl From<ChatRow> for ChatRecord {
    fn from(row: ChatRow) -> Self {
        ChatRecord {
            id: row.id,
            title: row.title,
            user_id: row.user_id,
            created_at: row.created_at,
            messages: row.messages.0,
            path: row.path,
            share_path: row.share_path,
        }
    }
}

fn unavailable(err: sqlx::Error) -> PersistenceError {
    PersistenceError::Unavailable(err.to_string())
}

/// A wrapper around the `PgPool` implementing the chat store.
#[derive(Clone)]
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn put(&self, record: ChatRecord) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO chats (id, user_id, title, created_at, path, share_path, messages)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id, id) DO UPDATE
            SET title = EXCLUDED.title,
                path = EXCLUDED.path,
                share_path = EXCLUDED.share_path,
                messages = EXCLUDED.messages
            "#,
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.title)
        .bind(record.created_at)
        .bind(&record.path)
        .bind(&record.share_path)
        .bind(Json(&record.messages))
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn get(
        &self,
        user_id: &str,
        chat_id: &str,
    ) -> Result<Option<ChatRecord>, PersistenceError> {
        let row = sqlx::query_as::<_, ChatRow>(&format!(
            "{SELECT_CHAT} WHERE user_id = $1 AND id = $2"
        ))
        .bind(user_id)
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(row.map(ChatRecord::from))
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ChatRecord>, PersistenceError> {
        let rows = sqlx::query_as::<_, ChatRow>(&format!(
            "{SELECT_CHAT} WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(rows.into_iter().map(ChatRecord::from).collect())
    }

    async fn get_shared(&self, chat_id: &str) -> Result<Option<ChatRecord>, PersistenceError> {
        let row = sqlx::query_as::<_, ChatRow>(&format!(
            "{SELECT_CHAT} WHERE id = $1 AND share_path IS NOT NULL LIMIT 1"
        ))
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(row.map(ChatRecord::from))
    }
}
