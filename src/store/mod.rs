//! Durable per-bot message store: SQLite + an FTS5 full-text index kept
//! coherent via triggers. Grounded in the external-content FTS5 pattern in
//! `ConaryLabs-Mira`'s `db/schema/fts.rs` and the message schema shape in
//! `Humans-Not-Required-local-agent-chat`'s `db.rs`, adapted from rusqlite to
//! the sqlx async pool idiom this crate uses throughout.

use crate::error::{Result, StoreError};
use crate::model::{Message, MessageRef, SearchOptions};
use crate::{ChannelId, MessageId};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tokio::sync::Mutex;

/// Durable store for messages in one bot's channels, backed by a single
/// SQLite file with an external-content FTS5 index.
///
/// All mutating operations are serialized through `writer` (spec's "one
/// writer task per MessageStore"); reads run concurrently against the pool.
pub struct MessageStore {
    pool: SqlitePool,
    writer: Mutex<()>,
}

impl MessageStore {
    /// Open (creating if absent) the message store at `path`, running
    /// migrations idempotently.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await
            .map_err(StoreError::Connect)?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await
            .map_err(StoreError::Connect)?;

        let store = Self {
            pool,
            writer: Mutex::new(()),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                server_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                author_display_name TEXT NOT NULL,
                text TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                is_bot INTEGER NOT NULL,
                reply_to_message_id TEXT,
                attachments TEXT NOT NULL DEFAULT '[]',
                reactions TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_channel_ts ON messages(channel_id, timestamp)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
                text,
                content='messages',
                content_rowid='rowid',
                tokenize='porter unicode61 remove_diacritics 1'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
                INSERT INTO messages_fts(rowid, text) VALUES (new.rowid, new.text);
            END
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
                INSERT INTO messages_fts(messages_fts, rowid, text) VALUES ('delete', old.rowid, old.text);
            END
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS messages_au AFTER UPDATE ON messages BEGIN
                INSERT INTO messages_fts(messages_fts, rowid, text) VALUES ('delete', old.rowid, old.text);
                INSERT INTO messages_fts(rowid, text) VALUES (new.rowid, new.text);
            END
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        Ok(())
    }

    /// UPSERT: if `m.message_id` already exists, the row and its FTS entry
    /// are replaced atomically via the update trigger.
    pub async fn put(&self, m: &Message) -> Result<()> {
        let _guard = self.writer.lock().await;
        let attachments = serde_json::to_string(&m.attachments)?;
        let reactions = serde_json::to_string(&m.reactions)?;

        sqlx::query(
            r#"
            INSERT INTO messages
                (message_id, channel_id, server_id, author_id, author_display_name,
                 text, timestamp, is_bot, reply_to_message_id, attachments, reactions)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(message_id) DO UPDATE SET
                channel_id = excluded.channel_id,
                server_id = excluded.server_id,
                author_id = excluded.author_id,
                author_display_name = excluded.author_display_name,
                text = excluded.text,
                timestamp = excluded.timestamp,
                is_bot = excluded.is_bot,
                reply_to_message_id = excluded.reply_to_message_id,
                attachments = excluded.attachments,
                reactions = excluded.reactions
            "#,
        )
        .bind(m.message_id.as_ref())
        .bind(m.channel_id.as_ref())
        .bind(m.server_id.as_ref())
        .bind(m.author_id.as_ref())
        .bind(&m.author_display_name)
        .bind(&m.text)
        .bind(m.timestamp)
        .bind(m.is_bot as i64)
        .bind(m.reply_to_message_id.as_ref().map(|id| id.as_ref()))
        .bind(attachments)
        .bind(reactions)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    /// Idempotent: removing an absent row is not an error.
    pub async fn delete(&self, message_id: &MessageId) -> Result<()> {
        let _guard = self.writer.lock().await;
        sqlx::query("DELETE FROM messages WHERE message_id = ?")
            .bind(message_id.as_ref())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    /// Idempotent bulk UPSERT, used to seed history on connect.
    pub async fn backfill(&self, messages: &[Message]) -> Result<()> {
        for m in messages {
            self.put(m).await?;
        }
        Ok(())
    }

    /// Newest-first.
    pub async fn get_recent(&self, channel_id: &ChannelId, limit: i64) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE channel_id = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(channel_id.as_ref())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter().map(row_to_message).collect()
    }

    /// Oldest-first.
    pub async fn get_first(&self, channel_id: &ChannelId, limit: i64) -> Result<Vec<Message>> {
        let rows =
            sqlx::query("SELECT * FROM messages WHERE channel_id = ? ORDER BY timestamp ASC LIMIT ?")
                .bind(channel_id.as_ref())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter().map(row_to_message).collect()
    }

    /// `span` messages before and after `message_id`, chronological.
    pub async fn get_around(&self, message_id: &MessageId, span: i64) -> Result<Vec<Message>> {
        let anchor = sqlx::query("SELECT channel_id, timestamp FROM messages WHERE message_id = ?")
            .bind(message_id.as_ref())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let Some(anchor) = anchor else {
            return Ok(Vec::new());
        };
        let channel_id: String = anchor.try_get("channel_id").map_err(|e| StoreError::Query(e.to_string()))?;
        let timestamp: i64 = anchor.try_get("timestamp").map_err(|e| StoreError::Query(e.to_string()))?;

        let before = sqlx::query(
            "SELECT * FROM messages WHERE channel_id = ? AND timestamp < ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(&channel_id)
        .bind(timestamp)
        .bind(span)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        let at_and_after = sqlx::query(
            "SELECT * FROM messages WHERE channel_id = ? AND timestamp >= ? ORDER BY timestamp ASC LIMIT ?",
        )
        .bind(&channel_id)
        .bind(timestamp)
        .bind(span + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut out: Vec<Message> = before.iter().rev().map(row_to_message).collect::<Result<_>>()?;
        out.extend(at_and_after.iter().map(row_to_message).collect::<Result<Vec<_>>>()?);
        Ok(out)
    }

    /// Chronological, inclusive of both endpoints.
    pub async fn get_range(&self, from_id: &MessageId, to_id: &MessageId) -> Result<Vec<Message>> {
        let bounds = sqlx::query(
            r#"
            SELECT
                (SELECT timestamp FROM messages WHERE message_id = ?) AS from_ts,
                (SELECT timestamp FROM messages WHERE message_id = ?) AS to_ts,
                (SELECT channel_id FROM messages WHERE message_id = ?) AS channel_id
            "#,
        )
        .bind(from_id.as_ref())
        .bind(to_id.as_ref())
        .bind(from_id.as_ref())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        let from_ts: Option<i64> = bounds.try_get("from_ts").ok();
        let to_ts: Option<i64> = bounds.try_get("to_ts").ok();
        let channel_id: Option<String> = bounds.try_get("channel_id").ok();

        let (Some(from_ts), Some(to_ts), Some(channel_id)) = (from_ts, to_ts, channel_id) else {
            return Ok(Vec::new());
        };
        let (lo, hi) = if from_ts <= to_ts { (from_ts, to_ts) } else { (to_ts, from_ts) };

        let rows = sqlx::query(
            "SELECT * FROM messages WHERE channel_id = ? AND timestamp BETWEEN ? AND ? ORDER BY timestamp ASC",
        )
        .bind(channel_id)
        .bind(lo)
        .bind(hi)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter().map(row_to_message).collect()
    }

    /// Returns references only (no text); callers fetch text via
    /// `get_around`/`get_range` to bound token usage downstream.
    pub async fn search(&self, opts: &SearchOptions) -> Result<Vec<MessageRef>> {
        let mut sql = String::from(
            "SELECT m.message_id, m.channel_id, m.author_id, m.author_display_name, m.timestamp \
             FROM messages_fts f JOIN messages m ON m.rowid = f.rowid \
             WHERE messages_fts MATCH ?",
        );
        if opts.channel_id.is_some() {
            sql.push_str(" AND m.channel_id = ?");
        }
        if opts.server_id.is_some() {
            sql.push_str(" AND m.server_id = ?");
        }
        if opts.author_id.is_some() {
            sql.push_str(" AND m.author_id = ?");
        }
        if opts.since.is_some() {
            sql.push_str(" AND m.timestamp >= ?");
        }
        if opts.until.is_some() {
            sql.push_str(" AND m.timestamp <= ?");
        }
        sql.push_str(" ORDER BY m.timestamp DESC LIMIT ?");

        let mut query = sqlx::query(&sql).bind(fts_query(&opts.query));
        if let Some(c) = &opts.channel_id {
            query = query.bind(c.as_ref());
        }
        if let Some(s) = &opts.server_id {
            query = query.bind(s.as_ref());
        }
        if let Some(a) = &opts.author_id {
            query = query.bind(a.as_ref());
        }
        if let Some(since) = opts.since {
            query = query.bind(since);
        }
        if let Some(until) = opts.until {
            query = query.bind(until);
        }
        let limit = if opts.limit == 0 { 50 } else { opts.limit as i64 };
        query = query.bind(limit);

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            match row_to_message_ref(row) {
                Ok(m) => out.push(m),
                Err(_) => {
                    let message_id: String = row.try_get("message_id").unwrap_or_default();
                    tracing::warn!(message_id = %message_id, "FTS row desynced from messages table, skipping");
                }
            }
        }
        Ok(out)
    }
}

/// Quote free-text tokens conjunctively; callers may still pass an explicit
/// phrase in quotes, which is forwarded unmodified.
fn fts_query(raw: &str) -> String {
    if raw.contains('"') {
        return raw.to_string();
    }
    raw.split_whitespace()
        .map(|tok| format!("\"{}\"", tok.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" ")
}

fn row_to_message(row: &SqliteRow) -> Result<Message> {
    let attachments_raw: String = row.try_get("attachments").map_err(|e| StoreError::Query(e.to_string()))?;
    let reactions_raw: String = row.try_get("reactions").map_err(|e| StoreError::Query(e.to_string()))?;
    let reply_to: Option<String> = row.try_get("reply_to_message_id").ok();

    Ok(Message {
        message_id: row.try_get::<String, _>("message_id").map_err(|e| StoreError::Query(e.to_string()))?.into(),
        channel_id: row.try_get::<String, _>("channel_id").map_err(|e| StoreError::Query(e.to_string()))?.into(),
        server_id: row.try_get::<String, _>("server_id").map_err(|e| StoreError::Query(e.to_string()))?.into(),
        author_id: row.try_get::<String, _>("author_id").map_err(|e| StoreError::Query(e.to_string()))?.into(),
        author_display_name: row.try_get("author_display_name").map_err(|e| StoreError::Query(e.to_string()))?,
        text: row.try_get("text").map_err(|e| StoreError::Query(e.to_string()))?,
        timestamp: row.try_get("timestamp").map_err(|e| StoreError::Query(e.to_string()))?,
        is_bot: row.try_get::<i64, _>("is_bot").map_err(|e| StoreError::Query(e.to_string()))? != 0,
        reply_to_message_id: reply_to.map(Into::into),
        attachments: serde_json::from_str(&attachments_raw).unwrap_or_default(),
        reactions: serde_json::from_str(&reactions_raw).unwrap_or_default(),
    })
}

fn row_to_message_ref(row: &SqliteRow) -> Result<MessageRef> {
    Ok(MessageRef {
        message_id: row.try_get::<String, _>("message_id").map_err(|e| StoreError::Query(e.to_string()))?.into(),
        channel_id: row.try_get::<String, _>("channel_id").map_err(|e| StoreError::Query(e.to_string()))?.into(),
        author_id: row.try_get::<String, _>("author_id").map_err(|e| StoreError::Query(e.to_string()))?.into(),
        author_display_name: row.try_get("author_display_name").map_err(|e| StoreError::Query(e.to_string()))?,
        timestamp: row.try_get("timestamp").map_err(|e| StoreError::Query(e.to_string()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attachment, Reaction};

    fn sample(id: &str, channel: &str, text: &str, ts: i64) -> Message {
        Message {
            message_id: id.into(),
            channel_id: channel.into(),
            server_id: "server-1".into(),
            author_id: "user-1".into(),
            author_display_name: "Alice".into(),
            text: text.into(),
            timestamp: ts,
            is_bot: false,
            reply_to_message_id: None,
            attachments: Vec::<Attachment>::new(),
            reactions: Vec::<Reaction>::new(),
        }
    }

    async fn open_tmp() -> (MessageStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_messages.db");
        let store = MessageStore::open(&path).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn put_then_search_finds_the_message() {
        let (store, _dir) = open_tmp().await;
        store.put(&sample("m1", "c1", "the secret code is ALPHA", 1000)).await.unwrap();

        let refs = store
            .search(&SearchOptions {
                query: "ALPHA".into(),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].message_id.as_ref(), "m1");
    }

    #[tokio::test]
    async fn edit_via_put_updates_search_results() {
        let (store, _dir) = open_tmp().await;
        store.put(&sample("m1", "c1", "the secret code is ALPHA", 1000)).await.unwrap();
        store.put(&sample("m1", "c1", "the secret code is BRAVO", 1000)).await.unwrap();

        let bravo = store
            .search(&SearchOptions { query: "BRAVO".into(), limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(bravo.len(), 1);

        let alpha = store
            .search(&SearchOptions { query: "ALPHA".into(), limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert!(alpha.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_from_search() {
        let (store, _dir) = open_tmp().await;
        store.put(&sample("m1", "c1", "hello world", 1000)).await.unwrap();
        store.delete(&"m1".into()).await.unwrap();

        let refs = store
            .search(&SearchOptions { query: "hello".into(), limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert!(refs.is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (store, _dir) = open_tmp().await;
        store.delete(&"nonexistent".into()).await.unwrap();
        store.delete(&"nonexistent".into()).await.unwrap();
    }

    #[tokio::test]
    async fn get_recent_is_newest_first() {
        let (store, _dir) = open_tmp().await;
        store.put(&sample("m1", "c1", "first", 1000)).await.unwrap();
        store.put(&sample("m2", "c1", "second", 2000)).await.unwrap();

        let recent = store.get_recent(&"c1".into(), 10).await.unwrap();
        assert_eq!(recent[0].message_id.as_ref(), "m2");
        assert_eq!(recent[1].message_id.as_ref(), "m1");
    }

    #[tokio::test]
    async fn backfill_twice_is_equivalent_to_once() {
        let (store, _dir) = open_tmp().await;
        let msgs = vec![sample("m1", "c1", "a", 1000), sample("m2", "c1", "b", 2000)];
        store.backfill(&msgs).await.unwrap();
        store.backfill(&msgs).await.unwrap();

        let recent = store.get_recent(&"c1".into(), 10).await.unwrap();
        assert_eq!(recent.len(), 2);
    }
}
