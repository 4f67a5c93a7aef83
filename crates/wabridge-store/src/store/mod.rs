//! SQLite-backed bridge store.
//!
//! Split into focused submodules:
//! - `messages` — MessageRepo: insert, dedup, paging, read status, search
//! - `chats` — ChatRepo: upsert, listing, targeted counter mutations
//!
//! The [`Store`] itself owns the pool and the multi-row transactions that
//! keep chat rows consistent with their messages (ingest, mark-read,
//! reaction replacement, cascading delete).

mod chats;
mod messages;

pub use chats::ChatRepo;
pub use messages::MessageRepo;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use wabridge_core::error::BridgeError;
use wabridge_core::jid::Jid;
use wabridge_core::model::{Message, MessageKind};
use wabridge_core::shellexpand;

/// Persistent bridge store backed by SQLite (WAL journal).
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

pub(crate) fn db_err(e: sqlx::Error) -> BridgeError {
    BridgeError::Storage(e.to_string())
}

impl Store {
    /// Open the database, running migrations on first use.
    pub async fn open(db_path: &str) -> Result<Self, BridgeError> {
        let db_path = shellexpand(db_path);

        if let Some(parent) = std::path::Path::new(&db_path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BridgeError::Storage(format!("failed to create data dir: {e}")))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))
            .map_err(|e| BridgeError::Storage(format!("invalid db path: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| BridgeError::Storage(format!("failed to connect to sqlite: {e}")))?;

        Self::run_migrations(&pool).await?;

        info!("bridge store initialized at {db_path}");

        Ok(Self { pool })
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self, BridgeError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| BridgeError::Storage(format!("invalid db options: {e}")))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(|e| BridgeError::Storage(format!("failed to connect to sqlite: {e}")))?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Message repository handle.
    pub fn messages(&self) -> MessageRepo {
        MessageRepo::new(self.pool.clone())
    }

    /// Chat repository handle.
    pub fn chats(&self) -> ChatRepo {
        ChatRepo::new(self.pool.clone())
    }

    /// Close the pool, flushing WAL state.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run SQL migrations, tracking which have already been applied.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), BridgeError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| BridgeError::Storage(format!("failed to create migrations table: {e}")))?;

        let migrations: &[(&str, &str)] =
            &[("001_init", include_str!("../../migrations/001_init.sql"))];

        for (name, sql) in migrations {
            let applied: Option<(String,)> =
                sqlx::query_as("SELECT name FROM _migrations WHERE name = ?")
                    .bind(name)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| {
                        BridgeError::Storage(format!("failed to check migration {name}: {e}"))
                    })?;

            if applied.is_some() {
                continue;
            }

            sqlx::raw_sql(sql)
                .execute(pool)
                .await
                .map_err(|e| BridgeError::Storage(format!("migration {name} failed: {e}")))?;

            sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
                .bind(name)
                .execute(pool)
                .await
                .map_err(|e| {
                    BridgeError::Storage(format!("failed to record migration {name}: {e}"))
                })?;
        }
        Ok(())
    }
}

/// Transactional composites. These are the only paths that touch a chat row
/// and its messages together, so an external reader never sees one without
/// the other.
impl Store {
    /// Ingest a message idempotently.
    ///
    /// Inserts the row unless the id already exists, and only on a genuine
    /// insert updates the owning chat: last-message fields advance, and the
    /// unread counter increments for inbound unread messages. Returns whether
    /// the row was actually inserted; redeliveries return `false` and leave
    /// everything untouched.
    pub async fn ingest(&self, message: &Message) -> Result<bool, BridgeError> {
        let message = message.clone().normalize();

        if message.kind == MessageKind::Reaction {
            return self.ingest_reaction(&message).await;
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        chats::ensure_chat_row(&mut tx, &message.chat_jid).await?;

        let inserted = messages::insert_or_ignore(&mut tx, &message).await?;
        if !inserted {
            tx.commit().await.map_err(db_err)?;
            return Ok(false);
        }

        let ts = message.timestamp.timestamp_millis();
        sqlx::query(
            "UPDATE chats SET last_message_time = ?, last_message_text = ?, last_message_sender = ? \
             WHERE jid = ? AND (last_message_time IS NULL OR last_message_time <= ?)",
        )
        .bind(ts)
        .bind(preview_text(&message))
        .bind(message.sender_jid.to_string())
        .bind(message.chat_jid.to_string())
        .bind(ts)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if !message.is_from_me && !message.is_read {
            sqlx::query("UPDATE chats SET unread_count = unread_count + 1 WHERE jid = ?")
                .bind(message.chat_jid.to_string())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    /// Ingest a reaction, replacing any prior reaction from the same sender
    /// on the same target. An empty emoji clears the reaction and inserts
    /// nothing. Reaction rows are always stored read and never move the
    /// chat's last-message fields or unread counter.
    async fn ingest_reaction(&self, message: &Message) -> Result<bool, BridgeError> {
        let reaction = message.reaction.as_ref().ok_or_else(|| {
            BridgeError::InvalidArgument("reaction message without reaction payload".into())
        })?;
        if reaction.target_message_id == message.id {
            return Err(BridgeError::InvalidArgument(
                "reaction cannot target itself".into(),
            ));
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        chats::ensure_chat_row(&mut tx, &message.chat_jid).await?;

        // Dedup first: a redelivered reaction id must not delete-and-reinsert.
        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM messages WHERE id = ?")
            .bind(&message.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if exists.is_some() {
            tx.commit().await.map_err(db_err)?;
            return Ok(false);
        }

        sqlx::query(
            "DELETE FROM messages WHERE chat_jid = ? AND kind = 'reaction' \
             AND reaction_target_id = ? AND reaction_sender = ?",
        )
        .bind(message.chat_jid.to_string())
        .bind(&reaction.target_message_id)
        .bind(reaction.sender_jid.to_string())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let inserted = if reaction.emoji.is_empty() {
            false
        } else {
            let mut stored = message.clone();
            stored.is_read = true;
            messages::insert_or_ignore(&mut tx, &stored).await?
        };

        tx.commit().await.map_err(db_err)?;
        Ok(inserted)
    }

    /// Flip the given messages to read and recompute the chat's unread count
    /// from its rows. Returns the recomputed count.
    pub async fn mark_read(&self, chat_jid: &Jid, ids: &[String]) -> Result<i64, BridgeError> {
        if ids.is_empty() {
            return Err(BridgeError::InvalidArgument("no message ids given".into()));
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE messages SET is_read = 1 WHERE chat_jid = ? AND id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(chat_jid.to_string());
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&mut *tx).await.map_err(db_err)?;

        sqlx::query(
            "UPDATE chats SET unread_count = \
               (SELECT COUNT(*) FROM messages \
                WHERE chat_jid = ?1 AND is_from_me = 0 AND is_read = 0) \
             WHERE jid = ?1",
        )
        .bind(chat_jid.to_string())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let unread: Option<(i64,)> = sqlx::query_as("SELECT unread_count FROM chats WHERE jid = ?")
            .bind(chat_jid.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        unread
            .map(|(n,)| n)
            .ok_or_else(|| BridgeError::NotFound(format!("chat {chat_jid}")))
    }

    /// Administrative cascade delete: the chat row and all of its messages.
    /// Not reachable from any transport.
    pub async fn delete_chat(&self, chat_jid: &Jid) -> Result<(), BridgeError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM messages WHERE chat_jid = ?")
            .bind(chat_jid.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM chats WHERE jid = ?")
            .bind(chat_jid.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}

/// One-line summary shown on the chat row for its newest message.
fn preview_text(message: &Message) -> String {
    if !message.text.is_empty() {
        message.text.clone()
    } else if !message.caption.is_empty() {
        message.caption.clone()
    } else {
        format!("[{}]", message.kind.as_str())
    }
}

#[cfg(test)]
mod tests;
