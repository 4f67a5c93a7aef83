//! Chat storage: upsert, listing, targeted counter mutations.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use wabridge_core::error::BridgeError;
use wabridge_core::jid::Jid;
use wabridge_core::model::{Chat, ChatKind};

use super::db_err;

/// Repository for the `chats` table.
#[derive(Clone)]
pub struct ChatRepo {
    pool: SqlitePool,
}

impl ChatRepo {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Replace all fields of a chat row atomically, inserting if absent.
    pub async fn upsert(&self, chat: &Chat) -> Result<(), BridgeError> {
        let participants = serde_json::to_string(
            &chat
                .participants
                .iter()
                .map(|j| j.to_string())
                .collect::<Vec<_>>(),
        )
        .map_err(|e| BridgeError::Storage(format!("participants encode failed: {e}")))?;

        sqlx::query(
            "INSERT INTO chats (jid, kind, name, last_message_time, last_message_text, \
                                last_message_sender, unread_count, is_muted, is_archived, \
                                is_pinned, participants) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(jid) DO UPDATE SET \
                kind = excluded.kind, \
                name = excluded.name, \
                last_message_time = excluded.last_message_time, \
                last_message_text = excluded.last_message_text, \
                last_message_sender = excluded.last_message_sender, \
                unread_count = excluded.unread_count, \
                is_muted = excluded.is_muted, \
                is_archived = excluded.is_archived, \
                is_pinned = excluded.is_pinned, \
                participants = excluded.participants",
        )
        .bind(chat.jid.to_string())
        .bind(chat.kind.as_str())
        .bind(&chat.name)
        .bind(chat.last_message_time.map(|t| t.timestamp_millis()))
        .bind(&chat.last_message_text)
        .bind(chat.last_message_sender.as_ref().map(|j| j.to_string()))
        .bind(chat.unread_count)
        .bind(chat.is_muted)
        .bind(chat.is_archived)
        .bind(chat.is_pinned)
        .bind(participants)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Fetch one chat by JID.
    pub async fn get(&self, jid: &Jid) -> Result<Option<Chat>, BridgeError> {
        let row = sqlx::query("SELECT * FROM chats WHERE jid = ?")
            .bind(jid.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| chat_from_row(&r)).transpose()
    }

    /// Page through chats: pinned first, then most recent activity.
    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Chat>, BridgeError> {
        let rows = sqlx::query(
            "SELECT * FROM chats \
             ORDER BY is_pinned DESC, last_message_time DESC, jid ASC \
             LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(chat_from_row).collect()
    }

    /// Advance the last-message summary fields.
    pub async fn update_last_message(
        &self,
        jid: &Jid,
        time: DateTime<Utc>,
        text: &str,
        sender: &Jid,
    ) -> Result<(), BridgeError> {
        sqlx::query(
            "UPDATE chats SET last_message_time = ?, last_message_text = ?, last_message_sender = ? \
             WHERE jid = ?",
        )
        .bind(time.timestamp_millis())
        .bind(text)
        .bind(sender.to_string())
        .bind(jid.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Set the unread counter to an absolute value.
    pub async fn update_unread_count(&self, jid: &Jid, count: i64) -> Result<(), BridgeError> {
        sqlx::query("UPDATE chats SET unread_count = ? WHERE jid = ?")
            .bind(count)
            .bind(jid.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Atomic server-side increment. Never read-modify-write from the
    /// client: concurrent ingest would lose updates.
    pub async fn increment_unread_count(&self, jid: &Jid) -> Result<(), BridgeError> {
        sqlx::query("UPDATE chats SET unread_count = unread_count + 1 WHERE jid = ?")
            .bind(jid.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

/// Insert a bare chat row for a JID if none exists yet. Runs inside the
/// ingest transaction: chats are created lazily on first observed message.
pub(super) async fn ensure_chat_row(
    conn: &mut SqliteConnection,
    jid: &Jid,
) -> Result<(), BridgeError> {
    sqlx::query(
        "INSERT INTO chats (jid, kind) VALUES (?, ?) ON CONFLICT(jid) DO NOTHING",
    )
    .bind(jid.to_string())
    .bind(ChatKind::of(jid).as_str())
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Decode a full chat row.
pub(super) fn chat_from_row(row: &SqliteRow) -> Result<Chat, BridgeError> {
    let corrupt = |what: &str| BridgeError::Storage(format!("corrupt chat row: {what}"));

    let jid: String = row.try_get("jid").map_err(db_err)?;
    let kind: String = row.try_get("kind").map_err(db_err)?;
    let participants_json: String = row.try_get("participants").map_err(db_err)?;
    let participants: Vec<String> = serde_json::from_str(&participants_json)
        .map_err(|_| corrupt("participants"))?;

    let last_message_sender = row
        .try_get::<Option<String>, _>("last_message_sender")
        .map_err(db_err)?
        .map(|s| s.parse().map_err(|_| corrupt("last message sender")))
        .transpose()?;

    Ok(Chat {
        jid: jid.parse().map_err(|_| corrupt("jid"))?,
        kind: ChatKind::parse(&kind).ok_or_else(|| corrupt("kind"))?,
        name: row.try_get("name").map_err(db_err)?,
        last_message_time: row
            .try_get::<Option<i64>, _>("last_message_time")
            .map_err(db_err)?
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        last_message_text: row.try_get("last_message_text").map_err(db_err)?,
        last_message_sender,
        unread_count: row.try_get("unread_count").map_err(db_err)?,
        is_muted: row.try_get("is_muted").map_err(db_err)?,
        is_archived: row.try_get("is_archived").map_err(db_err)?,
        is_pinned: row.try_get("is_pinned").map_err(db_err)?,
        participants: participants
            .into_iter()
            .map(|s| s.parse().map_err(|_| corrupt("participant jid")))
            .collect::<Result<Vec<Jid>, _>>()?,
    })
}
