//! Message storage: insert, dedup, paging, read status, substring search.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use wabridge_core::error::BridgeError;
use wabridge_core::jid::Jid;
use wabridge_core::model::{ContactCard, Location, Message, MessageKind, Reaction};

use super::db_err;

/// Repository for the `messages` table.
#[derive(Clone)]
pub struct MessageRepo {
    pool: SqlitePool,
}

impl MessageRepo {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a message, failing when the id already exists.
    pub async fn create(&self, message: &Message) -> Result<(), BridgeError> {
        let message = message.clone().normalize();
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        if insert_or_ignore(&mut conn, &message).await? {
            Ok(())
        } else {
            Err(BridgeError::InvalidArgument(format!(
                "duplicate message id '{}'",
                message.id
            )))
        }
    }

    /// Insert a message, silently skipping duplicates. This is the ingest hot
    /// path: the library may redeliver the same id across reconnects, and the
    /// second delivery must be a no-op. Returns whether a row was inserted.
    pub async fn create_or_ignore(&self, message: &Message) -> Result<bool, BridgeError> {
        let message = message.clone().normalize();
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        insert_or_ignore(&mut conn, &message).await
    }

    /// Fetch one message by id.
    pub async fn get(&self, id: &str) -> Result<Option<Message>, BridgeError> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| message_from_row(&r)).transpose()
    }

    /// Page through a chat's messages, newest first. Ties on the timestamp
    /// break on the id so pages are stable.
    pub async fn get_by_chat(
        &self,
        chat_jid: &Jid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, BridgeError> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE chat_jid = ? \
             ORDER BY timestamp DESC, id ASC LIMIT ? OFFSET ?",
        )
        .bind(chat_jid.to_string())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(message_from_row).collect()
    }

    /// Messages at or after `since`, oldest first.
    pub async fn get_by_chat_since(
        &self,
        chat_jid: &Jid,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Message>, BridgeError> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE chat_jid = ? AND timestamp >= ? \
             ORDER BY timestamp ASC, id ASC LIMIT ?",
        )
        .bind(chat_jid.to_string())
        .bind(since.timestamp_millis())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(message_from_row).collect()
    }

    /// Bulk read-status update. Returns the number of rows touched.
    pub async fn update_read_status(
        &self,
        ids: &[String],
        is_read: bool,
    ) -> Result<u64, BridgeError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("UPDATE messages SET is_read = ? WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql).bind(is_read);
        for id in ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await.map_err(db_err)?;
        Ok(result.rows_affected())
    }

    /// Substring search over text and caption, newest first. LIKE
    /// metacharacters in the query are escaped so `%` and `_` match
    /// literally.
    pub async fn search(&self, query: &str, limit: i64) -> Result<Vec<Message>, BridgeError> {
        let pattern = format!("%{}%", escape_like(query));
        let rows = sqlx::query(
            "SELECT * FROM messages \
             WHERE text LIKE ?1 ESCAPE '\\' OR caption LIKE ?1 ESCAPE '\\' \
             ORDER BY timestamp DESC, id ASC LIMIT ?2",
        )
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(message_from_row).collect()
    }
}

/// Escape `%`, `_`, and the escape character itself for a LIKE pattern.
pub(super) fn escape_like(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Shared INSERT OR IGNORE used by the repo and the ingest transaction.
/// Returns whether a row was actually inserted.
pub(super) async fn insert_or_ignore(
    conn: &mut SqliteConnection,
    message: &Message,
) -> Result<bool, BridgeError> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO messages (
            id, chat_jid, sender_jid, kind, text, caption,
            media_url, media_mime_type, media_file_name, media_file_size,
            timestamp, is_from_me, is_read, quoted_message_id,
            reaction_target_id, reaction_emoji, reaction_sender,
            location_lat, location_lng, location_name, location_address,
            contact_name, contact_phone, contact_vcard
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&message.id)
    .bind(message.chat_jid.to_string())
    .bind(message.sender_jid.to_string())
    .bind(message.kind.as_str())
    .bind(&message.text)
    .bind(&message.caption)
    .bind(&message.media_url)
    .bind(&message.media_mime_type)
    .bind(&message.media_file_name)
    .bind(message.media_file_size)
    .bind(message.timestamp.timestamp_millis())
    .bind(message.is_from_me)
    .bind(message.is_read)
    .bind(&message.quoted_message_id)
    .bind(message.reaction.as_ref().map(|r| r.target_message_id.clone()))
    .bind(message.reaction.as_ref().map(|r| r.emoji.clone()))
    .bind(message.reaction.as_ref().map(|r| r.sender_jid.to_string()))
    .bind(message.location.as_ref().map(|l| l.latitude))
    .bind(message.location.as_ref().map(|l| l.longitude))
    .bind(message.location.as_ref().and_then(|l| l.name.clone()))
    .bind(message.location.as_ref().and_then(|l| l.address.clone()))
    .bind(message.contact_card.as_ref().map(|c| c.name.clone()))
    .bind(message.contact_card.as_ref().and_then(|c| c.phone.clone()))
    .bind(message.contact_card.as_ref().and_then(|c| c.vcard.clone()))
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    Ok(result.rows_affected() > 0)
}

/// Decode a full message row.
pub(super) fn message_from_row(row: &SqliteRow) -> Result<Message, BridgeError> {
    let corrupt = |what: &str| BridgeError::Storage(format!("corrupt message row: {what}"));

    let chat_jid: String = row.try_get("chat_jid").map_err(db_err)?;
    let sender_jid: String = row.try_get("sender_jid").map_err(db_err)?;
    let kind: String = row.try_get("kind").map_err(db_err)?;
    let ts: i64 = row.try_get("timestamp").map_err(db_err)?;

    let reaction = match (
        row.try_get::<Option<String>, _>("reaction_target_id")
            .map_err(db_err)?,
        row.try_get::<Option<String>, _>("reaction_emoji")
            .map_err(db_err)?,
        row.try_get::<Option<String>, _>("reaction_sender")
            .map_err(db_err)?,
    ) {
        (Some(target), Some(emoji), Some(sender)) => Some(Reaction {
            target_message_id: target,
            emoji,
            sender_jid: sender.parse().map_err(|_| corrupt("reaction sender"))?,
        }),
        _ => None,
    };

    let location = match (
        row.try_get::<Option<f64>, _>("location_lat").map_err(db_err)?,
        row.try_get::<Option<f64>, _>("location_lng").map_err(db_err)?,
    ) {
        (Some(latitude), Some(longitude)) => Some(Location {
            latitude,
            longitude,
            name: row.try_get("location_name").map_err(db_err)?,
            address: row.try_get("location_address").map_err(db_err)?,
        }),
        _ => None,
    };

    let contact_card = row
        .try_get::<Option<String>, _>("contact_name")
        .map_err(db_err)?
        .map(|name| -> Result<ContactCard, BridgeError> {
            Ok(ContactCard {
                name,
                phone: row.try_get("contact_phone").map_err(db_err)?,
                vcard: row.try_get("contact_vcard").map_err(db_err)?,
            })
        })
        .transpose()?;

    Ok(Message {
        id: row.try_get("id").map_err(db_err)?,
        chat_jid: chat_jid.parse().map_err(|_| corrupt("chat jid"))?,
        sender_jid: sender_jid.parse().map_err(|_| corrupt("sender jid"))?,
        kind: MessageKind::parse(&kind).ok_or_else(|| corrupt("kind"))?,
        text: row.try_get("text").map_err(db_err)?,
        caption: row.try_get("caption").map_err(db_err)?,
        media_url: row.try_get("media_url").map_err(db_err)?,
        media_mime_type: row.try_get("media_mime_type").map_err(db_err)?,
        media_file_name: row.try_get("media_file_name").map_err(db_err)?,
        media_file_size: row.try_get("media_file_size").map_err(db_err)?,
        timestamp: DateTime::<Utc>::from_timestamp_millis(ts).ok_or_else(|| corrupt("timestamp"))?,
        is_from_me: row.try_get("is_from_me").map_err(db_err)?,
        is_read: row.try_get("is_read").map_err(db_err)?,
        quoted_message_id: row.try_get("quoted_message_id").map_err(db_err)?,
        reaction,
        location,
        contact_card,
    })
}
