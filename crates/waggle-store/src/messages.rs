//! Message store service: all operations are scoped by user id and return
//! domain records with direction derivable from the owning user's JID.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{json, Value};

use waggle_schema::{jid, ConversationStats, Message, MessageCreate, MessageDirection, MessageType};

use crate::store::{decode_ts, encode_ts, get_or_create_main_session, query_user_by_id, Store};

/// JID used on the service side when the caller does not supply explicit
/// sender/recipient JIDs.
const SERVICE_JID: &str = "service@s.whatsapp.net";

const MESSAGE_COLUMNS: &str = "id, user_id, session_id, sender_jid, recipient_jid, timestamp, \
     message_type, content, caption, reply_to_id, media_metadata";

impl Store {
    /// Store a message for a user, attaching it to the connected main
    /// session (created when absent). The timestamp is authoritative and
    /// set here.
    pub async fn store_message(&self, user_id: i64, create: MessageCreate) -> Result<Message> {
        self.call(move |conn| {
            let user = query_user_by_id(conn, user_id)?
                .ok_or_else(|| anyhow!("user {user_id} not found"))?;
            let session = get_or_create_main_session(conn, user_id)?;
            let user_jid = jid(&user.phone_number);

            let (sender_jid, recipient_jid) = match (create.sender_jid, create.recipient_jid) {
                (Some(sender), Some(recipient)) => (sender, recipient),
                _ => match create.direction {
                    MessageDirection::Incoming => (user_jid, SERVICE_JID.to_string()),
                    MessageDirection::Outgoing => (SERVICE_JID.to_string(), user_jid),
                    MessageDirection::System => ("system".to_string(), "system".to_string()),
                },
            };

            let mut metadata = create.metadata.unwrap_or(Value::Null);
            if let Some(wamid) = create.whatsapp_message_id {
                if !metadata.is_object() {
                    metadata = json!({});
                }
                metadata["whatsapp_message_id"] = Value::String(wamid);
            }
            let metadata_text = match &metadata {
                Value::Null => None,
                other => Some(other.to_string()),
            };

            conn.execute(
                "INSERT INTO messages (user_id, session_id, sender_jid, recipient_jid, timestamp,
                                       message_type, content, caption, reply_to_id, media_metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    user_id,
                    session.id,
                    sender_jid,
                    recipient_jid,
                    encode_ts(Utc::now()),
                    create.message_type.as_str(),
                    create.content,
                    create.caption,
                    create.reply_to_id,
                    metadata_text,
                ],
            )?;
            let id = conn.last_insert_rowid();
            query_message_by_id(conn, id)?.ok_or_else(|| anyhow!("message {id} vanished after insert"))
        })
        .await
    }

    /// The `count` most recent messages for a user, newest first.
    pub async fn get_recent_messages(&self, user_id: i64, count: usize) -> Result<Vec<Message>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE user_id = ?1
                 ORDER BY timestamp DESC
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![user_id, count as i64], row_to_message)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Case-insensitive substring search over content and caption, newest
    /// first. An empty query returns nothing.
    pub async fn search_messages(
        &self,
        user_id: i64,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Message>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let pattern = format!("%{query}%");
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE user_id = ?1
                   AND (content LIKE ?2 OR caption LIKE ?2)
                 ORDER BY timestamp DESC
                 LIMIT ?3"
            ))?;
            let rows = stmt.query_map(params![user_id, pattern, limit as i64], row_to_message)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Messages with `start <= timestamp <= end`, newest first.
    pub async fn get_messages_by_date_range(
        &self,
        user_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE user_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3
                 ORDER BY timestamp DESC
                 LIMIT ?4"
            ))?;
            let rows = stmt.query_map(
                params![user_id, encode_ts(start), encode_ts(end), limit as i64],
                row_to_message,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Aggregate statistics over a user's history. Sent counts messages
    /// whose sender is the user's JID; received counts messages addressed
    /// to it. With no messages every number is zero and dates are null.
    pub async fn get_conversation_stats(&self, user_id: i64) -> Result<ConversationStats> {
        self.call(move |conn| {
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE user_id = ?1",
                [user_id],
                |r| r.get(0),
            )?;
            if total == 0 {
                return Ok(ConversationStats::empty());
            }

            let user = match query_user_by_id(conn, user_id)? {
                Some(user) => user,
                None => return Ok(ConversationStats::empty()),
            };
            let user_jid = jid(&user.phone_number);

            let sent: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE user_id = ?1 AND sender_jid = ?2",
                params![user_id, user_jid],
                |r| r.get(0),
            )?;
            let received: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE user_id = ?1 AND recipient_jid = ?2",
                params![user_id, user_jid],
                |r| r.get(0),
            )?;

            let (first_raw, last_raw): (Option<String>, Option<String>) = conn.query_row(
                "SELECT MIN(timestamp), MAX(timestamp) FROM messages WHERE user_id = ?1",
                [user_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            let first = first_raw.as_deref().map(decode_ts).transpose()?;
            let last = last_raw.as_deref().map(decode_ts).transpose()?;

            let average = match (first, last) {
                (Some(first), Some(last)) => {
                    let days = (last - first).num_days() + 1;
                    let avg = total as f64 / days.max(1) as f64;
                    (avg * 100.0).round() / 100.0
                }
                _ => 0.0,
            };

            Ok(ConversationStats {
                total_messages: total,
                messages_sent: sent,
                messages_received: received,
                first_message_date: first,
                last_message_date: last,
                average_messages_per_day: average,
            })
        })
        .await
    }

    /// Merge a delivery status into the message identified by its
    /// WhatsApp message id. Returns `None` when no such message exists.
    pub async fn update_message_status(
        &self,
        whatsapp_message_id: &str,
        status: &str,
    ) -> Result<Option<Message>> {
        let wamid = whatsapp_message_id.to_owned();
        let status = status.to_owned();
        self.call(move |conn| {
            let found: Option<(i64, Option<String>)> = conn
                .query_row(
                    "SELECT id, media_metadata FROM messages
                     WHERE json_extract(media_metadata, '$.whatsapp_message_id') = ?1
                     LIMIT 1",
                    [&wamid],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            let (id, metadata_raw) = match found {
                Some(row) => row,
                None => return Ok(None),
            };

            let mut metadata: Value = metadata_raw
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_else(|| json!({}));
            metadata["status"] = Value::String(status);

            conn.execute(
                "UPDATE messages SET media_metadata = ?1 WHERE id = ?2",
                params![metadata.to_string(), id],
            )?;
            query_message_by_id(conn, id)
        })
        .await
    }
}

fn query_message_by_id(conn: &Connection, id: i64) -> Result<Option<Message>> {
    let message = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            [id],
            row_to_message,
        )
        .optional()?;
    Ok(message)
}

fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    let timestamp: String = row.get("timestamp")?;
    let message_type: String = row.get("message_type")?;
    let metadata_raw: Option<String> = row.get("media_metadata")?;
    Ok(Message {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        session_id: row.get("session_id")?,
        sender_jid: row.get("sender_jid")?,
        recipient_jid: row.get("recipient_jid")?,
        timestamp: decode_ts(&timestamp)?,
        message_type: MessageType::parse(&message_type).unwrap_or(MessageType::Text),
        content: row.get("content")?,
        caption: row.get("caption")?,
        reply_to_id: row.get("reply_to_id")?,
        media_metadata: metadata_raw
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok()),
    })
}
