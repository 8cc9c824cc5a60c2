//! Read-receipt tracker. One receipt per (message, user), last write wins,
//! never for the message's own sender.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use rapport_types::models::{Message, Profile, ReadReceipt};

use crate::conversations::require_active;
use crate::directory::ParticipantDirectory;
use crate::messages::load_message;
use crate::models::{parse_ts, parse_uuid, to_sql_ts};
use crate::{Database, StoreError, StoreResult};

impl Database {
    /// Mark messages read for `user_id`. With `None`, every message in the
    /// conversation still lacking a receipt is marked. Returns the ids marked.
    pub fn mark_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        message_ids: Option<&[Uuid]>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Uuid>> {
        self.with_conn_mut(|conn| {
            require_active(conn, conversation_id, user_id)?;

            let targets = match message_ids {
                Some(ids) => foreign_messages_among(conn, conversation_id, user_id, ids)?,
                None => unread_message_ids(conn, conversation_id, user_id)?,
            };

            let mut stmt = conn.prepare(
                "INSERT INTO read_receipts (message_id, user_id, read_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (message_id, user_id) DO UPDATE SET read_at = excluded.read_at",
            )?;
            let ts = to_sql_ts(now);
            for id in &targets {
                stmt.execute(rusqlite::params![id.to_string(), user_id.to_string(), ts])?;
            }

            debug!("{} marked {} messages read in {}", user_id, targets.len(), conversation_id);
            Ok(targets)
        })
    }

    /// Read-on-view: create receipts for messages the viewer was just shown
    /// and has not read yet. Existing receipts keep their original timestamp.
    pub fn record_views(
        &self,
        viewer: Uuid,
        messages: &[Message],
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Uuid>> {
        let candidates: Vec<Uuid> = messages
            .iter()
            .filter(|m| m.sender.id != viewer && !m.deleted)
            .map(|m| m.id)
            .collect();
        if candidates.is_empty() {
            return Ok(candidates);
        }

        self.with_conn_mut(|conn| {
            let mut stmt = conn.prepare(
                "INSERT INTO read_receipts (message_id, user_id, read_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (message_id, user_id) DO NOTHING",
            )?;
            let ts = to_sql_ts(now);
            let mut created = Vec::new();
            for id in candidates {
                if stmt.execute(rusqlite::params![id.to_string(), viewer.to_string(), ts])? > 0 {
                    created.push(id);
                }
            }
            Ok(created)
        })
    }

    pub fn unread_count(&self, conversation_id: Uuid, user_id: Uuid) -> StoreResult<u64> {
        self.with_conn(|conn| {
            require_active(conn, conversation_id, user_id)?;
            query_unread_count(conn, conversation_id, user_id)
        })
    }

    /// Receipts for one message with reader profiles, oldest read first.
    pub fn read_by(&self, message_id: Uuid, actor: Uuid) -> StoreResult<Vec<ReadReceipt>> {
        self.with_conn(|conn| {
            let row = load_message(conn, message_id)?
                .ok_or_else(|| StoreError::not_found("message"))?;
            require_active(conn, parse_uuid(&row.conversation_id)?, actor)?;

            let mut stmt = conn.prepare(
                "SELECT user_id, read_at FROM read_receipts
                 WHERE message_id = ?1 ORDER BY read_at, user_id",
            )?;
            let rows = stmt
                .query_map([message_id.to_string()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let readers = rows
                .iter()
                .map(|(user_id, _)| parse_uuid(user_id))
                .collect::<StoreResult<Vec<_>>>()?;
            let profiles = conn.profiles(&readers)?;

            rows.into_iter()
                .zip(readers)
                .map(|((_, read_at), user_id)| {
                    Ok(ReadReceipt {
                        message_id,
                        user: profiles
                            .get(&user_id)
                            .cloned()
                            .unwrap_or_else(|| Profile::unknown(user_id)),
                        read_at: parse_ts(&read_at)?,
                    })
                })
                .collect()
        })
    }
}

/// Unread for user `?2` in conversation `?1`: live messages from someone else
/// with no receipt from the user. The count and mark-all share it.
const UNREAD_WHERE: &str = "m.conversation_id = ?1 AND m.sender_id != ?2 AND m.deleted = 0
     AND NOT EXISTS (
         SELECT 1 FROM read_receipts r WHERE r.message_id = m.id AND r.user_id = ?2
     )";

pub(crate) fn query_unread_count(
    conn: &Connection,
    conversation_id: Uuid,
    user_id: Uuid,
) -> StoreResult<u64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM messages m WHERE {}", UNREAD_WHERE),
        [conversation_id.to_string(), user_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

fn unread_message_ids(
    conn: &Connection,
    conversation_id: Uuid,
    user_id: Uuid,
) -> StoreResult<Vec<Uuid>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT m.id FROM messages m WHERE {} ORDER BY m.created_at, m.seq",
        UNREAD_WHERE
    ))?;
    let ids = stmt
        .query_map([conversation_id.to_string(), user_id.to_string()], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    ids.iter().map(|id| parse_uuid(id)).collect()
}

/// The subset of `ids` that belong to the conversation and were not sent by
/// `user_id`. Unknown ids are dropped silently.
fn foreign_messages_among(
    conn: &Connection,
    conversation_id: Uuid,
    user_id: Uuid,
    ids: &[Uuid],
) -> StoreResult<Vec<Uuid>> {
    let mut stmt = conn.prepare(
        "SELECT sender_id FROM messages WHERE id = ?1 AND conversation_id = ?2",
    )?;
    let mut out = Vec::new();
    for id in ids {
        if out.contains(id) {
            continue;
        }
        let mut rows = stmt.query([id.to_string(), conversation_id.to_string()])?;
        if let Some(row) = rows.next()? {
            let sender: String = row.get(0)?;
            if sender != user_id.to_string() {
                out.push(*id);
            }
        }
    }
    Ok(out)
}
