//! Message ledger: the ordered, append-mostly log of messages per
//! conversation. The only writer of edits, deletions and reactions.
//!
//! Lifecycle per message is `active -> edited* -> deleted`; `deleted` is
//! absorbing and clears content and attachments for good.

use std::collections::HashMap;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use rusqlite::Connection;
use rusqlite::types::Value;
use tracing::{debug, info};
use uuid::Uuid;

use rapport_types::models::{
    Attachment, Message, MessageKind, Profile, ReactionAction, ReactionMap, Role, SystemEvent,
};

use crate::conversations::{query_conversation, require_active};
use crate::directory::ParticipantDirectory;
use crate::models::{MESSAGE_COLUMNS, MessageRow, OptionalExt, parse_ts, parse_uuid, to_sql_ts};
use crate::{Database, StoreError, StoreResult};

/// Senders may edit for this long after creation.
pub const EDIT_WINDOW_MINUTES: i64 = 15;
pub const PREVIEW_CHARS: usize = 100;
pub const MAX_CONTENT_CHARS: usize = 4000;
pub const MAX_ATTACHMENTS: usize = 10;
pub const MAX_EMOJI_BYTES: usize = 32;
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

const ATTACHMENT_PREVIEW: &str = "[attachment]";

/// A message as submitted by a participant, before validation.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: Option<String>,
    pub kind: MessageKind,
    pub reply_to: Option<Uuid>,
    pub attachments: Vec<Attachment>,
}

/// Listing window. `before` is a message id cursor; `offset` is applied after it.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub limit: Option<u32>,
    pub offset: u32,
    pub before: Option<Uuid>,
    pub include_deleted: bool,
}

/// Normalised insert shared by participant and system messages.
struct MessageInsert {
    conversation_id: Uuid,
    sender_id: Uuid,
    content: Option<String>,
    kind: MessageKind,
    reply_to: Option<Uuid>,
    attachments: Vec<Attachment>,
    metadata: Option<SystemEvent>,
}

impl NewMessage {
    /// Enforce the per-kind schema. A text message with a reply target is
    /// promoted to a reply.
    fn validate(self) -> StoreResult<MessageInsert> {
        let content = normalize_content(self.content)?;

        if self.attachments.len() > MAX_ATTACHMENTS {
            return Err(StoreError::invalid(format!(
                "at most {} attachments per message",
                MAX_ATTACHMENTS
            )));
        }
        if self.attachments.iter().any(|a| a.url.trim().is_empty()) {
            return Err(StoreError::invalid("attachment url must not be empty"));
        }

        let kind = match (self.kind, self.reply_to) {
            (MessageKind::System, _) => {
                return Err(StoreError::invalid("system messages are server-generated"));
            }
            (MessageKind::Text, Some(_)) => MessageKind::Reply,
            (MessageKind::Reply, None) => {
                return Err(StoreError::invalid("reply messages need a reply_to target"));
            }
            (kind, _) => kind,
        };

        match kind {
            MessageKind::Media if self.attachments.is_empty() => {
                return Err(StoreError::invalid("media messages need at least one attachment"));
            }
            MessageKind::Text | MessageKind::Reply if content.is_none() => {
                return Err(StoreError::invalid("message content must not be empty"));
            }
            _ => {}
        }

        Ok(MessageInsert {
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            content,
            kind,
            reply_to: self.reply_to,
            attachments: self.attachments,
            metadata: None,
        })
    }
}

fn normalize_content(content: Option<String>) -> StoreResult<Option<String>> {
    match content {
        Some(c) if c.trim().is_empty() => Ok(None),
        Some(c) if c.chars().count() > MAX_CONTENT_CHARS => Err(StoreError::invalid(format!(
            "content exceeds {} characters",
            MAX_CONTENT_CHARS
        ))),
        other => Ok(other),
    }
}

fn validate_emoji(emoji: &str) -> StoreResult<()> {
    if emoji.is_empty() || emoji.len() > MAX_EMOJI_BYTES || emoji.chars().any(char::is_whitespace) {
        return Err(StoreError::invalid("emoji must be a short non-blank token"));
    }
    Ok(())
}

/// First `PREVIEW_CHARS` characters, with `...` appended when truncated.
pub fn preview_text(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

fn preview_for(content: Option<&str>, attachments: &[Attachment]) -> Option<String> {
    match content {
        Some(c) => Some(preview_text(c)),
        None if !attachments.is_empty() => Some(ATTACHMENT_PREVIEW.to_string()),
        None => None,
    }
}

impl Database {
    /// Append a participant message. Requires active membership; updates the
    /// conversation's activity timestamp and preview.
    pub fn append_message(&self, msg: NewMessage, now: DateTime<Utc>) -> StoreResult<Message> {
        let insert = msg.validate()?;

        self.with_conn_mut(|conn| {
            require_active(conn, insert.conversation_id, insert.sender_id)?;

            if let Some(target) = insert.reply_to {
                let same_conversation = load_message(conn, target)?
                    .is_some_and(|row| row.conversation_id == insert.conversation_id.to_string());
                if !same_conversation {
                    return Err(StoreError::invalid(
                        "reply target must be a message in the same conversation",
                    ));
                }
            }

            let row = insert_message(conn, insert, now)?;
            hydrate_one(conn, row)
        })
    }

    pub fn get_message(&self, message_id: Uuid, actor: Uuid) -> StoreResult<Message> {
        self.with_conn(|conn| {
            let row = load_message(conn, message_id)?
                .ok_or_else(|| StoreError::not_found("message"))?;
            require_active(conn, parse_uuid(&row.conversation_id)?, actor)?;
            hydrate_one(conn, row)
        })
    }

    /// Sender-only edit within the edit window.
    pub fn edit_message(
        &self,
        message_id: Uuid,
        actor: Uuid,
        content: String,
        now: DateTime<Utc>,
    ) -> StoreResult<Message> {
        let content = normalize_content(Some(content))?
            .ok_or_else(|| StoreError::invalid("message content must not be empty"))?;

        self.with_conn_mut(|conn| {
            let row = load_message(conn, message_id)?
                .ok_or_else(|| StoreError::not_found("message"))?;
            require_active(conn, parse_uuid(&row.conversation_id)?, actor)?;

            if row.deleted {
                return Err(StoreError::MessageDeleted);
            }
            if row.sender_id != actor.to_string() {
                return Err(StoreError::forbidden("only the sender can edit a message"));
            }
            if row.kind()? == MessageKind::System {
                return Err(StoreError::forbidden("system messages cannot be edited"));
            }
            let created_at = parse_ts(&row.created_at)?;
            if now - created_at > Duration::minutes(EDIT_WINDOW_MINUTES) {
                return Err(StoreError::EditWindowExpired);
            }

            conn.execute(
                "UPDATE messages SET content = ?1, edited = 1, edited_at = ?2 WHERE id = ?3",
                rusqlite::params![content, to_sql_ts(now), row.id],
            )?;
            debug!("Message {} edited by {}", message_id, actor);

            let row = load_message(conn, message_id)?
                .ok_or_else(|| StoreError::not_found("message"))?;
            hydrate_one(conn, row)
        })
    }

    /// Soft-delete by the sender or the conversation owner. Deleting twice is
    /// a no-op that returns the existing tombstone.
    pub fn delete_message(
        &self,
        message_id: Uuid,
        actor: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Message> {
        self.with_conn_mut(|conn| {
            let row = load_message(conn, message_id)?
                .ok_or_else(|| StoreError::not_found("message"))?;
            let conversation_id = parse_uuid(&row.conversation_id)?;
            let membership = require_active(conn, conversation_id, actor)?;

            if row.deleted {
                return hydrate_one(conn, row);
            }

            let conversation = query_conversation(conn, conversation_id)?
                .ok_or_else(|| StoreError::not_found("conversation"))?;
            let permitted = row.sender_id == actor.to_string()
                || conversation.created_by == actor
                || membership.role == Role::Owner;
            if !permitted {
                return Err(StoreError::forbidden(
                    "only the sender or the conversation owner can delete a message",
                ));
            }

            conn.execute(
                "UPDATE messages
                 SET content = NULL, attachments = '[]', deleted = 1, deleted_at = ?1, deleted_by = ?2
                 WHERE id = ?3",
                rusqlite::params![to_sql_ts(now), actor.to_string(), row.id],
            )?;
            refresh_preview(conn, conversation_id)?;
            info!("Message {} deleted by {}", message_id, actor);

            let row = load_message(conn, message_id)?
                .ok_or_else(|| StoreError::not_found("message"))?;
            hydrate_one(conn, row)
        })
    }

    /// Toggle `actor`'s `emoji` on a message. Returns the resulting map, the
    /// action taken and the owning conversation.
    pub fn toggle_reaction(
        &self,
        message_id: Uuid,
        actor: Uuid,
        emoji: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<(ReactionMap, ReactionAction, Uuid)> {
        validate_emoji(emoji)?;

        self.with_conn_mut(|conn| {
            let row = load_message(conn, message_id)?
                .ok_or_else(|| StoreError::not_found("message"))?;
            let conversation_id = parse_uuid(&row.conversation_id)?;
            require_active(conn, conversation_id, actor)?;

            if row.deleted {
                return Err(StoreError::MessageDeleted);
            }

            let removed = conn.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                rusqlite::params![row.id, actor.to_string(), emoji],
            )?;

            let action = if removed > 0 {
                ReactionAction::Removed
            } else {
                // A concurrent identical insert already did our work.
                conn.execute(
                    "INSERT INTO reactions (message_id, user_id, emoji, created_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (message_id, user_id, emoji) DO NOTHING",
                    rusqlite::params![row.id, actor.to_string(), emoji, to_sql_ts(now)],
                )?;
                ReactionAction::Added
            };

            let mut reactions = query_reactions(conn, std::slice::from_ref(&row.id))?;
            let map = reactions.remove(&row.id).unwrap_or_default();
            Ok((map, action, conversation_id))
        })
    }

    /// Page of messages in chronological order. Newest messages are selected
    /// first so that `limit`/`offset`/`before` page backwards through history.
    pub fn list_messages(
        &self,
        conversation_id: Uuid,
        requester: Uuid,
        page: &Page,
    ) -> StoreResult<Vec<Message>> {
        self.with_conn(|conn| {
            require_active(conn, conversation_id, requester)?;

            let limit = page.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
            let mut sql = format!(
                "SELECT {} FROM messages WHERE conversation_id = ?1",
                MESSAGE_COLUMNS
            );
            let mut params: Vec<Value> = vec![Value::Text(conversation_id.to_string())];

            if !page.include_deleted {
                sql.push_str(" AND deleted = 0");
            }

            if let Some(before) = page.before {
                let cursor: Option<(String, i64)> = conn
                    .query_row(
                        "SELECT created_at, seq FROM messages WHERE id = ?1 AND conversation_id = ?2",
                        rusqlite::params![before.to_string(), conversation_id.to_string()],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let (created_at, seq) =
                    cursor.ok_or_else(|| StoreError::not_found("cursor message"))?;
                sql.push_str(&format!(
                    " AND (created_at, seq) < (?{}, ?{})",
                    params.len() + 1,
                    params.len() + 2
                ));
                params.push(Value::Text(created_at));
                params.push(Value::Integer(seq));
            }

            sql.push_str(&format!(
                " ORDER BY created_at DESC, seq DESC LIMIT ?{} OFFSET ?{}",
                params.len() + 1,
                params.len() + 2
            ));
            params.push(Value::Integer(i64::from(limit)));
            params.push(Value::Integer(i64::from(page.offset)));

            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt
                .query_map(rusqlite::params_from_iter(params), MessageRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.reverse();

            hydrate(conn, rows)
        })
    }
}

/// Insert with a creation timestamp strictly greater than every existing
/// message in the conversation, then refresh the conversation summary.
fn insert_message(
    conn: &Connection,
    msg: MessageInsert,
    now: DateTime<Utc>,
) -> StoreResult<MessageRow> {
    // Stored precision is microseconds; compare at that precision.
    let now = now.trunc_subsecs(6);
    let latest: Option<String> = conn.query_row(
        "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
        [msg.conversation_id.to_string()],
        |row| row.get(0),
    )?;
    let created_at = match latest.as_deref().map(parse_ts).transpose()? {
        Some(latest) if latest >= now => latest + Duration::microseconds(1),
        _ => now,
    };

    let id = Uuid::new_v4();
    let attachments = serde_json::to_string(&msg.attachments)
        .map_err(|e| StoreError::Internal(e.into()))?;
    let metadata = msg
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::Internal(e.into()))?;

    conn.execute(
        "INSERT INTO messages
            (id, conversation_id, sender_id, content, kind, reply_to, attachments, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            id.to_string(),
            msg.conversation_id.to_string(),
            msg.sender_id.to_string(),
            msg.content,
            msg.kind.as_str(),
            msg.reply_to.map(|r| r.to_string()),
            attachments,
            metadata,
            to_sql_ts(created_at),
        ],
    )?;

    conn.execute(
        "UPDATE conversations SET last_activity_at = ?1, last_message_preview = ?2 WHERE id = ?3",
        rusqlite::params![
            to_sql_ts(created_at),
            preview_for(msg.content.as_deref(), &msg.attachments),
            msg.conversation_id.to_string(),
        ],
    )?;

    load_message(conn, id)?.ok_or_else(|| StoreError::not_found("message"))
}

/// Append a server-generated `system` message on behalf of `actor`.
pub(crate) fn append_system_message(
    conn: &Connection,
    conversation_id: Uuid,
    actor: Uuid,
    content: String,
    event: SystemEvent,
    now: DateTime<Utc>,
) -> StoreResult<Message> {
    let row = insert_message(
        conn,
        MessageInsert {
            conversation_id,
            sender_id: actor,
            content: Some(content),
            kind: MessageKind::System,
            reply_to: None,
            attachments: Vec::new(),
            metadata: Some(event),
        },
        now,
    )?;
    hydrate_one(conn, row)
}

/// After a delete, point the preview at the newest surviving message so the
/// removed content does not linger in list views.
fn refresh_preview(conn: &Connection, conversation_id: Uuid) -> StoreResult<()> {
    let newest: Option<(Option<String>, String)> = conn
        .query_row(
            "SELECT content, attachments FROM messages
             WHERE conversation_id = ?1 AND deleted = 0
             ORDER BY created_at DESC, seq DESC LIMIT 1",
            [conversation_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let preview = match newest {
        Some((content, attachments)) => {
            let attachments: Vec<Attachment> = serde_json::from_str(&attachments)?;
            preview_for(content.as_deref(), &attachments)
        }
        None => None,
    };

    conn.execute(
        "UPDATE conversations SET last_message_preview = ?1 WHERE id = ?2",
        rusqlite::params![preview, conversation_id.to_string()],
    )?;
    Ok(())
}

pub(crate) fn load_message(conn: &Connection, id: Uuid) -> StoreResult<Option<MessageRow>> {
    conn.query_row(
        &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
        [id.to_string()],
        MessageRow::from_row,
    )
    .optional()
}

/// Batch-fetch reactions for a set of message IDs, grouped per message.
pub(crate) fn query_reactions(
    conn: &Connection,
    message_ids: &[String],
) -> StoreResult<HashMap<String, ReactionMap>> {
    let mut grouped: HashMap<String, ReactionMap> = HashMap::new();
    if message_ids.is_empty() {
        return Ok(grouped);
    }

    let placeholders: Vec<String> = (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "SELECT message_id, user_id, emoji FROM reactions WHERE message_id IN ({})",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(message_ids.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (message_id, user_id, emoji) in rows {
        grouped
            .entry(message_id)
            .or_default()
            .entry(emoji)
            .or_default()
            .insert(parse_uuid(&user_id)?);
    }

    Ok(grouped)
}

fn hydrate_one(conn: &Connection, row: MessageRow) -> StoreResult<Message> {
    let sender_id = parse_uuid(&row.sender_id)?;
    let sender = conn.profile(sender_id)?.unwrap_or_else(|| Profile::unknown(sender_id));
    let mut reactions = query_reactions(conn, std::slice::from_ref(&row.id))?;
    let map = reactions.remove(&row.id).unwrap_or_default();
    to_model(row, sender, map)
}

/// Resolve senders and reactions for a page of rows with two batch queries.
fn hydrate(conn: &Connection, rows: Vec<MessageRow>) -> StoreResult<Vec<Message>> {
    let mut sender_ids = Vec::new();
    for row in &rows {
        let id = parse_uuid(&row.sender_id)?;
        if !sender_ids.contains(&id) {
            sender_ids.push(id);
        }
    }
    let profiles = conn.profiles(&sender_ids)?;

    let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
    let mut reactions = query_reactions(conn, &ids)?;

    rows.into_iter()
        .map(|row| {
            let sender_id = parse_uuid(&row.sender_id)?;
            let sender = profiles
                .get(&sender_id)
                .cloned()
                .unwrap_or_else(|| Profile::unknown(sender_id));
            let map = reactions.remove(&row.id).unwrap_or_default();
            to_model(row, sender, map)
        })
        .collect()
}

fn to_model(row: MessageRow, sender: Profile, reactions: ReactionMap) -> StoreResult<Message> {
    let deleted = row.deleted;
    Ok(Message {
        id: parse_uuid(&row.id)?,
        conversation_id: parse_uuid(&row.conversation_id)?,
        kind: row.kind()?,
        attachments: if deleted { Vec::new() } else { row.attachments()? },
        metadata: row.metadata()?,
        reply_to: row.reply_to.as_deref().map(parse_uuid).transpose()?,
        edited: row.edited,
        edited_at: row.edited_at.as_deref().map(parse_ts).transpose()?,
        deleted,
        deleted_at: row.deleted_at.as_deref().map(parse_ts).transpose()?,
        deleted_by: row.deleted_by.as_deref().map(parse_uuid).transpose()?,
        created_at: parse_ts(&row.created_at)?,
        content: if deleted { None } else { row.content },
        sender,
        reactions,
    })
}
