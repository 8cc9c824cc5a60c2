//! Database row types and column codecs. Rows map directly to SQLite and are
//! converted into `rapport-types` models at the edge of each query.

use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Row;
use uuid::Uuid;

use rapport_types::models::{
    Attachment, Conversation, Membership, MessageKind, ParseEnumError, SystemEvent,
};

use crate::{StoreError, StoreResult};

/// Fixed-width UTC format so that string comparison in SQL orders the same
/// way as the timestamps themselves.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub fn to_sql_ts(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') has no timezone suffix.
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", raw, e)))
}

pub fn parse_uuid(raw: &str) -> StoreResult<Uuid> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("uuid '{}': {}", raw, e)))
}

pub fn parse_enum<T>(raw: &str) -> StoreResult<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    raw.parse().map_err(|e: ParseEnumError| StoreError::Corrupt(e.to_string()))
}

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub created_at: String,
}

pub(crate) const CONVERSATION_COLUMNS: &str = "id, kind, name, description, avatar_ref, created_by, \
     last_activity_at, last_message_preview, created_at";

pub struct ConversationRow {
    pub id: String,
    pub kind: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub avatar_ref: Option<String>,
    pub created_by: String,
    pub last_activity_at: String,
    pub last_message_preview: Option<String>,
    pub created_at: String,
}

impl ConversationRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            avatar_ref: row.get(4)?,
            created_by: row.get(5)?,
            last_activity_at: row.get(6)?,
            last_message_preview: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    pub fn into_model(self) -> StoreResult<Conversation> {
        Ok(Conversation {
            id: parse_uuid(&self.id)?,
            kind: parse_enum(&self.kind)?,
            name: self.name,
            description: self.description,
            avatar_ref: self.avatar_ref,
            created_by: parse_uuid(&self.created_by)?,
            last_activity_at: parse_ts(&self.last_activity_at)?,
            last_message_preview: self.last_message_preview,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

pub struct MembershipRow {
    pub conversation_id: String,
    pub user_id: String,
    pub role: String,
    pub status: String,
    pub joined_at: String,
}

impl MembershipRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            conversation_id: row.get(0)?,
            user_id: row.get(1)?,
            role: row.get(2)?,
            status: row.get(3)?,
            joined_at: row.get(4)?,
        })
    }

    pub fn into_model(self) -> StoreResult<Membership> {
        Ok(Membership {
            conversation_id: parse_uuid(&self.conversation_id)?,
            user_id: parse_uuid(&self.user_id)?,
            role: parse_enum(&self.role)?,
            status: parse_enum(&self.status)?,
            joined_at: parse_ts(&self.joined_at)?,
        })
    }
}

pub(crate) const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, content, kind, reply_to, \
     attachments, metadata, edited, edited_at, deleted, deleted_at, deleted_by, created_at";

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: Option<String>,
    pub kind: String,
    pub reply_to: Option<String>,
    pub attachments: String,
    pub metadata: Option<String>,
    pub edited: bool,
    pub edited_at: Option<String>,
    pub deleted: bool,
    pub deleted_at: Option<String>,
    pub deleted_by: Option<String>,
    pub created_at: String,
}

impl MessageRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_id: row.get(2)?,
            content: row.get(3)?,
            kind: row.get(4)?,
            reply_to: row.get(5)?,
            attachments: row.get(6)?,
            metadata: row.get(7)?,
            edited: row.get(8)?,
            edited_at: row.get(9)?,
            deleted: row.get(10)?,
            deleted_at: row.get(11)?,
            deleted_by: row.get(12)?,
            created_at: row.get(13)?,
        })
    }

    pub fn kind(&self) -> StoreResult<MessageKind> {
        parse_enum(&self.kind)
    }

    pub fn attachments(&self) -> StoreResult<Vec<Attachment>> {
        Ok(serde_json::from_str(&self.attachments)?)
    }

    pub fn metadata(&self) -> StoreResult<Option<SystemEvent>> {
        self.metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(StoreError::from)
    }
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> StoreResult<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> StoreResult<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
