use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Returned when a stored or client-supplied enum string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Generates `as_str`, `Display` and `FromStr` for a fieldless enum whose
/// serde representation is the same lowercase string.
macro_rules! string_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $label,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

string_enum!(ConversationKind, "conversation kind", {
    Direct => "direct",
    Group => "group",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Member,
}

string_enum!(Role, "role", {
    Owner => "owner",
    Admin => "admin",
    Member => "member",
});

impl Role {
    /// Owners and admins may change group settings and membership.
    pub fn can_manage(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Active,
    Left,
    Removed,
}

string_enum!(MemberStatus, "member status", {
    Active => "active",
    Left => "left",
    Removed => "removed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    System,
    Media,
    Reply,
}

string_enum!(MessageKind, "message kind", {
    Text => "text",
    System => "system",
    Media => "media",
    Reply => "reply",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    Added,
    Removed,
}

/// Minimal display profile resolved from the participant directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub display_name: String,
    pub handle: String,
    pub avatar_ref: Option<String>,
}

impl Profile {
    /// Stand-in for identifiers the directory no longer knows about.
    pub fn unknown(id: Uuid) -> Self {
        Self {
            id,
            display_name: "Unknown user".to_string(),
            handle: "unknown".to_string(),
            avatar_ref: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Metadata carried by `system` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SystemEvent {
    ConversationCreated,
    ConversationRenamed {
        old_name: Option<String>,
        new_name: String,
    },
    ParticipantsAdded {
        user_ids: Vec<Uuid>,
    },
    ParticipantRemoved {
        user_id: Uuid,
    },
    ParticipantLeft {
        user_id: Uuid,
    },
}

/// emoji -> users who reacted with it. Empty sets are never stored.
pub type ReactionMap = BTreeMap<String, BTreeSet<Uuid>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub description: Option<String>,
    pub avatar_ref: Option<String>,
    pub created_by: Uuid,
    pub last_activity_at: DateTime<Utc>,
    pub last_message_preview: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
    pub status: MemberStatus,
    pub joined_at: DateTime<Utc>,
}

impl Membership {
    pub fn is_active(&self) -> bool {
        self.status == MemberStatus::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender: Profile,
    /// `None` once the message has been deleted.
    pub content: Option<String>,
    pub kind: MessageKind,
    pub reply_to: Option<Uuid>,
    pub attachments: Vec<Attachment>,
    pub metadata: Option<SystemEvent>,
    pub reactions: ReactionMap,
    pub edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub message_id: Uuid,
    pub user: Profile,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingMarker {
    pub conversation_id: Uuid,
    pub user: Profile,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_strings_match_serde() {
        for kind in [MessageKind::Text, MessageKind::System, MessageKind::Media, MessageKind::Reply] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
        }
        assert!("moderator".parse::<Role>().is_err());
    }

    #[test]
    fn system_event_is_tagged() {
        let event = SystemEvent::ConversationRenamed {
            old_name: None,
            new_name: "study group".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "conversation_renamed");
        assert_eq!(json["new_name"], "study group");
    }

    #[test]
    fn only_owner_and_admin_manage() {
        assert!(Role::Owner.can_manage());
        assert!(Role::Admin.can_manage());
        assert!(!Role::Member.can_manage());
    }
}
