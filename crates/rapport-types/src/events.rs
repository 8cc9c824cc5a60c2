use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{Conversation, Message, Profile, ReactionAction, ReactionMap};
use crate::signal::{SignalKind, SignalMessage};

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// A message was appended to a conversation
    MessageCreate(Message),

    /// A message was edited
    MessageUpdate(Message),

    /// A message was soft-deleted
    MessageDelete {
        conversation_id: Uuid,
        message_id: Uuid,
        deleted_by: Uuid,
    },

    /// A reaction was toggled; carries the resulting map
    ReactionUpdate {
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
        action: ReactionAction,
        reactions: ReactionMap,
    },

    /// A participant read a batch of messages
    ReadReceipts {
        conversation_id: Uuid,
        user_id: Uuid,
        message_ids: Vec<Uuid>,
        read_at: DateTime<Utc>,
    },

    TypingStart {
        conversation_id: Uuid,
        user: Profile,
    },

    TypingStop {
        conversation_id: Uuid,
        user_id: Uuid,
    },

    /// Settings or membership changed
    ConversationUpdate(Conversation),

    /// A signaling envelope delivered from a joined session
    Signal(SignalMessage),

    /// A signaling command could not be carried out
    SignalError { session_id: String, reason: String },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Join a signaling session, announcing ourselves with optional payload
    SignalJoin {
        session_id: String,
        #[serde(default)]
        data: Option<Value>,
    },

    /// Publish a negotiation message into a joined session
    SignalSend {
        session_id: String,
        #[serde(rename = "type")]
        kind: SignalKind,
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        data: Option<Value>,
    },

    /// Leave a signaling session
    SignalLeave { session_id: String },
}
