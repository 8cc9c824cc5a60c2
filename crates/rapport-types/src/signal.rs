use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Channel name prefix for a signaling session.
pub const SESSION_CHANNEL_PREFIX: &str = "session:";

pub fn session_channel(session_id: &str) -> String {
    format!("{}{}", SESSION_CHANNEL_PREFIX, session_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    UserJoined,
    UserLeft,
}

impl SignalKind {
    /// Presence kinds are always broadcast to the whole session.
    pub fn is_presence(&self) -> bool {
        matches!(self, Self::UserJoined | Self::UserLeft)
    }
}

/// Envelope carried on a session channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalValidationError {
    #[error("{0:?} requires a string `{1}` field in data")]
    MissingField(SignalKind, &'static str),
    #[error("presence messages cannot be addressed to a single peer")]
    AddressedPresence,
    #[error("peer and session identifiers must be non-empty")]
    EmptyIdentifier,
}

impl SignalMessage {
    pub fn new(
        kind: SignalKind,
        session_id: impl Into<String>,
        from: impl Into<String>,
        to: Option<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            kind,
            from: from.into(),
            to,
            session_id: session_id.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Schema check applied before a message is published.
    pub fn validate(&self) -> Result<(), SignalValidationError> {
        if self.from.is_empty() || self.session_id.is_empty() {
            return Err(SignalValidationError::EmptyIdentifier);
        }
        if self.to.as_deref() == Some("") {
            return Err(SignalValidationError::EmptyIdentifier);
        }

        let required = match self.kind {
            SignalKind::Offer | SignalKind::Answer => Some("sdp"),
            SignalKind::IceCandidate => Some("candidate"),
            SignalKind::UserJoined | SignalKind::UserLeft => {
                if self.to.is_some() {
                    return Err(SignalValidationError::AddressedPresence);
                }
                None
            }
        };

        if let Some(field) = required {
            let present = self
                .data
                .as_ref()
                .and_then(|d| d.get(field))
                .is_some_and(Value::is_string);
            if !present {
                return Err(SignalValidationError::MissingField(self.kind, field));
            }
        }

        Ok(())
    }

    /// Client-side routing contract: untargeted messages are for everyone,
    /// targeted ones only for the named peer.
    pub fn is_addressed_to(&self, peer_id: &str) -> bool {
        self.to.as_deref().is_none_or(|to| to == peer_id)
    }
}

/// Deterministic tie-break for who sends the `offer` when two peers discover
/// each other at the same time.
pub fn should_initiate(local_peer: &str, remote_peer: &str) -> bool {
    local_peer < remote_peer
}
