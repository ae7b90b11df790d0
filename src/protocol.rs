use crate::{
    chat::{ChatId, ChatMessage},
    entity::{UserId, UserInfo},
    error::{ChatError, Result},
    registry::Frame,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// A message submission sent by a client over its live connection.
///
/// The recipient is addressed either by id or by username, never both.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessage {
    #[serde(default)]
    pub recipient: Option<UserId>,
    #[serde(default)]
    pub recipient_username: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Id(UserId),
    Username(String),
}

impl SendMessage {
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| ChatError::validation(format!("malformed message frame: {}", e)))
    }

    pub fn recipient(&self) -> Result<Recipient> {
        match (&self.recipient, &self.recipient_username) {
            (Some(id), None) => Ok(Recipient::Id(*id)),
            (None, Some(name)) if !name.trim().is_empty() => {
                Ok(Recipient::Username(name.trim().to_string()))
            }
            (Some(_), Some(_)) => Err(ChatError::validation(
                "give either recipient or recipient_username, not both",
            )),
            _ => Err(ChatError::validation("message has no recipient")),
        }
    }
}

/// A persisted message as pushed to live connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub chat_id: ChatId,
    pub sender: UserInfo,
    pub recipient_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(message: &ChatMessage, sender: UserInfo, recipient_id: UserId) -> Self {
        Self {
            id: message.id,
            chat_id: message.chat_id,
            sender,
            recipient_id,
            content: message.content.clone(),
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A message was persisted in one of the user's chats.
    Message(OutboundMessage),

    /// The last frame from this connection could not be processed.
    Error { kind: String, message: String },
}

impl ServerEvent {
    pub fn error(err: &ChatError) -> Self {
        Self::Error {
            kind: err.kind().to_string(),
            message: err.public_message(),
        }
    }

    pub fn to_frame(&self) -> Result<Frame> {
        serde_json::to_string(self)
            .map(Arc::from)
            .map_err(|e| ChatError::Internal(format!("failed to encode frame: {}", e)))
    }
}
