use crate::entity::{UserId, UserInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub Uuid);

impl ChatId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChatId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical key of an unordered user pair. `PairKey::new(a, b) == PairKey::new(b, a)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey(UserId, UserId);

impl PairKey {
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self(a, b)
        } else {
            Self(b, a)
        }
    }

    pub fn members(&self) -> [UserId; 2] {
        [self.0, self.1]
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

/// A two-party conversation. Participants are fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: ChatId,
    pub participants: [UserId; 2],
    pub created_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(participant_a: UserId, participant_b: UserId) -> Self {
        Self {
            id: ChatId::new(),
            participants: PairKey::new(participant_a, participant_b).members(),
            created_at: Utc::now(),
        }
    }

    pub fn pair_key(&self) -> PairKey {
        PairKey::new(self.participants[0], self.participants[1])
    }

    /// The participant that is not `user`, if `user` takes part in this chat.
    pub fn peer_of(&self, user: UserId) -> Option<UserId> {
        match self.participants {
            [a, b] if a == user => Some(b),
            [a, b] if b == user => Some(a),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(chat_id: ChatId, sender_id: UserId, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id,
            sender_id,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// A message annotated with its sender's public info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: Uuid,
    pub chat_id: ChatId,
    pub sender: UserInfo,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Read-only projection of a chat: participants and messages, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatHistory {
    pub id: ChatId,
    pub participants: Vec<UserInfo>,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<HistoryMessage>,
}
