//! Data models for users, conversations and the request ledger

use crate::limiter::Volume;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Internal user id
    UserId
);
id_type!(
    /// Conversation id, increasing with creation order
    ConversationId
);
id_type!(
    /// Message id, increasing with insert order
    MessageId
);
id_type!(
    /// Ledger entry id
    RequestId
);

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Assistant,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::Assistant => "assistant",
            Role::User => "user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
}

/// Title shown for a conversation that has none
pub fn default_title(id: ConversationId) -> String {
    format!("Conversation {}", id)
}

/// A conversation owned by one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Conversation {
    pub fn display_title(&self) -> String {
        self.title.clone().unwrap_or_else(|| default_title(self.id))
    }
}

/// Row of a conversation list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationListing {
    pub id: ConversationId,
    pub title: String,
    pub current: bool,
}

/// Per-user conversation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    NoCurrent,
    HasCurrent(ConversationId),
}

impl From<Option<ConversationId>> for ConversationState {
    fn from(current: Option<ConversationId>) -> Self {
        match current {
            Some(id) => ConversationState::HasCurrent(id),
            None => ConversationState::NoCurrent,
        }
    }
}

/// One outbound call attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLedgerEntry {
    pub id: RequestId,
    pub user_id: UserId,
    pub requested_at: DateTime<Utc>,
    pub estimated: Volume,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
}
