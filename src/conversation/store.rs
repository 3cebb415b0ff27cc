//! Persistence contract for conversations
//!
//! Every method is one atomic operation from the caller's point of view;
//! in particular switching the current-conversation pointer never exposes
//! an intermediate state.

use super::models::*;
use crate::limiter::Volume;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unknown user: {0}")]
    UnknownUser(UserId),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Storage for users, conversations, messages and the request ledger
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Provision a user for an external id; returns the existing id if present
    async fn add_user(&self, external_id: i64) -> Result<UserId, StoreError>;

    async fn get_user_id(&self, external_id: i64) -> Result<Option<UserId>, StoreError>;

    async fn current_conversation(
        &self,
        user_id: UserId,
    ) -> Result<Option<ConversationId>, StoreError>;

    /// Current conversation, creating it with `title` when there is none
    async fn get_or_create_current_conversation(
        &self,
        user_id: UserId,
        title: Option<String>,
    ) -> Result<ConversationId, StoreError>;

    async fn append_message(
        &self,
        conversation_id: ConversationId,
        role: Role,
        content: &str,
    ) -> Result<MessageId, StoreError>;

    /// Append to the current conversation, creating it first if needed.
    ///
    /// Implementations should make this atomic; the default composes two calls.
    async fn store_message(
        &self,
        user_id: UserId,
        role: Role,
        content: &str,
        title: Option<String>,
    ) -> Result<ConversationId, StoreError> {
        let conversation_id = self.get_or_create_current_conversation(user_id, title).await?;
        self.append_message(conversation_id, role, content).await?;
        Ok(conversation_id)
    }

    /// Messages ordered by id
    async fn get_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    async fn delete_messages(&self, ids: &[MessageId]) -> Result<(), StoreError>;

    /// Clear the pointer, keeping the conversation; returns what was current
    async fn clear_current(&self, user_id: UserId) -> Result<Option<ConversationId>, StoreError>;

    /// Clear the pointer and delete the conversation with its messages
    async fn forget_current(&self, user_id: UserId)
        -> Result<Option<ConversationId>, StoreError>;

    /// Point at `conversation_id` if the user owns it
    async fn select_conversation(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError>;

    /// Oldest first, at most `limit`
    async fn list_conversations(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<ConversationListing>, StoreError>;

    async fn store_request(
        &self,
        user_id: UserId,
        timestamp: DateTime<Utc>,
        counters: &Volume,
    ) -> Result<RequestId, StoreError>;

    async fn store_response(
        &self,
        request_id: RequestId,
        timestamp: DateTime<Utc>,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Result<(), StoreError>;
}
