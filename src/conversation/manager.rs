//! Per-user conversation state machine
//!
//! A user is either `NoCurrent` or `HasCurrent(id)`. Sending a message while
//! `NoCurrent` lazily creates a conversation; quit, forget and select move the
//! pointer.

use super::models::*;
use super::store::{ConversationStore, StoreError};
use super::title::derive_title;
use std::sync::Arc;
use tracing::{debug, info};

/// Default number of conversations returned by [`ConversationManager::list`]
pub const DEFAULT_LIST_LIMIT: usize = 10;

/// Conversation state transitions against a store
#[derive(Clone)]
pub struct ConversationManager {
    store: Arc<dyn ConversationStore>,
    list_limit: usize,
}

impl ConversationManager {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self {
            store,
            list_limit: DEFAULT_LIST_LIMIT,
        }
    }

    pub fn with_list_limit(mut self, list_limit: usize) -> Self {
        self.list_limit = list_limit;
        self
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Internal id for an external identity, `None` if not provisioned
    pub async fn resolve_user(&self, external_id: i64) -> Result<Option<UserId>, StoreError> {
        self.store.get_user_id(external_id).await
    }

    /// Provision a user
    pub async fn add_user(&self, external_id: i64) -> Result<UserId, StoreError> {
        let user_id = self.store.add_user(external_id).await?;
        info!("Provisioned user {} for external id {}", user_id, external_id);
        Ok(user_id)
    }

    pub async fn state(&self, user_id: UserId) -> Result<ConversationState, StoreError> {
        Ok(self.store.current_conversation(user_id).await?.into())
    }

    /// Append to the current conversation, creating one titled after the
    /// message when there is none
    pub async fn send_message(
        &self,
        user_id: UserId,
        role: Role,
        content: &str,
    ) -> Result<ConversationId, StoreError> {
        let conversation_id = self
            .store
            .store_message(user_id, role, content, derive_title(content))
            .await?;
        debug!(
            "Stored {} message for user {} in conversation {}",
            role, user_id, conversation_id
        );
        Ok(conversation_id)
    }

    /// Leave the current conversation, keeping it
    pub async fn quit(&self, user_id: UserId) -> Result<(), StoreError> {
        if let Some(previous) = self.store.clear_current(user_id).await? {
            info!("User {} left conversation {}", user_id, previous);
        }
        Ok(())
    }

    /// Start afresh; the next message opens a new conversation
    pub async fn new_conversation(&self, user_id: UserId) -> Result<(), StoreError> {
        self.quit(user_id).await
    }

    /// Leave and permanently delete the current conversation
    pub async fn forget(&self, user_id: UserId) -> Result<(), StoreError> {
        if let Some(forgotten) = self.store.forget_current(user_id).await? {
            info!("User {} forgot conversation {}", user_id, forgotten);
        }
        Ok(())
    }

    /// Make `conversation_id` current; `None` if it is missing or not owned
    pub async fn select(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Option<String>, StoreError> {
        let selected = self
            .store
            .select_conversation(user_id, conversation_id)
            .await?;
        match &selected {
            Some(_) => info!("User {} selected conversation {}", user_id, conversation_id),
            None => debug!(
                "User {} cannot select conversation {}",
                user_id, conversation_id
            ),
        }
        Ok(selected.map(|c| c.display_title()))
    }

    pub async fn list(&self, user_id: UserId) -> Result<Vec<ConversationListing>, StoreError> {
        self.store.list_conversations(user_id, self.list_limit).await
    }

    pub async fn history(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.store.get_messages(conversation_id).await
    }
}
