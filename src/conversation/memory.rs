//! In-memory conversation store
//!
//! All state sits behind one mutex, so every contract operation is atomic.
//! Suitable for tests and single-process deployments.

use super::models::*;
use super::store::{ConversationStore, StoreError};
use crate::limiter::Volume;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Clone)]
struct MessageRecord {
    conversation_id: ConversationId,
    role: Role,
    content: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    last_id: i64,
    users: HashMap<i64, UserId>,
    conversations: BTreeMap<ConversationId, Conversation>,
    messages: BTreeMap<MessageId, MessageRecord>,
    current: HashMap<UserId, ConversationId>,
    requests: BTreeMap<RequestId, RequestLedgerEntry>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn ensure_user(&self, user_id: UserId) -> Result<(), StoreError> {
        if self.users.values().any(|&id| id == user_id) {
            Ok(())
        } else {
            Err(StoreError::UnknownUser(user_id))
        }
    }

    fn current_or_create(
        &mut self,
        user_id: UserId,
        title: Option<String>,
    ) -> Result<ConversationId, StoreError> {
        self.ensure_user(user_id)?;
        if let Some(&id) = self.current.get(&user_id) {
            return Ok(id);
        }

        let id = ConversationId(self.next_id());
        self.conversations.insert(id, Conversation { id, user_id, title });
        self.current.insert(user_id, id);
        debug!("Created conversation {} for user {}", id, user_id);
        Ok(id)
    }

    fn append(
        &mut self,
        conversation_id: ConversationId,
        role: Role,
        content: &str,
    ) -> Result<MessageId, StoreError> {
        if !self.conversations.contains_key(&conversation_id) {
            return Err(StoreError::ConversationNotFound(conversation_id));
        }
        let id = MessageId(self.next_id());
        self.messages.insert(
            id,
            MessageRecord {
                conversation_id,
                role,
                content: content.to_string(),
            },
        );
        Ok(id)
    }
}

/// Conversation store kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    state: Mutex<MemoryState>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the request ledger, oldest first
    pub fn ledger(&self) -> Result<Vec<RequestLedgerEntry>, StoreError> {
        Ok(self.lock()?.requests.values().cloned().collect())
    }

    pub fn conversation(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError> {
        Ok(self.lock()?.conversations.get(&id).cloned())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn add_user(&self, external_id: i64) -> Result<UserId, StoreError> {
        let mut state = self.lock()?;
        if let Some(&id) = state.users.get(&external_id) {
            return Ok(id);
        }
        let id = UserId(state.next_id());
        state.users.insert(external_id, id);
        Ok(id)
    }

    async fn get_user_id(&self, external_id: i64) -> Result<Option<UserId>, StoreError> {
        Ok(self.lock()?.users.get(&external_id).copied())
    }

    async fn current_conversation(
        &self,
        user_id: UserId,
    ) -> Result<Option<ConversationId>, StoreError> {
        Ok(self.lock()?.current.get(&user_id).copied())
    }

    async fn get_or_create_current_conversation(
        &self,
        user_id: UserId,
        title: Option<String>,
    ) -> Result<ConversationId, StoreError> {
        self.lock()?.current_or_create(user_id, title)
    }

    async fn append_message(
        &self,
        conversation_id: ConversationId,
        role: Role,
        content: &str,
    ) -> Result<MessageId, StoreError> {
        self.lock()?.append(conversation_id, role, content)
    }

    async fn store_message(
        &self,
        user_id: UserId,
        role: Role,
        content: &str,
        title: Option<String>,
    ) -> Result<ConversationId, StoreError> {
        let mut state = self.lock()?;
        let conversation_id = state.current_or_create(user_id, title)?;
        state.append(conversation_id, role, content)?;
        Ok(conversation_id)
    }

    async fn get_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .messages
            .iter()
            .filter(|(_, m)| m.conversation_id == conversation_id)
            .map(|(&id, m)| StoredMessage {
                id,
                role: m.role,
                content: m.content.clone(),
            })
            .collect())
    }

    async fn delete_messages(&self, ids: &[MessageId]) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        for id in ids {
            state.messages.remove(id);
        }
        Ok(())
    }

    async fn clear_current(&self, user_id: UserId) -> Result<Option<ConversationId>, StoreError> {
        Ok(self.lock()?.current.remove(&user_id))
    }

    async fn forget_current(
        &self,
        user_id: UserId,
    ) -> Result<Option<ConversationId>, StoreError> {
        let mut state = self.lock()?;
        let Some(conversation_id) = state.current.remove(&user_id) else {
            return Ok(None);
        };
        state.messages.retain(|_, m| m.conversation_id != conversation_id);
        state.conversations.remove(&conversation_id);
        Ok(Some(conversation_id))
    }

    async fn select_conversation(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        let mut state = self.lock()?;
        let conversation = match state.conversations.get(&conversation_id) {
            Some(c) if c.user_id == user_id => c.clone(),
            _ => return Ok(None),
        };
        state.current.insert(user_id, conversation_id);
        Ok(Some(conversation))
    }

    async fn list_conversations(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<ConversationListing>, StoreError> {
        let state = self.lock()?;
        let current = state.current.get(&user_id).copied();
        Ok(state
            .conversations
            .values()
            .filter(|c| c.user_id == user_id)
            .take(limit)
            .map(|c| ConversationListing {
                id: c.id,
                title: c.display_title(),
                current: current == Some(c.id),
            })
            .collect())
    }

    async fn store_request(
        &self,
        user_id: UserId,
        timestamp: DateTime<Utc>,
        counters: &Volume,
    ) -> Result<RequestId, StoreError> {
        let mut state = self.lock()?;
        state.ensure_user(user_id)?;
        let id = RequestId(state.next_id());
        state.requests.insert(
            id,
            RequestLedgerEntry {
                id,
                user_id,
                requested_at: timestamp,
                estimated: counters.clone(),
                responded_at: None,
                prompt_tokens: None,
                completion_tokens: None,
            },
        );
        Ok(id)
    }

    async fn store_response(
        &self,
        request_id: RequestId,
        timestamp: DateTime<Utc>,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let entry = state
            .requests
            .get_mut(&request_id)
            .ok_or(StoreError::RequestNotFound(request_id))?;
        entry.responded_at = Some(timestamp);
        entry.prompt_tokens = Some(prompt_tokens);
        entry.completion_tokens = Some(completion_tokens);
        Ok(())
    }
}
