//! Conversations: data model, persistence contract and state machine

pub mod manager;
pub mod memory;
pub mod models;
pub mod store;
pub mod title;

pub use manager::{ConversationManager, DEFAULT_LIST_LIMIT};
pub use memory::InMemoryConversationStore;
pub use models::{
    default_title, Conversation, ConversationId, ConversationListing, ConversationState,
    MessageId, RequestId, RequestLedgerEntry, Role, StoredMessage, UserId,
};
pub use store::{ConversationStore, StoreError};
pub use title::derive_title;
