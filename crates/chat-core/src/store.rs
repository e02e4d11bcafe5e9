//! Conversation Store
//!
//! Durable conversation log consumed by the chat service. Writes to the same
//! conversation id are serialized; different ids never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::Result;
use crate::message::{Conversation, ConversationSummary, Message};

/// In-place edit of a conversation's message list
pub type MessageEdit = Box<dyn FnOnce(&mut Vec<Message>) + Send>;

/// Store trait for conversation persistence
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Summaries, most recently updated first
    async fn list(&self) -> Result<Vec<ConversationSummary>>;

    async fn get(&self, id: &str) -> Result<Option<Conversation>>;

    async fn create(&self, title: &str, messages: Vec<Message>) -> Result<Conversation>;

    /// Replace the title and/or the message list. `None` when the id is unknown.
    async fn update(
        &self,
        id: &str,
        title: Option<String>,
        messages: Option<Vec<Message>>,
    ) -> Result<Option<Conversation>>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// Atomic read-modify-write of the message list. `None` when the id is unknown.
    async fn modify(&self, id: &str, edit: MessageEdit) -> Result<Option<Conversation>>;
}

/// One async mutex per conversation id
#[derive(Default)]
pub struct WriteLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WriteLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive write access to `id`
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry of a deleted conversation
    pub fn forget(&self, id: &str) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

/// In-memory conversation store (for development/testing)
#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn list(&self) -> Result<Vec<ConversationSummary>> {
        let conversations = self.conversations.read().unwrap_or_else(PoisonError::into_inner);
        let mut result: Vec<_> = conversations.values().map(Conversation::summary).collect();
        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(result)
    }

    async fn get(&self, id: &str) -> Result<Option<Conversation>> {
        let conversations = self.conversations.read().unwrap_or_else(PoisonError::into_inner);
        Ok(conversations.get(id).cloned())
    }

    async fn create(&self, title: &str, messages: Vec<Message>) -> Result<Conversation> {
        let conversation = Conversation::new(title, messages);
        self.conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn update(
        &self,
        id: &str,
        title: Option<String>,
        messages: Option<Vec<Message>>,
    ) -> Result<Option<Conversation>> {
        let mut conversations = self.conversations.write().unwrap_or_else(PoisonError::into_inner);
        Ok(conversations.get_mut(id).map(|conversation| {
            if let Some(title) = title {
                conversation.title = title;
            }
            if let Some(messages) = messages {
                conversation.messages = messages;
            }
            conversation.touch();
            conversation.clone()
        }))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        Ok(())
    }

    async fn modify(&self, id: &str, edit: MessageEdit) -> Result<Option<Conversation>> {
        let mut conversations = self.conversations.write().unwrap_or_else(PoisonError::into_inner);
        Ok(conversations.get_mut(id).map(|conversation| {
            edit(&mut conversation.messages);
            conversation.touch();
            conversation.clone()
        }))
    }
}
