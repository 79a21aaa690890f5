use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::gateway::{ConversationDirectory, MessageStore};
use crate::model::{Conversation, ConversationKind, Message};

#[derive(Default)]
struct State {
    messages: BTreeMap<String, Message>,
    conversations: BTreeMap<String, Conversation>,
    save_calls: Vec<usize>,
}

/// In-memory message store and conversation directory.
///
/// Reads, writes and directory lookups can be made to fail independently.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_directory: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_message(&self, message: Message) {
        self.state().messages.insert(message.id.clone(), message);
    }

    pub fn insert_conversation(&self, conversation: Conversation) {
        self.state().conversations.insert(conversation.id.clone(), conversation);
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        self.state().messages.get(id).cloned()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state().messages.values().cloned().collect()
    }

    /// Sizes of the batches written so far, in order.
    pub fn save_calls(&self) -> Vec<usize> {
        self.state().save_calls.clone()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_directory(&self, fail: bool) {
        self.fail_directory.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn get_messages_by_sent_at(&self, sent_at: i64) -> Result<Vec<Message>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("message lookup failed".to_string()));
        }
        Ok(self
            .state()
            .messages
            .values()
            .filter(|m| m.sent_at == sent_at)
            .cloned()
            .collect())
    }

    async fn get_all_groups_involving_id(
        &self,
        member_id: &str,
    ) -> Result<Vec<Conversation>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("group lookup failed".to_string()));
        }
        Ok(self
            .state()
            .conversations
            .values()
            .filter(|c| c.kind == ConversationKind::Group && c.involves(member_id))
            .cloned()
            .collect())
    }

    async fn save_messages(&self, messages: Vec<Message>) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("message write failed".to_string()));
        }
        let mut state = self.state();
        state.save_calls.push(messages.len());
        for message in messages {
            state.messages.insert(message.id.clone(), message);
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationDirectory for MemoryStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError> {
        if self.fail_directory.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("conversation lookup failed".to_string()));
        }
        Ok(self.state().conversations.get(conversation_id).cloned())
    }
}
