use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{Conversation, Message};

/// Storage gateway the receipt engine reads messages from and writes them back to.
///
/// Implementations own message persistence; the engine never keeps its own
/// durable copy.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// All messages sent at `sent_at`, across every conversation.
    ///
    /// Sent-at collisions are possible, so this may return several messages.
    async fn get_messages_by_sent_at(&self, sent_at: i64) -> Result<Vec<Message>, StoreError>;

    /// Every group conversation that lists `member_id` as a member.
    async fn get_all_groups_involving_id(
        &self,
        member_id: &str,
    ) -> Result<Vec<Conversation>, StoreError>;

    /// Durably write a batch of message records, replacing existing ones by id.
    async fn save_messages(&self, messages: Vec<Message>) -> Result<(), StoreError>;
}

/// Resolves conversation ids for the receipt engine.
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError>;
}
