use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::error::StoreError;
use crate::gateway::{ConversationDirectory, MessageStore};
use crate::model::{Conversation, ConversationKind, Message};

const MESSAGES_TREE: &str = "messages";
const SENT_AT_TREE: &str = "messages_by_sent_at";
const CONVERSATIONS_TREE: &str = "conversations";

/// sled-backed message store and conversation directory.
///
/// Records are stored as JSON. `messages_by_sent_at` maps
/// `sent_at (big-endian) ++ message id` to the message id.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    messages: sled::Tree,
    sent_at: sled::Tree,
    conversations: sled::Tree,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        debug!("opening sled message store at {}", path.display());
        Self::from_db(sled::open(path)?)
    }

    /// Store backed by a temporary database, removed on drop.
    pub fn temporary() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            messages: db.open_tree(MESSAGES_TREE)?,
            sent_at: db.open_tree(SENT_AT_TREE)?,
            conversations: db.open_tree(CONVERSATIONS_TREE)?,
            db,
        })
    }

    fn sent_at_key(sent_at: i64, id: &str) -> Vec<u8> {
        let mut key = sent_at.to_be_bytes().to_vec();
        key.extend_from_slice(id.as_bytes());
        key
    }

    pub fn insert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(conversation)?;
        self.conversations.insert(conversation.id.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn message(&self, id: &str) -> Result<Option<Message>, StoreError> {
        match self.messages.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn all_messages(&self) -> Result<Vec<Message>, StoreError> {
        self.messages
            .iter()
            .values()
            .map(|value| -> Result<Message, StoreError> {
                let value = value?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SledStore {
    async fn get_messages_by_sent_at(&self, sent_at: i64) -> Result<Vec<Message>, StoreError> {
        let mut found = Vec::new();
        for entry in self.sent_at.scan_prefix(sent_at.to_be_bytes()) {
            let (_, id) = entry?;
            if let Some(bytes) = self.messages.get(&id)? {
                found.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(found)
    }

    async fn get_all_groups_involving_id(
        &self,
        member_id: &str,
    ) -> Result<Vec<Conversation>, StoreError> {
        let mut groups = Vec::new();
        for value in self.conversations.iter().values() {
            let conversation: Conversation = serde_json::from_slice(&value?)?;
            if conversation.kind == ConversationKind::Group && conversation.involves(member_id) {
                groups.push(conversation);
            }
        }
        Ok(groups)
    }

    async fn save_messages(&self, messages: Vec<Message>) -> Result<(), StoreError> {
        for message in &messages {
            let bytes = serde_json::to_vec(message)?;
            self.messages.insert(message.id.as_bytes(), bytes)?;
            self.sent_at
                .insert(Self::sent_at_key(message.sent_at, &message.id), message.id.as_bytes())?;
        }
        self.flush().await
    }
}

#[async_trait]
impl ConversationDirectory for SledStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError> {
        match self.conversations.get(conversation_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_are_found_by_sent_at() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = SledStore::open(dir.path().join("readsync.db")).expect("open store");

        store
            .save_messages(vec![
                Message::outgoing("1", "B", 1000),
                Message::outgoing("2", "G", 1000),
                Message::outgoing("3", "B", 2000),
            ])
            .await
            .expect("save");

        let mut ids: Vec<String> = store
            .get_messages_by_sent_at(1000)
            .await
            .expect("lookup")
            .into_iter()
            .map(|m| m.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn saving_twice_replaces_the_record() {
        let store = SledStore::temporary().expect("temporary store");
        let mut message = Message::outgoing("1", "B", 1000);
        store.save_messages(vec![message.clone()]).await.expect("save");

        message.read_by.push("B".into());
        store.save_messages(vec![message.clone()]).await.expect("save again");

        let found = store.get_messages_by_sent_at(1000).await.expect("lookup");
        assert_eq!(found, vec![message.clone()]);
        assert_eq!(store.message("1").expect("read"), Some(message));
    }

    #[tokio::test]
    async fn groups_are_found_by_member() {
        let store = SledStore::temporary().expect("temporary store");
        store.insert_conversation(&Conversation::private("B")).expect("insert");
        store.insert_conversation(&Conversation::group("G1", ["A", "B"])).expect("insert");
        store.insert_conversation(&Conversation::group("G2", ["A", "C"])).expect("insert");

        let groups = store.get_all_groups_involving_id("B").await.expect("lookup");
        assert_eq!(groups, vec![Conversation::group("G1", ["A", "B"])]);

        let direct = ConversationDirectory::get(&store, "B").await.expect("lookup");
        assert_eq!(direct, Some(Conversation::private("B")));
    }
}
