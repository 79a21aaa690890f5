use std::sync::Arc;

use tracing::info;

use crate::model::{Conversation, Message, ReadReceipt};
use crate::queue::ReceiptQueue;

/// Finds receipts that arrived before the message they acknowledge.
#[derive(Clone)]
pub struct EarlyReceiptIndex {
    queue: Arc<ReceiptQueue>,
}

impl EarlyReceiptIndex {
    pub fn new(queue: Arc<ReceiptQueue>) -> Self {
        Self { queue }
    }

    /// Take every pending receipt for `message`.
    ///
    /// A receipt matches when its timestamp equals the message's `sent_at` and
    /// its reader belongs to `conversation`. Matches are removed from the queue
    /// in the same critical section that finds them. Incoming messages never
    /// match and leave the queue untouched.
    pub fn for_message(&self, conversation: &Conversation, message: &Message) -> Vec<ReadReceipt> {
        if !message.is_outgoing() {
            return Vec::new();
        }

        let readers = conversation.receipt_readers();
        let receipts = self.queue.take_matching(|receipt| {
            receipt.timestamp() == message.sent_at
                && readers.iter().any(|reader| *reader == receipt.reader())
        });

        if !receipts.is_empty() {
            info!(
                message_id = %message.id,
                conversation_id = %conversation.id,
                count = receipts.len(),
                "Found early read receipts for message"
            );
        }
        receipts
    }
}
