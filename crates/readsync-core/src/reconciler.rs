//! Matches read receipts to stored outgoing messages and applies them once.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::batcher::UpdateBatcher;
use crate::clock::Clock;
use crate::early::EarlyReceiptIndex;
use crate::error::{ReceiptError, StoreError};
use crate::gateway::{ConversationDirectory, MessageStore};
use crate::model::{Conversation, Message, ReadReceipt, ReceiptPayload};
use crate::notify::DebouncedRefresh;
use crate::outcome::{PendingSummary, ReceiptObserver, ReceiptOutcome};
use crate::queue::ReceiptQueue;
use crate::registry::{with_message, LiveMessage, MessageRegistry};

pub struct Reconciler {
    queue: Arc<ReceiptQueue>,
    early: EarlyReceiptIndex,
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn ConversationDirectory>,
    registry: MessageRegistry,
    batcher: Arc<UpdateBatcher>,
    refresh: Arc<DebouncedRefresh>,
    clock: Arc<dyn Clock>,
    observer: Option<Arc<dyn ReceiptObserver>>,
}

impl Reconciler {
    pub fn new(
        queue: Arc<ReceiptQueue>,
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn ConversationDirectory>,
        registry: MessageRegistry,
        batcher: Arc<UpdateBatcher>,
        refresh: Arc<DebouncedRefresh>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            early: EarlyReceiptIndex::new(Arc::clone(&queue)),
            queue,
            store,
            directory,
            registry,
            batcher,
            refresh,
            clock,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ReceiptObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn queue(&self) -> &Arc<ReceiptQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    /// Validate an inbound payload and reconcile it.
    pub async fn ingest(&self, payload: ReceiptPayload) -> Result<ReceiptOutcome, ReceiptError> {
        let receipt = ReadReceipt::try_from(payload).map_err(|e| {
            warn!(error = %e, "rejecting malformed read receipt");
            e
        })?;
        Ok(self.on_receipt(receipt).await)
    }

    /// Entry point for one inbound read receipt.
    ///
    /// The receipt is queued first, so a receipt without a matching message
    /// stays pending for [`Reconciler::apply_early_receipts`] or a later retry.
    /// Never fails: collaborator errors are reported through the outcome.
    pub async fn on_receipt(&self, receipt: ReadReceipt) -> ReceiptOutcome {
        self.queue.add(receipt.clone());
        self.process(receipt).await
    }

    /// Retry every receipt currently pending.
    pub async fn process_pending(&self) -> PendingSummary {
        let mut summary = PendingSummary::default();
        for receipt in self.queue.drain() {
            let outcome = self.process(receipt).await;
            summary.record(&outcome);
        }
        if summary != PendingSummary::default() {
            debug!(?summary, "processed pending read receipts");
        }
        summary
    }

    /// Pending receipts for `message`, removed from the queue.
    pub fn for_message(&self, conversation: &Conversation, message: &Message) -> Vec<ReadReceipt> {
        self.early.for_message(conversation, message)
    }

    /// Register a freshly stored or loaded message and apply any receipts that
    /// arrived before it.
    pub fn apply_early_receipts(
        &self,
        conversation: &Conversation,
        message: Message,
    ) -> LiveMessage {
        let live = self.registry.register(message);
        let snapshot = with_message(&live, |m| m.clone());
        let receipts = self.for_message(conversation, &snapshot);
        if receipts.is_empty() {
            return live;
        }

        let now = self.clock.now_millis();
        let updated = with_message(&live, |m| {
            for receipt in &receipts {
                m.mark_read_by(receipt.reader(), now);
            }
            m.clone()
        });
        self.batcher.queue_update_message(updated);
        self.refresh.touch(&conversation.id);

        if let Some(observer) = &self.observer {
            let outcome = ReceiptOutcome::Applied {
                message_id: snapshot.id.clone(),
                conversation_id: conversation.id.clone(),
            };
            for receipt in &receipts {
                observer.on_outcome(receipt, &outcome);
            }
        }
        live
    }

    async fn process(&self, receipt: ReadReceipt) -> ReceiptOutcome {
        let outcome = match self.reconcile(&receipt).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    reader = receipt.reader(),
                    timestamp = receipt.timestamp(),
                    error = ?e,
                    "failed to process read receipt"
                );
                ReceiptOutcome::CollaboratorFailure {
                    error: e.to_string(),
                }
            }
        };

        if let Some(observer) = &self.observer {
            observer.on_outcome(&receipt, &outcome);
        }
        outcome
    }

    async fn reconcile(&self, receipt: &ReadReceipt) -> Result<ReceiptOutcome, StoreError> {
        let candidates = self.store.get_messages_by_sent_at(receipt.timestamp()).await?;
        let Some(target) = self.find_target(receipt.reader(), candidates).await? else {
            info!(
                reader = receipt.reader(),
                timestamp = receipt.timestamp(),
                "No message for read receipt"
            );
            return Ok(ReceiptOutcome::NoMatch);
        };

        // Claim before touching the message; whoever removes the receipt applies it.
        if !self.queue.remove(receipt) {
            debug!(
                reader = receipt.reader(),
                timestamp = receipt.timestamp(),
                "read receipt already claimed"
            );
            return Ok(ReceiptOutcome::AlreadyClaimed);
        }

        let live = self.registry.register(target);
        let now = self.clock.now_millis();
        let updated = with_message(&live, |m| {
            m.mark_read_by(receipt.reader(), now);
            m.clone()
        });
        debug!(
            reader = receipt.reader(),
            message_id = %updated.id,
            read_by = updated.read_by.len(),
            "applied read receipt"
        );

        let message_id = updated.id.clone();
        let conversation_id = updated.conversation_id.clone();
        self.batcher.queue_update_message(updated);
        self.refresh_conversation(&conversation_id).await;

        Ok(ReceiptOutcome::Applied {
            message_id,
            conversation_id,
        })
    }

    /// Direct match first, then a match through the reader's groups.
    async fn find_target(
        &self,
        reader: &str,
        mut candidates: Vec<Message>,
    ) -> Result<Option<Message>, StoreError> {
        if candidates.is_empty() {
            return Ok(None);
        }

        if let Some(pos) = candidates
            .iter()
            .position(|m| m.is_outgoing() && m.conversation_id == reader)
        {
            return Ok(Some(candidates.swap_remove(pos)));
        }

        let groups = self.store.get_all_groups_involving_id(reader).await?;
        let ids: HashSet<&str> = groups
            .iter()
            .map(|g| g.id.as_str())
            .chain(std::iter::once(reader))
            .collect();

        Ok(candidates
            .into_iter()
            .find(|m| m.is_outgoing() && ids.contains(m.conversation_id.as_str())))
    }

    async fn refresh_conversation(&self, conversation_id: &str) {
        match self.directory.get(conversation_id).await {
            Ok(Some(_)) => self.refresh.touch(conversation_id),
            Ok(None) => debug!(conversation_id, "no conversation to refresh"),
            Err(e) => warn!(
                conversation_id,
                error = %e,
                "could not resolve conversation for refresh"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SyncConfig;
    use crate::outcome::OutcomeLog;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        batcher: Arc<UpdateBatcher>,
        log: Arc<OutcomeLog>,
        reconciler: Reconciler,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        harness_with(store.clone(), store)
    }

    fn harness_with(store: Arc<MemoryStore>, gateway: Arc<dyn MessageStore>) -> Harness {
        let config = SyncConfig::default();
        let clock = Arc::new(ManualClock::new(50_000));
        let queue = Arc::new(ReceiptQueue::new(&config, clock.clone()));
        build(store, gateway, clock, queue)
    }

    fn build(
        store: Arc<MemoryStore>,
        gateway: Arc<dyn MessageStore>,
        clock: Arc<ManualClock>,
        queue: Arc<ReceiptQueue>,
    ) -> Harness {
        let config = SyncConfig::default();
        let batcher = Arc::new(UpdateBatcher::spawn(store.clone(), &config));
        let refresh = Arc::new(DebouncedRefresh::spawn(config.debounce()));
        let log = Arc::new(OutcomeLog::new());
        let reconciler = Reconciler::new(
            queue,
            gateway,
            store.clone(),
            MessageRegistry::new(&config),
            batcher.clone(),
            refresh,
            clock.clone(),
        )
        .with_observer(log.clone());

        Harness {
            store,
            clock,
            batcher,
            log,
            reconciler,
        }
    }

    fn applied(message_id: &str, conversation_id: &str) -> ReceiptOutcome {
        ReceiptOutcome::Applied {
            message_id: message_id.into(),
            conversation_id: conversation_id.into(),
        }
    }

    fn receipt(reader: &str, timestamp: i64) -> ReadReceipt {
        ReadReceipt::new(reader, timestamp).expect("valid receipt")
    }

    fn live_read_by(h: &Harness, id: &str) -> Vec<String> {
        let live = h.reconciler.registry().get(id).expect("message is live");
        with_message(&live, |m| m.read_by.clone())
    }

    #[tokio::test]
    async fn direct_match_is_applied_and_persisted() {
        let h = harness();
        h.store.insert_conversation(Conversation::private("B"));
        h.store.insert_message(Message::outgoing("5", "B", 1000));

        let outcome = h.reconciler.on_receipt(receipt("B", 1000)).await;

        assert_eq!(outcome, applied("5", "B"));
        assert!(h.reconciler.queue().is_empty());

        h.batcher.flush().await;
        let stored = h.store.message("5").expect("stored message");
        assert_eq!(stored.read_by, vec!["B".to_string()]);
        assert_eq!(stored.expiration_start_timestamp, Some(50_000));
        assert!(stored.sent);
    }

    #[tokio::test]
    async fn same_receipt_twice_reads_once() {
        let h = harness();
        h.store.insert_message(Message::outgoing("5", "B", 1000));

        assert!(h.reconciler.on_receipt(receipt("B", 1000)).await.is_applied());
        assert!(h.reconciler.on_receipt(receipt("B", 1000)).await.is_applied());

        assert_eq!(live_read_by(&h, "5"), vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn direct_match_takes_precedence_over_group_match() {
        let h = harness();
        h.store.insert_conversation(Conversation::group("G", ["P", "Q"]));
        h.store.insert_message(Message::outgoing("1", "P", 1000));
        h.store.insert_message(Message::outgoing("2", "G", 1000));

        let outcome = h.reconciler.on_receipt(receipt("P", 1000)).await;
        assert_eq!(outcome, applied("1", "P"));
    }

    #[tokio::test]
    async fn group_match_when_direct_message_is_not_outgoing() {
        let h = harness();
        h.store.insert_conversation(Conversation::group("G", ["P", "Q"]));
        h.store.insert_message(Message::incoming("1", "P", 1000));
        h.store.insert_message(Message::outgoing("2", "G", 1000));

        let outcome = h.reconciler.on_receipt(receipt("P", 1000)).await;
        assert_eq!(outcome, applied("2", "G"));
        assert_eq!(live_read_by(&h, "2"), vec!["P".to_string()]);
    }

    #[tokio::test]
    async fn group_the_reader_is_not_in_does_not_match() {
        let h = harness();
        h.store.insert_conversation(Conversation::group("G", ["Q", "R"]));
        h.store.insert_message(Message::outgoing("2", "G", 1000));

        assert_eq!(h.reconciler.on_receipt(receipt("P", 1000)).await, ReceiptOutcome::NoMatch);
        assert!(h.reconciler.queue().contains(&receipt("P", 1000)));
    }

    #[tokio::test]
    async fn unmatched_receipt_stays_pending() {
        let h = harness();

        let outcome = h.reconciler.on_receipt(receipt("B", 1000)).await;

        assert_eq!(outcome, ReceiptOutcome::NoMatch);
        assert!(outcome.is_pending());
        assert_eq!(h.reconciler.queue().pending(), vec![receipt("B", 1000)]);
    }

    #[tokio::test]
    async fn first_read_starts_the_expiration_timer() {
        let h = harness();
        h.store.insert_conversation(Conversation::group("G", ["A", "C"]));
        h.store.insert_message(Message::outgoing("7", "G", 1000).with_expire_timer(60));

        assert!(h.reconciler.on_receipt(receipt("A", 1000)).await.is_applied());
        h.clock.advance(10_000);
        assert!(h.reconciler.on_receipt(receipt("C", 1000)).await.is_applied());

        let live = h.reconciler.registry().get("7").expect("message is live");
        let message = with_message(&live, |m| m.clone());
        assert_eq!(message.read_by, vec!["A".to_string(), "C".to_string()]);
        assert_eq!(message.expiration_start_timestamp, Some(50_000));
        assert_eq!(message.expires_at, Some(110_000));
    }

    #[tokio::test]
    async fn reads_survive_the_live_copy_leaving_the_registry() {
        let h = harness();
        h.store.insert_conversation(Conversation::group("G", ["A", "C"]));
        h.store.insert_message(Message::outgoing("7", "G", 1000).with_expire_timer(60));

        assert!(h.reconciler.on_receipt(receipt("A", 1000)).await.is_applied());
        // evicted while A's update is still waiting in the batcher
        h.reconciler.registry().unregister("7");
        h.clock.advance(10_000);
        assert!(h.reconciler.on_receipt(receipt("C", 1000)).await.is_applied());

        h.batcher.flush().await;
        let stored = h.store.message("7").expect("stored message");
        assert_eq!(stored.read_by, vec!["A".to_string(), "C".to_string()]);
        assert_eq!(stored.expiration_start_timestamp, Some(50_000));
        assert_eq!(stored.expires_at, Some(110_000));
    }

    #[tokio::test]
    async fn storage_failure_keeps_receipt_for_retry() {
        let h = harness();
        h.store.insert_message(Message::outgoing("5", "B", 1000));
        h.store.fail_reads(true);

        let outcome = h.reconciler.on_receipt(receipt("B", 1000)).await;
        assert!(matches!(outcome, ReceiptOutcome::CollaboratorFailure { .. }));
        assert!(h.reconciler.queue().contains(&receipt("B", 1000)));

        h.store.fail_reads(false);
        let summary = h.reconciler.process_pending().await;
        let expected = PendingSummary {
            applied: 1,
            ..PendingSummary::default()
        };
        assert_eq!(summary, expected);
        assert!(h.reconciler.queue().is_empty());

        let outcomes: Vec<ReceiptOutcome> = h.log.entries().into_iter().map(|(_, o)| o).collect();
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0], ReceiptOutcome::CollaboratorFailure { .. }));
        assert!(outcomes[1].is_applied());
    }

    #[tokio::test]
    async fn directory_failure_does_not_undo_the_read() {
        let h = harness();
        h.store.insert_message(Message::outgoing("5", "B", 1000));
        h.store.fail_directory(true);

        assert!(h.reconciler.on_receipt(receipt("B", 1000)).await.is_applied());
        assert!(h.reconciler.queue().is_empty());
        assert_eq!(live_read_by(&h, "5"), vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn end_state_does_not_depend_on_arrival_order() {
        let conversation = Conversation::private("B");

        // receipt first
        let early = harness();
        early.store.insert_conversation(conversation.clone());
        assert_eq!(early.reconciler.on_receipt(receipt("B", 1000)).await, ReceiptOutcome::NoMatch);
        let message = Message::outgoing("5", "B", 1000);
        early.store.insert_message(message.clone());
        early.reconciler.apply_early_receipts(&conversation, message.clone());

        // message first
        let late = harness();
        late.store.insert_conversation(conversation.clone());
        late.store.insert_message(message.clone());
        late.reconciler.apply_early_receipts(&conversation, message);
        assert!(late.reconciler.on_receipt(receipt("B", 1000)).await.is_applied());

        assert_eq!(live_read_by(&early, "5"), live_read_by(&late, "5"));
        assert_eq!(live_read_by(&early, "5"), vec!["B".to_string()]);
        assert!(early.reconciler.queue().is_empty());
        assert!(late.reconciler.queue().is_empty());
    }

    #[tokio::test]
    async fn malformed_payload_never_reaches_the_queue() {
        let h = harness();
        let payload = ReceiptPayload {
            reader: None,
            timestamp: Some(1000),
        };

        assert_eq!(h.reconciler.ingest(payload).await, Err(ReceiptError::MissingReader));
        assert!(h.reconciler.queue().is_empty());

        let payload = ReceiptPayload {
            reader: Some("B".into()),
            timestamp: Some(1000),
        };
        assert_eq!(h.reconciler.ingest(payload).await, Ok(ReceiptOutcome::NoMatch));
    }

    /// Store whose lookup lets an early-receipt scan claim the receipt first.
    struct ClaimingStore {
        inner: Arc<MemoryStore>,
        index: EarlyReceiptIndex,
        conversation: Conversation,
    }

    #[async_trait]
    impl MessageStore for ClaimingStore {
        async fn get_messages_by_sent_at(&self, sent_at: i64) -> Result<Vec<Message>, StoreError> {
            let messages = self.inner.get_messages_by_sent_at(sent_at).await?;
            for message in &messages {
                self.index.for_message(&self.conversation, message);
            }
            Ok(messages)
        }

        async fn get_all_groups_involving_id(
            &self,
            member_id: &str,
        ) -> Result<Vec<Conversation>, StoreError> {
            self.inner.get_all_groups_involving_id(member_id).await
        }

        async fn save_messages(&self, messages: Vec<Message>) -> Result<(), StoreError> {
            self.inner.save_messages(messages).await
        }
    }

    #[tokio::test]
    async fn receipt_claimed_elsewhere_is_not_applied_twice() {
        let store = Arc::new(MemoryStore::new());
        store.insert_message(Message::outgoing("5", "B", 1000));
        let clock = Arc::new(ManualClock::new(50_000));
        let queue = Arc::new(ReceiptQueue::new(&SyncConfig::default(), clock.clone()));
        let gateway = Arc::new(ClaimingStore {
            inner: store.clone(),
            index: EarlyReceiptIndex::new(queue.clone()),
            conversation: Conversation::private("B"),
        });
        let h = build(store, gateway, clock, queue);

        let outcome = h.reconciler.on_receipt(receipt("B", 1000)).await;

        assert_eq!(outcome, ReceiptOutcome::AlreadyClaimed);
        assert!(h.reconciler.queue().is_empty());
        assert!(h.reconciler.registry().get("5").is_none());
    }
}
