//! Read-receipt reconciliation.
//!
//! Matches inbound "message was read" signals to locally stored outgoing
//! messages, resolves the reader through direct or group membership, and applies
//! each receipt exactly once whether it arrives before or after its message.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
// Allow unwrap/expect in test code for convenience
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod batcher;
pub mod clock;
pub mod config;
pub mod context;
pub mod early;
pub mod error;
pub mod gateway;
pub mod model;
pub mod notify;
pub mod outcome;
pub mod queue;
pub mod reconciler;
pub mod registry;
pub mod store;

pub use batcher::UpdateBatcher;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use context::{ReceiptSync, ReceiptSyncBuilder};
pub use early::EarlyReceiptIndex;
pub use error::{ConfigError, Error, ReceiptError, Result, StoreError};
pub use gateway::{ConversationDirectory, MessageStore};
pub use model::{
    Conversation, ConversationKind, Direction, Message, ReadReceipt, ReceiptKey, ReceiptPayload,
};
pub use notify::{ConversationRefresh, DebouncedRefresh};
pub use outcome::{OutcomeLog, PendingSummary, ReceiptObserver, ReceiptOutcome, TracingObserver};
pub use queue::ReceiptQueue;
pub use reconciler::Reconciler;
pub use registry::{with_message, LiveMessage, MessageRegistry};
pub use store::{MemoryStore, SledStore};
