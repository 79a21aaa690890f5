//! Pending read receipts awaiting a matching message.
//!
//! Every operation is a single critical section on a std mutex which is never
//! held across an await, so queue membership changes are atomic with respect to
//! interleaved reconciler tasks. Removal doubles as the claim primitive: only the
//! caller that observes `remove` returning true may apply the receipt.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{trace, warn};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::model::{ReadReceipt, ReceiptKey};

#[derive(Debug, Clone)]
struct Entry {
    receipt: ReadReceipt,
    ingested_at: i64,
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    entries: BTreeMap<u64, Entry>,
    index: HashMap<ReceiptKey, u64>,
}

impl Inner {
    fn remove_seq(&mut self, seq: u64) -> Option<Entry> {
        let entry = self.entries.remove(&seq)?;
        self.index.remove(&entry.receipt.key());
        Some(entry)
    }
}

/// Ordered, deduplicating set of pending receipts.
pub struct ReceiptQueue {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    max_pending: usize,
    pending_ttl: Duration,
}

impl ReceiptQueue {
    pub fn new(config: &SyncConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_limits(config.max_pending, config.pending_ttl(), clock)
    }

    pub fn with_limits(max_pending: usize, pending_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            max_pending: max_pending.max(1),
            pending_ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a receipt unless an identical one is already pending.
    ///
    /// Returns true when a new entry was created. On overflow the oldest
    /// pending receipt is evicted.
    pub fn add(&self, receipt: ReadReceipt) -> bool {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        let key = receipt.key();
        if inner.index.contains_key(&key) {
            trace!(reader = %key.reader, timestamp = key.timestamp, "duplicate receipt absorbed");
            return false;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.index.insert(key, seq);
        inner.entries.insert(
            seq,
            Entry {
                receipt,
                ingested_at: now,
            },
        );

        while inner.entries.len() > self.max_pending {
            let Some(oldest) = inner.entries.keys().next().copied() else {
                break;
            };
            if let Some(evicted) = inner.remove_seq(oldest) {
                warn!(
                    reader = evicted.receipt.reader(),
                    timestamp = evicted.receipt.timestamp(),
                    max_pending = self.max_pending,
                    "pending receipt limit reached, evicting oldest receipt"
                );
            }
        }
        true
    }

    /// Remove a receipt by identity. Returns whether it was pending.
    pub fn remove(&self, receipt: &ReadReceipt) -> bool {
        let mut inner = self.lock();
        match inner.index.get(&receipt.key()).copied() {
            Some(seq) => inner.remove_seq(seq).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, receipt: &ReadReceipt) -> bool {
        self.lock().index.contains_key(&receipt.key())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Snapshot of the pending receipts in arrival order.
    pub fn pending(&self) -> Vec<ReadReceipt> {
        self.lock().entries.values().map(|e| e.receipt.clone()).collect()
    }

    /// Remove and return, in arrival order, every pending receipt matching `predicate`.
    pub fn take_matching<F>(&self, mut predicate: F) -> Vec<ReadReceipt>
    where
        F: FnMut(&ReadReceipt) -> bool,
    {
        let mut inner = self.lock();
        let seqs: Vec<u64> = inner
            .entries
            .iter()
            .filter(|(_, entry)| predicate(&entry.receipt))
            .map(|(seq, _)| *seq)
            .collect();

        seqs.into_iter()
            .filter_map(|seq| inner.remove_seq(seq))
            .map(|entry| entry.receipt)
            .collect()
    }

    /// Drop receipts that have been pending longer than the retention window.
    pub fn evict_expired(&self) -> usize {
        let ttl = i64::try_from(self.pending_ttl.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.clock.now_millis().saturating_sub(ttl);
        let mut inner = self.lock();
        let expired: Vec<u64> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.ingested_at < cutoff)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in &expired {
            if let Some(entry) = inner.remove_seq(*seq) {
                warn!(
                    reader = entry.receipt.reader(),
                    timestamp = entry.receipt.timestamp(),
                    "evicting read receipt that never matched a message"
                );
            }
        }
        expired.len()
    }

    /// Lazily iterate the receipts pending right now.
    ///
    /// Receipts removed during the scan are skipped, and receipts added after
    /// this call are not visited. Call again to restart.
    pub fn drain(self: &Arc<Self>) -> Drain {
        let end = self.lock().next_seq;
        Drain {
            queue: Arc::clone(self),
            cursor: None,
            end,
        }
    }
}

/// Iterator returned by [`ReceiptQueue::drain`].
pub struct Drain {
    queue: Arc<ReceiptQueue>,
    cursor: Option<u64>,
    end: u64,
}

impl Iterator for Drain {
    type Item = ReadReceipt;

    fn next(&mut self) -> Option<Self::Item> {
        let inner = self.queue.lock();
        let lower = match self.cursor {
            Some(seq) => Bound::Excluded(seq),
            None => Bound::Unbounded,
        };
        let (seq, entry) = inner.entries.range((lower, Bound::Excluded(self.end))).next()?;
        self.cursor = Some(*seq);
        Some(entry.receipt.clone())
    }
}
