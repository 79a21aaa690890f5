//! Write-behind queue for message updates.
//!
//! Updates are coalesced by message id and written through
//! [`MessageStore::save_messages`] once a batch fills up or the flush interval
//! elapses. Coalescing merges reads rather than replacing them, since an
//! update may come from a copy loaded before the previous one was written.
//! Write failures are logged and counted, never retried here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error};

use crate::config::SyncConfig;
use crate::gateway::MessageStore;
use crate::model::Message;

enum Command {
    Update(Message),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Default)]
struct Batch {
    messages: Vec<Message>,
    index: HashMap<String, usize>,
}

impl Batch {
    fn push(&mut self, message: Message) {
        match self.index.get(&message.id) {
            Some(&slot) => self.messages[slot].absorb(message),
            None => {
                self.index.insert(message.id.clone(), self.messages.len());
                self.messages.push(message);
            }
        }
    }

    fn len(&self) -> usize {
        self.messages.len()
    }

    fn take(&mut self) -> Vec<Message> {
        self.index.clear();
        std::mem::take(&mut self.messages)
    }
}

/// Handle to the background writer.
pub struct UpdateBatcher {
    tx: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
    failed_writes: Arc<AtomicU64>,
}

impl UpdateBatcher {
    pub fn spawn(store: Arc<dyn MessageStore>, config: &SyncConfig) -> Self {
        Self::spawn_with(store, config.batch_max, config.batch_flush())
    }

    pub fn spawn_with(
        store: Arc<dyn MessageStore>,
        max_batch: usize,
        flush_interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let failed_writes = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run(
            store,
            rx,
            max_batch.max(1),
            flush_interval,
            Arc::clone(&failed_writes),
        ));

        Self {
            tx,
            task: Mutex::new(Some(task)),
            failed_writes,
        }
    }

    /// Enqueue a message record for durable update. Never blocks.
    pub fn queue_update_message(&self, message: Message) {
        let id = message.id.clone();
        if self.tx.send(Command::Update(message)).is_err() {
            error!(message_id = %id, "update batcher is stopped, dropping message update");
        }
    }

    /// Write everything queued so far and wait for the write to finish.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Flush and stop the background writer.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("update batcher task ended abnormally: {e}");
            }
        }
    }

    /// Number of batches the store refused.
    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::Relaxed)
    }
}

async fn run(
    store: Arc<dyn MessageStore>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    max_batch: usize,
    flush_interval: Duration,
    failed_writes: Arc<AtomicU64>,
) {
    let mut batch = Batch::default();
    let mut deadline: Option<Instant> = None;

    loop {
        let command = tokio::select! {
            command = rx.recv() => command,
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                write(store.as_ref(), &mut batch, &failed_writes).await;
                continue;
            }
        };

        match command {
            Some(Command::Update(message)) => {
                batch.push(message);
                if batch.len() >= max_batch {
                    deadline = None;
                    write(store.as_ref(), &mut batch, &failed_writes).await;
                } else if deadline.is_none() {
                    deadline = Some(Instant::now() + flush_interval);
                }
            }
            Some(Command::Flush(ack)) => {
                deadline = None;
                write(store.as_ref(), &mut batch, &failed_writes).await;
                let _ = ack.send(());
            }
            Some(Command::Shutdown(ack)) => {
                write(store.as_ref(), &mut batch, &failed_writes).await;
                let _ = ack.send(());
                break;
            }
            None => {
                write(store.as_ref(), &mut batch, &failed_writes).await;
                break;
            }
        }
    }
    debug!("update batcher stopped");
}

async fn write(store: &dyn MessageStore, batch: &mut Batch, failed_writes: &AtomicU64) {
    let messages = batch.take();
    if messages.is_empty() {
        return;
    }
    let count = messages.len();
    match store.save_messages(messages).await {
        Ok(()) => debug!(count, "persisted message updates"),
        Err(e) => {
            failed_writes.fetch_add(1, Ordering::Relaxed);
            error!(count, error = %e, "failed to persist message updates");
        }
    }
}
