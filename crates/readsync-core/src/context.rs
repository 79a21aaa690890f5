//! Owner of the receipt engine's process-wide state.
//!
//! A `ReceiptSync` is created at startup and torn down with [`ReceiptSync::shutdown`].
//! It builds the queue, registry, writer and refresh notifier, wires them into a
//! [`Reconciler`], and runs the maintenance loop that evicts stale receipts and
//! retries pending ones.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::batcher::UpdateBatcher;
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::gateway::{ConversationDirectory, MessageStore};
use crate::notify::{ConversationRefresh, DebouncedRefresh};
use crate::outcome::{ReceiptObserver, TracingObserver};
use crate::queue::ReceiptQueue;
use crate::reconciler::Reconciler;
use crate::registry::MessageRegistry;

pub struct ReceiptSyncBuilder {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn ReceiptObserver>,
    maintenance: bool,
}

impl ReceiptSyncBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the default [`TracingObserver`].
    pub fn observer(mut self, observer: Arc<dyn ReceiptObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Do not spawn the periodic eviction and retry loop.
    pub fn without_maintenance(mut self) -> Self {
        self.maintenance = false;
        self
    }

    /// Validate the config and start the engine. Must run inside a tokio runtime.
    pub fn start(
        self,
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn ConversationDirectory>,
    ) -> Result<ReceiptSync> {
        self.config.validate()?;

        let queue = Arc::new(ReceiptQueue::new(&self.config, Arc::clone(&self.clock)));
        let registry = MessageRegistry::new(&self.config);
        let batcher = Arc::new(UpdateBatcher::spawn(Arc::clone(&store), &self.config));
        let refresh = Arc::new(DebouncedRefresh::spawn(self.config.debounce()));

        let reconciler = Reconciler::new(
            queue,
            store,
            directory,
            registry,
            Arc::clone(&batcher),
            Arc::clone(&refresh),
            self.clock,
        )
        .with_observer(self.observer);
        let reconciler = Arc::new(reconciler);

        let maintenance = self
            .maintenance
            .then(|| tokio::spawn(maintain(Arc::clone(&reconciler), self.config.clone())));

        info!(maintenance = self.maintenance, "receipt sync started");
        Ok(ReceiptSync {
            config: self.config,
            reconciler,
            batcher,
            refresh,
            maintenance: Mutex::new(maintenance),
        })
    }
}

pub struct ReceiptSync {
    config: SyncConfig,
    reconciler: Arc<Reconciler>,
    batcher: Arc<UpdateBatcher>,
    refresh: Arc<DebouncedRefresh>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl ReceiptSync {
    pub fn builder(config: SyncConfig) -> ReceiptSyncBuilder {
        ReceiptSyncBuilder {
            config,
            clock: Arc::new(SystemClock),
            observer: Arc::new(TracingObserver),
            maintenance: true,
        }
    }

    /// Start with the system clock, outcomes logged and the maintenance loop running.
    pub fn start(
        config: SyncConfig,
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn ConversationDirectory>,
    ) -> Result<Self> {
        Self::builder(config).start(store, directory)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn queue(&self) -> &Arc<ReceiptQueue> {
        self.reconciler.queue()
    }

    pub fn batcher(&self) -> &Arc<UpdateBatcher> {
        &self.batcher
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationRefresh> {
        self.refresh.subscribe()
    }

    /// Stop the maintenance loop, flush pending writes and stop the notifier.
    pub async fn shutdown(&self) {
        let maintenance = self.maintenance.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = maintenance {
            task.abort();
        }
        self.batcher.shutdown().await;
        self.refresh.shutdown();
        info!(pending = self.queue().len(), "receipt sync stopped");
    }
}

async fn maintain(reconciler: Arc<Reconciler>, config: SyncConfig) {
    let mut interval = tokio::time::interval(config.retry_interval());
    // the first tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        let evicted = reconciler.queue().evict_expired();
        let summary = reconciler.process_pending().await;
        debug!(evicted, ?summary, "receipt maintenance pass");
    }
}
