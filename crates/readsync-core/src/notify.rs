//! Debounced "conversation summary changed" signal for the UI layer.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

/// Emitted once per quiet period for a conversation whose last-activity summary may have changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRefresh {
    pub conversation_id: String,
}

/// Coalesces bursts of touches per conversation into a single refresh.
///
/// Each touch restarts the conversation's window; the refresh fires when the
/// window closes without another touch.
pub struct DebouncedRefresh {
    touches: mpsc::UnboundedSender<String>,
    events: broadcast::Sender<ConversationRefresh>,
    task: JoinHandle<()>,
}

impl DebouncedRefresh {
    pub fn spawn(window: Duration) -> Self {
        let (touches, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let task = tokio::spawn(run(rx, events.clone(), window));
        Self {
            touches,
            events,
            task,
        }
    }

    pub fn touch(&self, conversation_id: &str) {
        trace!(conversation_id, "conversation refresh requested");
        let _ = self.touches.send(conversation_id.to_string());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationRefresh> {
        self.events.subscribe()
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for DebouncedRefresh {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    mut touches: mpsc::UnboundedReceiver<String>,
    events: broadcast::Sender<ConversationRefresh>,
    window: Duration,
) {
    let mut deadlines: HashMap<String, Instant> = HashMap::new();

    loop {
        let next = deadlines.values().min().copied();
        tokio::select! {
            touched = touches.recv() => match touched {
                Some(conversation_id) => {
                    deadlines.insert(conversation_id, Instant::now() + window);
                }
                None => break,
            },
            _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                let now = Instant::now();
                let due: Vec<String> = deadlines
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                for conversation_id in due {
                    deadlines.remove(&conversation_id);
                    debug!(conversation_id = %conversation_id, "refreshing conversation summary");
                    // no subscribers is fine
                    let _ = events.send(ConversationRefresh { conversation_id });
                }
            }
        }
    }
}
