use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use moka::sync::Cache;

use crate::config::SyncConfig;
use crate::model::Message;

/// Shared handle to the in-memory instance of a message.
pub type LiveMessage = Arc<Mutex<Message>>;

/// Keeps one live instance per message id so that every mutation lands on the
/// copy the rest of the application is looking at.
#[derive(Clone)]
pub struct MessageRegistry {
    cache: Cache<String, LiveMessage>,
}

impl MessageRegistry {
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_capacity(config.registry_capacity, config.registry_idle())
    }

    pub fn with_capacity(capacity: u64, idle: Duration) -> Self {
        let cache = Cache::builder().max_capacity(capacity).time_to_idle(idle).build();
        Self { cache }
    }

    /// Return the live instance for `message.id`, adopting `message` if none is live.
    ///
    /// An already live instance wins over the freshly loaded copy, since it may
    /// carry mutations that are not persisted yet.
    pub fn register(&self, message: Message) -> LiveMessage {
        let id = message.id.clone();
        self.cache.get_with(id, move || Arc::new(Mutex::new(message)))
    }

    pub fn get(&self, message_id: &str) -> Option<LiveMessage> {
        self.cache.get(message_id)
    }

    /// Drop the live instance, e.g. once the message is deleted.
    pub fn unregister(&self, message_id: &str) {
        self.cache.invalidate(message_id);
    }
}

/// Run `f` against the live message.
pub fn with_message<R>(live: &LiveMessage, f: impl FnOnce(&mut Message) -> R) -> R {
    let mut guard = live.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_returns_the_existing_live_instance() {
        let registry = MessageRegistry::new(&SyncConfig::default());

        let first = registry.register(Message::outgoing("5", "B", 1000));
        with_message(&first, |m| m.read_by.push("B".into()));

        // a stale copy from storage does not replace the live one
        let second = registry.register(Message::outgoing("5", "B", 1000));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(with_message(&second, |m| m.read_by.clone()), vec!["B".to_string()]);
    }

    #[test]
    fn unregister_drops_the_live_instance() {
        let registry = MessageRegistry::new(&SyncConfig::default());
        registry.register(Message::outgoing("5", "B", 1000));
        assert!(registry.get("5").is_some());

        registry.unregister("5");
        assert!(registry.get("5").is_none());
    }
}
