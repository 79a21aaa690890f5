use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Tunables for the receipt engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Quiet period before a conversation refresh is emitted
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// How long an unmatched receipt may stay pending
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,

    /// Upper bound on pending receipts; the oldest is evicted on overflow
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    /// Interval of the maintenance loop (eviction + pending retry)
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Largest number of message updates written in one batch
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,

    /// Longest time a message update waits before being written
    #[serde(default = "default_batch_flush_ms")]
    pub batch_flush_ms: u64,

    /// Number of live messages kept in the registry
    #[serde(default = "default_registry_capacity")]
    pub registry_capacity: u64,

    /// Idle time after which a live message leaves the registry
    #[serde(default = "default_registry_idle_secs")]
    pub registry_idle_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            pending_ttl_secs: default_pending_ttl_secs(),
            max_pending: default_max_pending(),
            retry_interval_secs: default_retry_interval_secs(),
            batch_max: default_batch_max(),
            batch_flush_ms: default_batch_flush_ms(),
            registry_capacity: default_registry_capacity(),
            registry_idle_secs: default_registry_idle_secs(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    200
}

fn default_pending_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_max_pending() -> usize {
    10_000
}

fn default_retry_interval_secs() -> u64 {
    30
}

fn default_batch_max() -> usize {
    50
}

fn default_batch_flush_ms() -> u64 {
    500
}

fn default_registry_capacity() -> u64 {
    5_000
}

fn default_registry_idle_secs() -> u64 {
    600
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn batch_flush(&self) -> Duration {
        Duration::from_millis(self.batch_flush_ms)
    }

    pub fn registry_idle(&self) -> Duration {
        Duration::from_secs(self.registry_idle_secs)
    }

    /// Rejects values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pending == 0 {
            return Err(ConfigError::invalid("max_pending", "must be at least 1"));
        }
        if self.pending_ttl_secs == 0 {
            return Err(ConfigError::invalid("pending_ttl_secs", "must be greater than zero"));
        }
        if self.retry_interval_secs == 0 {
            return Err(ConfigError::invalid("retry_interval_secs", "must be greater than zero"));
        }
        if self.batch_max == 0 {
            return Err(ConfigError::invalid("batch_max", "must be at least 1"));
        }
        if self.batch_flush_ms == 0 {
            return Err(ConfigError::invalid("batch_flush_ms", "must be greater than zero"));
        }
        if self.registry_capacity == 0 {
            return Err(ConfigError::invalid("registry_capacity", "must be at least 1"));
        }
        if self.registry_idle_secs == 0 {
            return Err(ConfigError::invalid("registry_idle_secs", "must be greater than zero"));
        }
        if self.registry_idle() < self.batch_flush() {
            return Err(ConfigError::invalid(
                "registry_idle_secs",
                "must not be shorter than batch_flush_ms",
            ));
        }
        debug!(?self, "receipt engine config validated");
        Ok(())
    }
}
