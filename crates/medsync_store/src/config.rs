//! Store configuration.

use crate::types::CURRENT_SYNC_TICK;
use std::time::Duration;

/// Configuration for a [`Store`](crate::Store).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Fact whose value stamps writes committed without an explicit tick.
    pub tick_fact_key: String,
    /// Maximum time to wait for the commit lock.
    pub lock_timeout: Duration,
    /// Vacuum after this many commits. `None` leaves vacuuming to the
    /// caller.
    pub auto_vacuum_every: Option<u64>,
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the fact used for tick stamping.
    #[must_use]
    pub fn with_tick_fact_key(mut self, key: impl Into<String>) -> Self {
        self.tick_fact_key = key.into();
        self
    }

    /// Sets the commit lock timeout.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets how many commits trigger an automatic vacuum.
    #[must_use]
    pub fn with_auto_vacuum_every(mut self, commits: Option<u64>) -> Self {
        self.auto_vacuum_every = commits;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            tick_fact_key: CURRENT_SYNC_TICK.to_string(),
            lock_timeout: Duration::from_secs(5),
            auto_vacuum_every: Some(1024),
        }
    }
}
