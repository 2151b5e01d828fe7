//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// Configuration for the central sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound on the changes returned by one outgoing page.
    pub max_records_per_chunk: usize,
    /// Maximum number of sessions that may be active at once.
    pub max_concurrent_sessions: usize,
    /// Maximum number of pull snapshots planned at once. Further plans
    /// wait for a free slot.
    pub max_concurrent_snapshots: usize,
    /// Sessions older than this are failed on their next connection, and
    /// sessions idle for longer no longer count against the session limit.
    pub session_timeout: Option<Duration>,
    /// Idle time after which a session is purged.
    pub lapsed_session_after: Duration,
    /// Run session preparation, pull planning and push persistence on the
    /// calling thread instead of a background thread.
    pub await_background_work: bool,
    /// Refuse to prepare sessions before the lookup table has been built.
    pub require_lookup_table: bool,
    /// Backoff for contended clock advances. The clock retries until it
    /// advances; `max_attempts` only decides when the contention is logged
    /// as a warning.
    pub clock_retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            max_records_per_chunk: 1000,
            max_concurrent_sessions: 64,
            max_concurrent_snapshots: 8,
            session_timeout: Some(Duration::from_secs(60 * 60)),
            lapsed_session_after: Duration::from_secs(2 * 60 * 60),
            await_background_work: false,
            require_lookup_table: true,
            clock_retry: RetryConfig::new(5)
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(500)),
        }
    }

    /// Sets the outgoing page bound.
    pub fn with_max_records_per_chunk(mut self, max: usize) -> Self {
        self.max_records_per_chunk = max;
        self
    }

    /// Sets the concurrent session limit.
    pub fn with_max_concurrent_sessions(mut self, max: usize) -> Self {
        self.max_concurrent_sessions = max;
        self
    }

    /// Sets how many snapshots may be planned at once.
    pub fn with_max_concurrent_snapshots(mut self, max: usize) -> Self {
        self.max_concurrent_snapshots = max;
        self
    }

    /// Sets the session timeout. `None` disables it.
    pub fn with_session_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Sets the idle time after which sessions are purged.
    pub fn with_lapsed_session_after(mut self, after: Duration) -> Self {
        self.lapsed_session_after = after;
        self
    }

    /// Runs background work on the calling thread.
    pub fn with_await_background_work(mut self, inline: bool) -> Self {
        self.await_background_work = inline;
        self
    }

    /// Sets whether sessions require a built lookup table.
    pub fn with_require_lookup_table(mut self, require: bool) -> Self {
        self.require_lookup_table = require;
        self
    }

    /// Sets the retry policy for clock reservations.
    pub fn with_clock_retry(mut self, retry: RetryConfig) -> Self {
        self.clock_retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
