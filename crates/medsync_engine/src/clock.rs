//! The global sync clock.
//!
//! The clock is a fact in the store, advanced two at a time. Each advance
//! yields a `tick` and a `tock`; the fact then holds `tock`. Plain writes
//! are stamped with the fact's value at commit, so a write committed after
//! a boundary `tick` was published always lands strictly above it.
//!
//! Writers that stamp their own commit hold a [`TickReservation`] on the
//! `tick` of their advance until the commit is visible. That value is never
//! the fact's value, so no plain write shares it.
//! [`SyncClock::publish_boundary`] waits for every reservation below the
//! boundary it publishes, so a reader that opens its snapshot after
//! publishing sees all of them.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use medsync_store::{Store, Tick};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of one clock advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickTock {
    /// Boundary value: everything at or below it is published.
    pub tick: Tick,
    /// New current tick, used to stamp writes.
    pub tock: Tick,
}

/// Ticks reserved by writers that have not finished committing.
#[derive(Debug, Default)]
struct PendingTicks {
    /// Reserved tick -> number of holders.
    ticks: Mutex<BTreeMap<Tick, usize>>,
    released: Condvar,
}

/// Handle to the global sync clock.
#[derive(Debug, Clone)]
pub struct SyncClock {
    store: Store,
    retry: RetryConfig,
    pending: Arc<PendingTicks>,
}

impl SyncClock {
    /// Creates a clock over the store's current-tick fact.
    pub fn new(store: Store, retry: RetryConfig) -> Self {
        Self {
            store,
            retry,
            pending: Arc::new(PendingTicks::default()),
        }
    }

    fn fact_key(&self) -> &str {
        &self.store.config().tick_fact_key
    }

    /// Returns the current tick (zero before the first advance).
    pub fn current_tick(&self) -> SyncResult<Tick> {
        Ok(self.store.get_fact(self.fact_key())?.unwrap_or(0))
    }

    /// Advances the clock without reserving anything.
    ///
    /// Contention on the tick fact is retried with capped backoff until the
    /// advance goes through; only non-contention store failures are
    /// returned. Contention outlasting `max_attempts` is logged once as a
    /// warning.
    pub fn tick_tock(&self) -> SyncResult<TickTock> {
        let mut attempt: u32 = 0;
        loop {
            match self.store.increment_fact(self.fact_key(), 2) {
                Ok(tock) => {
                    if attempt > 0 {
                        debug!(attempts = attempt.saturating_add(1), tock, "sync clock advanced after contention");
                    } else {
                        debug!(tick = tock - 1, tock, "sync clock advanced");
                    }
                    return Ok(TickTock {
                        tick: tock - 1,
                        tock,
                    });
                }
                Err(err) if err.is_contention() => {
                    attempt = attempt.saturating_add(1);
                    if attempt == self.retry.max_attempts {
                        warn!(attempts = attempt, "sync clock still contended, retrying");
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(attempt, ?delay, "sync clock contended, retrying");
                    std::thread::sleep(delay);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Advances the clock and reserves the new tick for a write.
    ///
    /// The write must be stamped with [`TickReservation::tick`] and the
    /// reservation dropped once the write has committed or aborted. An
    /// aborted write leaves a gap in the tick sequence.
    pub fn reserve_and_advance(&self) -> SyncResult<TickReservation> {
        let mut pending = self.pending.ticks.lock();
        let TickTock { tick, .. } = self.tick_tock()?;
        *pending.entry(tick).or_insert(0) += 1;
        Ok(TickReservation {
            tick,
            pending: Arc::clone(&self.pending),
        })
    }

    /// Advances the clock and returns a boundary that no in-flight write can
    /// invalidate.
    ///
    /// Blocks until every reservation at or below the boundary is released.
    pub fn publish_boundary(&self) -> SyncResult<Tick> {
        let mut pending = self.pending.ticks.lock();
        let TickTock { tick, .. } = self.tick_tock()?;
        while pending.range(..=tick).next().is_some() {
            debug!(boundary = tick, "waiting for reserved ticks to commit");
            self.pending.released.wait(&mut pending);
        }
        Ok(tick)
    }

    /// Moves the clock forward to `tick` if it is behind. Returns the
    /// resulting current tick.
    pub fn fast_forward_to(&self, tick: Tick) -> SyncResult<Tick> {
        let current = self.current_tick()?;
        if tick <= current {
            return Ok(current);
        }
        Ok(self.store.increment_fact(self.fact_key(), tick - current)?)
    }

    /// Returns the number of outstanding reservations.
    pub fn pending_reservations(&self) -> usize {
        self.pending.ticks.lock().values().sum()
    }
}

/// A tick reserved for a write that has not finished committing.
///
/// Dropping the reservation releases it.
#[derive(Debug)]
#[must_use = "a reservation is released as soon as it is dropped"]
pub struct TickReservation {
    tick: Tick,
    pending: Arc<PendingTicks>,
}

impl TickReservation {
    /// The reserved tick.
    pub fn tick(&self) -> Tick {
        self.tick
    }
}

impl Drop for TickReservation {
    fn drop(&mut self) {
        let mut ticks = self.pending.ticks.lock();
        if let Some(holders) = ticks.get_mut(&self.tick) {
            *holders -= 1;
            if *holders == 0 {
                ticks.remove(&self.tick);
            }
        }
        drop(ticks);
        self.pending.released.notify_all();
    }
}
