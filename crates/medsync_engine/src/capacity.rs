//! Bounds how many pull snapshots are planned at once.

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Counting limit on concurrent snapshot planning, independent of the
/// session limit.
#[derive(Debug)]
pub struct SnapshotCapacity {
    max: usize,
    running: Mutex<usize>,
    freed: Condvar,
}

impl SnapshotCapacity {
    /// Allows up to `max` snapshots at once (at least one).
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            running: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    /// Blocks until a slot is free, then takes it.
    pub fn acquire(&self) -> SnapshotSlot<'_> {
        let mut running = self.running.lock();
        while *running >= self.max {
            debug!(running = *running, max = self.max, "waiting for snapshot capacity");
            self.freed.wait(&mut running);
        }
        *running += 1;
        SnapshotSlot { capacity: self }
    }

    /// Snapshots being planned right now.
    pub fn in_progress(&self) -> usize {
        *self.running.lock()
    }

    /// Configured limit.
    pub fn max(&self) -> usize {
        self.max
    }
}

/// A held snapshot slot. Dropping it frees the slot.
#[derive(Debug)]
#[must_use = "the slot is freed as soon as it is dropped"]
pub struct SnapshotSlot<'a> {
    capacity: &'a SnapshotCapacity,
}

impl Drop for SnapshotSlot<'_> {
    fn drop(&mut self) {
        let mut running = self.capacity.running.lock();
        *running = running.saturating_sub(1);
        drop(running);
        self.capacity.freed.notify_one();
    }
}
