//! Polling helpers.
//!
//! Session preparation, pull planning and push persistence complete in the
//! background; these helpers poll the manager the way a facility node does.

use medsync_engine::{CentralSyncManager, RetryConfig, SyncError, SyncResult};
use medsync_protocol::{OutgoingChange, PagingOptions, SessionId};
use std::time::{Duration, Instant};

/// Default time to wait for background work.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(10);

/// Polls `condition` with exponential backoff until it returns true.
///
/// Returns `Ok(false)` if `timeout` elapses first. Errors from the condition are
/// returned as-is.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> SyncResult<bool>
where
    F: FnMut() -> SyncResult<bool>,
{
    let backoff = RetryConfig::new(u32::MAX)
        .with_initial_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(50));
    let deadline = Instant::now() + timeout;
    let mut attempt = 0;
    loop {
        if condition()? {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        attempt += 1;
        std::thread::sleep(backoff.delay_for_attempt(attempt));
    }
}

fn timed_out(id: SessionId, what: &str) -> SyncError {
    SyncError::SessionErrored {
        session_id: id,
        message: format!("timed out waiting for {what}"),
    }
}

/// Waits for a session to be prepared.
pub fn await_session_ready(manager: &CentralSyncManager, id: SessionId) -> SyncResult<()> {
    if wait_until(DEFAULT_WAIT, || manager.check_session_ready(id))? {
        Ok(())
    } else {
        Err(timed_out(id, "session preparation"))
    }
}

/// Waits for a session's pull snapshot to be planned.
pub fn await_pull_ready(manager: &CentralSyncManager, id: SessionId) -> SyncResult<()> {
    if wait_until(DEFAULT_WAIT, || manager.check_pull_ready(id))? {
        Ok(())
    } else {
        Err(timed_out(id, "pull snapshot"))
    }
}

/// Waits for a session's push to be persisted.
pub fn await_push_complete(manager: &CentralSyncManager, id: SessionId) -> SyncResult<()> {
    if wait_until(DEFAULT_WAIT, || manager.check_push_complete(id))? {
        Ok(())
    } else {
        Err(timed_out(id, "push persistence"))
    }
}

/// Reads a whole snapshot page by page.
pub fn drain_snapshot(
    manager: &CentralSyncManager,
    id: SessionId,
    page_size: usize,
) -> SyncResult<Vec<OutgoingChange>> {
    let mut drained = Vec::new();
    let mut paging = PagingOptions::default().with_limit(page_size);
    loop {
        let page = manager.get_outgoing_changes(id, paging)?;
        let Some(last) = page.last() else {
            return Ok(drained);
        };
        paging = PagingOptions::after(last.id).with_limit(page_size);
        drained.extend(page);
    }
}
