//! The central sync manager.

use crate::capacity::SnapshotCapacity;
use crate::clock::SyncClock;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::ingest::ChangeIngester;
use crate::lookup::LookupTableBuilder;
use crate::models::ModelRegistry;
use crate::outgoing::OutgoingChangeReader;
use crate::planner::{PermissionCheck, SnapshotPlanner, SnapshotRequest};
use crate::session::{SessionHandle, SessionRegistry, SessionStatus, SnapshotState, SyncSession};
use medsync_protocol::{
    IncomingChange, LookupRunReport, OutgoingChange, PagingOptions, PullMetadata, PullParams,
    SessionId, StartSessionOptions, SyncMetadata, Tick,
};
use medsync_store::Store;
use parking_lot::{Condvar, Mutex};
use serde_json::json;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

struct Inner {
    config: SyncConfig,
    store: Store,
    clock: SyncClock,
    lookup: LookupTableBuilder,
    sessions: SessionRegistry,
    planner: SnapshotPlanner,
    snapshots: SnapshotCapacity,
    reader: OutgoingChangeReader,
    ingester: ChangeIngester,
}

/// Entry point for facility sync sessions.
///
/// Session preparation, pull planning and push persistence run in the
/// background (unless [`SyncConfig::await_background_work`] is set); their
/// progress is observed by polling [`check_session_ready`],
/// [`check_pull_ready`] and [`check_push_complete`].
///
/// A pull-then-push session goes:
///
/// ```text
/// start_session -> check_session_ready* -> initiate_pull -> check_pull_ready*
///   -> fetch_pull_metadata -> get_outgoing_changes*
///   -> add_incoming_changes* -> complete_push -> check_push_complete*
///   -> end_session
/// ```
///
/// [`check_session_ready`]: Self::check_session_ready
/// [`check_pull_ready`]: Self::check_pull_ready
/// [`check_push_complete`]: Self::check_push_complete
#[derive(Clone)]
pub struct CentralSyncManager {
    inner: Arc<Inner>,
}

impl CentralSyncManager {
    /// Creates a manager over `store` for the given models.
    pub fn new(store: Store, models: ModelRegistry, config: SyncConfig) -> Self {
        let models = Arc::new(models);
        let clock = SyncClock::new(store.clone(), config.clock_retry.clone());
        let lookup = LookupTableBuilder::new(store.clone(), clock.clone(), Arc::clone(&models));
        let ingester = ChangeIngester::new(store.clone(), clock.clone(), models);
        Self {
            inner: Arc::new(Inner {
                sessions: SessionRegistry::new(config.clone()),
                planner: SnapshotPlanner::new(store.clone()),
                snapshots: SnapshotCapacity::new(config.max_concurrent_snapshots),
                reader: OutgoingChangeReader::new(config.max_records_per_chunk),
                config,
                store,
                clock,
                lookup,
                ingester,
            }),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Underlying store.
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// The global clock.
    pub fn clock(&self) -> &SyncClock {
        &self.inner.clock
    }

    /// The lookup-table builder.
    pub fn lookup_builder(&self) -> &LookupTableBuilder {
        &self.inner.lookup
    }

    /// The session registry.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    /// Starts a session and begins preparing it in the background.
    pub fn start_session(&self, options: StartSessionOptions) -> SyncResult<SessionId> {
        if self.inner.config.require_lookup_table && !self.inner.lookup.is_built()? {
            return Err(SyncError::LookupNotBuilt);
        }
        let handle = self.inner.sessions.create(options)?;
        let id = handle.lock().id();

        let inner = Arc::clone(&self.inner);
        let task = Arc::clone(&handle);
        self.run_background(&handle, "medsync-prepare", move || inner.prepare_session(&task));
        Ok(id)
    }

    /// Returns true once the session has been prepared.
    pub fn check_session_ready(&self, id: SessionId) -> SyncResult<bool> {
        let handle = self.inner.sessions.connect(id)?;
        let ready = handle.lock().status() != SessionStatus::Pending;
        Ok(ready)
    }

    /// Returns the tick captured by preparation.
    pub fn fetch_sync_metadata(&self, id: SessionId) -> SyncResult<SyncMetadata> {
        let handle = self.inner.sessions.connect(id)?;
        let started_at_tick = handle
            .lock()
            .started_at_tick()
            .ok_or(SyncError::SessionNotReady(id))?;
        Ok(SyncMetadata { started_at_tick })
    }

    /// Plans the session's pull snapshot on the calling thread.
    pub fn setup_snapshot_for_pull(
        &self,
        id: SessionId,
        params: PullParams,
        check: PermissionCheck,
    ) -> SyncResult<()> {
        let (handle, plan) = self.begin_pull(id, params)?;
        self.inner.plan_pull(&handle, &plan, &check)
    }

    /// Starts planning the session's pull snapshot in the background.
    pub fn initiate_pull(
        &self,
        id: SessionId,
        params: PullParams,
        check: PermissionCheck,
    ) -> SyncResult<()> {
        let (handle, plan) = self.begin_pull(id, params)?;
        let inner = Arc::clone(&self.inner);
        let task = Arc::clone(&handle);
        self.run_background(&handle, "medsync-pull", move || {
            // Failures are recorded on the session
            let _ = inner.plan_pull(&task, &plan, &check);
        });
        Ok(())
    }

    fn begin_pull(&self, id: SessionId, mut params: PullParams) -> SyncResult<(SessionHandle, PullPlan)> {
        let handle = self.inner.sessions.connect(id)?;
        let plan = {
            let mut session = handle.lock();
            if !session.direction().pulls() || session.status() != SessionStatus::Ready {
                return Err(SyncError::transition(session.status(), SessionStatus::Draining));
            }
            let boundary = session
                .started_at_tick()
                .ok_or(SyncError::SessionNotReady(id))?;
            if params.facility_ids.is_empty() {
                params.facility_ids = session.facility_ids().to_vec();
            }
            session.transition(SessionStatus::Draining)?;
            session.pull_params = Some(params.clone());
            session.snapshot = SnapshotState::Processing;
            PullPlan {
                params,
                boundary,
                device_id: session.device_id().map(str::to_string),
                echoed: session.pushed_keys.clone(),
            }
        };
        info!(
            session_id = %id,
            since = plan.params.since,
            boundary = plan.boundary,
            "pull initiated"
        );
        Ok((handle, plan))
    }

    /// Returns true once the pull snapshot has been planned.
    pub fn check_pull_ready(&self, id: SessionId) -> SyncResult<bool> {
        let handle = self.inner.sessions.connect(id)?;
        let session = handle.lock();
        match session.snapshot {
            SnapshotState::Ready(_) => Ok(true),
            SnapshotState::Processing => Ok(false),
            SnapshotState::NotStarted | SnapshotState::Released => Err(SyncError::transition(
                session.status(),
                SessionStatus::Draining,
            )),
        }
    }

    /// Returns the size and boundary of the planned snapshot.
    pub fn fetch_pull_metadata(&self, id: SessionId) -> SyncResult<PullMetadata> {
        let handle = self.inner.sessions.connect(id)?;
        let session = handle.lock();
        match (&session.snapshot, session.pull_until) {
            (SnapshotState::Ready(changes), Some(pull_until)) => Ok(PullMetadata {
                total_to_pull: changes.len(),
                pull_until,
            }),
            _ => Err(SyncError::SnapshotNotReady(id)),
        }
    }

    /// Returns one page of the planned snapshot.
    pub fn get_outgoing_changes(
        &self,
        id: SessionId,
        paging: PagingOptions,
    ) -> SyncResult<Vec<OutgoingChange>> {
        let handle = self.inner.sessions.connect(id)?;
        let snapshot = match &handle.lock().snapshot {
            SnapshotState::Ready(changes) => Arc::clone(changes),
            _ => return Err(SyncError::SnapshotNotReady(id)),
        };
        Ok(self.inner.reader.page(&snapshot, paging))
    }

    /// Stages pushed changes against the session.
    ///
    /// A change to a record type that may not be pushed fails the session.
    pub fn add_incoming_changes(
        &self,
        id: SessionId,
        changes: Vec<IncomingChange>,
    ) -> SyncResult<()> {
        let handle = self.inner.sessions.connect(id)?;
        let mut session = handle.lock();
        if !session.direction().pushes()
            || !matches!(
                session.status(),
                SessionStatus::Ready | SessionStatus::Draining
            )
        {
            return Err(SyncError::transition(session.status(), SessionStatus::Applying));
        }
        if let Err(err) = self.inner.ingester.validate(&changes) {
            if let SyncError::SecurityViolation {
                record_type,
                record_id,
            } = &err
            {
                session.debug_info.insert(
                    "rejectedRecord".into(),
                    json!({ "type": record_type, "id": record_id }),
                );
                session.mark_errored(err.to_string());
            }
            return Err(err);
        }
        debug!(session_id = %id, count = changes.len(), "staged incoming changes");
        session.incoming.extend(changes);
        Ok(())
    }

    /// Persists the staged changes in the background.
    pub fn complete_push(&self, id: SessionId) -> SyncResult<()> {
        let handle = self.inner.sessions.connect(id)?;
        let push = {
            let mut session = handle.lock();
            let status = session.status();
            if !session.direction().pushes()
                || !matches!(status, SessionStatus::Ready | SessionStatus::Draining)
            {
                return Err(SyncError::transition(status, SessionStatus::Applying));
            }
            let resume = if session.direction().pulls() {
                status
            } else {
                SessionStatus::Complete
            };
            session.transition(SessionStatus::Applying)?;
            PendingPush {
                changes: std::mem::take(&mut session.incoming),
                device_id: session.device_id().map(str::to_string),
                resume,
            }
        };
        info!(session_id = %id, count = push.changes.len(), "push completing");

        let inner = Arc::clone(&self.inner);
        let task = Arc::clone(&handle);
        self.run_background(&handle, "medsync-push", move || inner.persist_push(&task, push));
        Ok(())
    }

    /// Returns true once the last completed push has been persisted.
    pub fn check_push_complete(&self, id: SessionId) -> SyncResult<bool> {
        let handle = self.inner.sessions.touch(id)?;
        let session = handle.lock();
        Ok(session.persisted_at_tick().is_some() && session.status() != SessionStatus::Applying)
    }

    /// Ends a session once its snapshot has been drained, releasing the
    /// snapshot. Ending an ended session is a no-op.
    pub fn end_session(&self, id: SessionId) -> SyncResult<()> {
        let handle = self.inner.sessions.touch(id)?;
        {
            let mut session = handle.lock();
            match session.status() {
                SessionStatus::Complete => return Ok(()),
                SessionStatus::Draining => {
                    session.transition(SessionStatus::Complete)?;
                    info!(session_id = %id, "sync session ended");
                }
                other => return Err(SyncError::transition(other, SessionStatus::Complete)),
            }
        }
        self.inner.sessions.retire(id);
        Ok(())
    }

    /// Runs one lookup-table pass.
    pub fn update_lookup_table(&self, force_full_rebuild: bool) -> SyncResult<LookupRunReport> {
        self.inner.lookup.run(force_full_rebuild)
    }

    /// Drops sessions that have been idle past the lapse period.
    pub fn purge_lapsed_sessions(&self) -> usize {
        self.inner.sessions.purge_lapsed()
    }

    /// Purges lapsed sessions every `every` on a background thread until
    /// the returned handle is dropped.
    pub fn spawn_session_purger(&self, every: Duration) -> SyncResult<SessionPurger> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let inner = Arc::downgrade(&self.inner);
        let signal = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("medsync-purge".to_string())
            .spawn(move || loop {
                {
                    let (stopped, wake) = &*signal;
                    let mut stopped = stopped.lock();
                    if !*stopped {
                        wake.wait_for(&mut stopped, every);
                    }
                    if *stopped {
                        break;
                    }
                }
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let purged = inner.sessions.purge_lapsed();
                if purged > 0 {
                    info!(purged, "purged lapsed sync sessions");
                }
            })?;
        Ok(SessionPurger {
            stop,
            thread: Some(thread),
        })
    }

    /// Pull snapshots being planned right now.
    pub fn snapshots_in_progress(&self) -> usize {
        self.inner.snapshots.in_progress()
    }

    /// Reads a session's state.
    pub fn inspect_session<R>(
        &self,
        id: SessionId,
        f: impl FnOnce(&SyncSession) -> R,
    ) -> SyncResult<R> {
        let handle = self.inner.sessions.get(id)?;
        let session = handle.lock();
        Ok(f(&session))
    }

    fn run_background<F>(&self, handle: &SessionHandle, name: &str, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.config.await_background_work {
            work();
            return;
        }
        if let Err(err) = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(work)
        {
            handle
                .lock()
                .mark_errored(format!("could not start background work: {err}"));
        }
    }
}

impl std::fmt::Debug for CentralSyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralSyncManager")
            .field("config", &self.inner.config)
            .field("sessions", &self.inner.sessions.len())
            .finish_non_exhaustive()
    }
}

/// Handle to the background session purger; stops it when dropped.
#[derive(Debug)]
pub struct SessionPurger {
    stop: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for SessionPurger {
    fn drop(&mut self) {
        let (stopped, wake) = &*self.stop;
        *stopped.lock() = true;
        wake.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Inputs of a pull planned outside the session lock.
struct PullPlan {
    params: PullParams,
    boundary: Tick,
    device_id: Option<String>,
    echoed: std::collections::BTreeSet<(String, String)>,
}

/// Inputs of a push persisted outside the session lock.
struct PendingPush {
    changes: Vec<IncomingChange>,
    device_id: Option<String>,
    resume: SessionStatus,
}

impl Inner {
    fn prepare_session(&self, handle: &SessionHandle) {
        let direction = handle.lock().direction();
        let boundary = if direction.pulls() {
            self.clock.publish_boundary()
        } else {
            self.clock.tick_tock().map(|tt| tt.tick)
        };

        let mut session = handle.lock();
        match boundary {
            Ok(tick) if session.status() == SessionStatus::Pending => {
                session.started_at_tick = Some(tick);
                if let Err(err) = session.transition(SessionStatus::Ready) {
                    session.mark_errored(err.to_string());
                } else {
                    info!(session_id = %session.id(), started_at_tick = tick, "sync session ready");
                }
            }
            // Superseded or timed out while preparing
            Ok(_) => {}
            Err(err) => session.mark_errored(err.to_string()),
        }
    }

    fn plan_pull(
        &self,
        handle: &SessionHandle,
        plan: &PullPlan,
        check: &PermissionCheck,
    ) -> SyncResult<()> {
        let slot = self.snapshots.acquire();
        let planned = self.planner.plan(
            SnapshotRequest {
                params: &plan.params,
                boundary: plan.boundary,
                device_id: plan.device_id.as_deref(),
                echoed: &plan.echoed,
            },
            check,
        );
        drop(slot);

        let mut session = handle.lock();
        match planned {
            Ok(changes) => {
                if matches!(session.snapshot, SnapshotState::Processing) {
                    info!(
                        session_id = %session.id(),
                        total_to_pull = changes.len(),
                        pull_until = plan.boundary,
                        "pull snapshot ready"
                    );
                    session.snapshot = SnapshotState::Ready(Arc::new(changes));
                    session.pull_until = Some(plan.boundary);
                }
                Ok(())
            }
            Err(err) => {
                session.mark_errored(format!("snapshot planning failed: {err}"));
                Err(err)
            }
        }
    }

    fn persist_push(&self, handle: &SessionHandle, push: PendingPush) {
        let persisted = self
            .ingester
            .persist(&push.changes, push.device_id.as_deref());

        let mut session = handle.lock();
        let id = session.id();
        match persisted {
            Ok(tick) => {
                session.persisted_at_tick = Some(tick);
                session.pushed_keys.extend(
                    push.changes
                        .iter()
                        .map(|c| (c.record_type.clone(), c.record_id.clone())),
                );
                if session.status() == SessionStatus::Applying {
                    if let Err(err) = session.transition(push.resume) {
                        session.mark_errored(err.to_string());
                    }
                }
            }
            Err(err) => session.mark_errored(format!("push could not be persisted: {err}")),
        }
        let ended = session.status() == SessionStatus::Complete;
        drop(session);
        if ended {
            self.sessions.retire(id);
        }
    }
}
