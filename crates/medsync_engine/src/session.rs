//! Sync session lifecycle.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use medsync_protocol::{
    IncomingChange, OutgoingChange, PullParams, SessionDirection, SessionId, StartSessionOptions,
    Tick,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, info, warn};

/// Lifecycle state of a session.
///
/// ```text
/// Pending -> Ready -> Draining -> Complete
///              |  ^       |  ^
///              v  |       v  |
///              Applying --+--+--> Complete
/// ```
///
/// Any non-terminal state may move to `Errored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// Allocated; preparation has not finished.
    Pending,
    /// Prepared; waiting for the facility to pull or push.
    Ready,
    /// A pull snapshot is being planned or drained.
    Draining,
    /// Pushed changes are being persisted.
    Applying,
    /// Ended.
    Complete,
    /// Failed.
    Errored,
}

impl SessionStatus {
    /// Returns true if the session can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Complete | SessionStatus::Errored)
    }

    /// Returns true if `next` is a legal successor.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (from, Errored) => !from.is_terminal(),
            (Pending, Ready) => true,
            (Ready, Draining | Applying) => true,
            (Draining, Applying | Complete) => true,
            (Applying, Ready | Draining | Complete) => true,
            _ => false,
        }
    }
}

/// Progress of a session's pull snapshot.
#[derive(Debug, Clone, Default)]
pub enum SnapshotState {
    /// No pull has been requested.
    #[default]
    NotStarted,
    /// Planning is running.
    Processing,
    /// Planned; drained through paging.
    Ready(Arc<Vec<OutgoingChange>>),
    /// Dropped when the session ended.
    Released,
}

/// One sync session.
#[derive(Debug)]
pub struct SyncSession {
    id: SessionId,
    created_at: Instant,
    created_at_wall: SystemTime,
    last_connection_at: Instant,
    direction: SessionDirection,
    facility_ids: Vec<String>,
    device_id: Option<String>,
    status: SessionStatus,
    pub(crate) started_at_tick: Option<Tick>,
    pub(crate) pull_params: Option<PullParams>,
    pub(crate) pull_until: Option<Tick>,
    pub(crate) snapshot: SnapshotState,
    pub(crate) incoming: Vec<IncomingChange>,
    pub(crate) pushed_keys: BTreeSet<(String, String)>,
    pub(crate) persisted_at_tick: Option<Tick>,
    errors: Vec<String>,
    completed_at: Option<SystemTime>,
    pub(crate) debug_info: Map<String, Value>,
}

impl SyncSession {
    fn new(options: StartSessionOptions) -> Self {
        let now = Instant::now();
        Self {
            id: SessionId::new(),
            created_at: now,
            created_at_wall: SystemTime::now(),
            last_connection_at: now,
            direction: options.direction,
            facility_ids: options.facility_ids,
            device_id: options.device_id,
            status: SessionStatus::Pending,
            started_at_tick: None,
            pull_params: None,
            pull_until: None,
            snapshot: SnapshotState::NotStarted,
            incoming: Vec::new(),
            pushed_keys: BTreeSet::new(),
            persisted_at_tick: None,
            errors: Vec::new(),
            completed_at: None,
            debug_info: Map::new(),
        }
    }

    /// Session ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Session legs.
    pub fn direction(&self) -> SessionDirection {
        self.direction
    }

    /// Facilities given at start.
    pub fn facility_ids(&self) -> &[String] {
        &self.facility_ids
    }

    /// Device given at start.
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// When the session was created.
    pub fn created_at(&self) -> SystemTime {
        self.created_at_wall
    }

    /// When the session was ended, if it was.
    pub fn completed_at(&self) -> Option<SystemTime> {
        self.completed_at
    }

    /// Tick captured by preparation.
    pub fn started_at_tick(&self) -> Option<Tick> {
        self.started_at_tick
    }

    /// Parameters of the requested pull.
    pub fn pull_params(&self) -> Option<&PullParams> {
        self.pull_params.as_ref()
    }

    /// Tick the pushed changes were persisted at.
    pub fn persisted_at_tick(&self) -> Option<Tick> {
        self.persisted_at_tick
    }

    /// Number of staged incoming changes.
    pub fn staged_count(&self) -> usize {
        self.incoming.len()
    }

    /// Progress of the pull snapshot.
    pub fn snapshot(&self) -> &SnapshotState {
        &self.snapshot
    }

    /// Errors recorded against the session, oldest first.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Diagnostic details recorded against the session.
    pub fn debug_info(&self) -> &Map<String, Value> {
        &self.debug_info
    }

    /// Moves to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: SessionStatus) -> SyncResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(SyncError::transition(self.status, next));
        }
        self.status = next;
        if next == SessionStatus::Complete {
            self.completed_at = Some(SystemTime::now());
            self.release_buffers();
        }
        Ok(())
    }

    /// Records an error and fails the session unless it already ended.
    pub fn mark_errored(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(session_id = %self.id, error = %message, "sync session errored");
        self.errors.push(message);
        if !self.status.is_terminal() {
            self.status = SessionStatus::Errored;
        }
        self.release_buffers();
    }

    /// Drops the planned snapshot and any staged or echoed changes.
    fn release_buffers(&mut self) {
        if !matches!(self.snapshot, SnapshotState::NotStarted) {
            self.snapshot = SnapshotState::Released;
        }
        self.incoming = Vec::new();
        self.pushed_keys = BTreeSet::new();
    }

    /// Fails the session if it has been left idle past `timeout`.
    fn expire_if_idle(&mut self, timeout: Option<std::time::Duration>, now: Instant) {
        if let Some(timeout) = timeout {
            if !self.status.is_terminal() && self.idle_for(now) > timeout {
                let message = format!("Sync session {} timed out", self.id);
                self.mark_errored(message);
            }
        }
    }

    fn errored(&self) -> SyncError {
        SyncError::SessionErrored {
            session_id: self.id,
            message: self.errors.last().cloned().unwrap_or_default(),
        }
    }

    fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_connection_at)
    }
}

/// Shared handle to a session.
pub type SessionHandle = Arc<Mutex<SyncSession>>;

/// Tracks the sessions in flight.
///
/// Each session is guarded by its own lock; the registry locks are only held
/// to look sessions up or to add and remove them, and are always taken
/// before a session lock. Sessions that have ended move to a separate map,
/// with their buffers released, until they lapse.
#[derive(Debug)]
pub struct SessionRegistry {
    config: SyncConfig,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    ended: RwLock<HashMap<SessionId, SessionHandle>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            ended: RwLock::new(HashMap::new()),
        }
    }

    /// Allocates a pending session.
    ///
    /// Active sessions of the same device are failed first, then sessions
    /// left idle past the session timeout are failed and every ended or
    /// lapsed session is cleared out. Fails with [`SyncError::CapacityFull`]
    /// when the concurrent session limit is still reached.
    pub fn create(&self, options: StartSessionOptions) -> SyncResult<SessionHandle> {
        let mut sessions = self.sessions.write();

        if let Some(device_id) = options.device_id.as_deref() {
            for handle in sessions.values() {
                let mut session = handle.lock();
                if session.device_id() == Some(device_id) && !session.status.is_terminal() {
                    let message = format!(
                        "Sync session {} was superseded by a newer session from device {device_id}",
                        session.id
                    );
                    session.mark_errored(message);
                }
            }
        }

        self.sweep(&mut sessions, Instant::now());

        let active = sessions.len();
        if active >= self.config.max_concurrent_sessions {
            return Err(SyncError::CapacityFull {
                active,
                max: self.config.max_concurrent_sessions,
            });
        }

        let session = SyncSession::new(options);
        let id = session.id;
        info!(session_id = %id, direction = ?session.direction, "sync session started");
        let handle = Arc::new(Mutex::new(session));
        sessions.insert(id, Arc::clone(&handle));
        Ok(handle)
    }

    /// Looks a session up without any state checks.
    pub fn get(&self, id: SessionId) -> SyncResult<SessionHandle> {
        if let Some(handle) = self.sessions.read().get(&id) {
            return Ok(Arc::clone(handle));
        }
        self.ended
            .read()
            .get(&id)
            .cloned()
            .ok_or(SyncError::SessionNotFound(id))
    }

    /// Looks an active session up on behalf of the facility.
    ///
    /// Times the session out if it is too old, and fails if the session has
    /// errored or ended.
    pub fn connect(&self, id: SessionId) -> SyncResult<SessionHandle> {
        let handle = self.touch(id)?;
        {
            let session = handle.lock();
            if session.status == SessionStatus::Complete {
                return Err(SyncError::SessionCompleted(id));
            }
        }
        Ok(handle)
    }

    /// Like [`connect`](Self::connect), but also accepts ended sessions.
    pub fn touch(&self, id: SessionId) -> SyncResult<SessionHandle> {
        let handle = self.get(id)?;
        {
            let mut session = handle.lock();
            let now = Instant::now();
            if let Some(timeout) = self.config.session_timeout {
                if !session.status.is_terminal()
                    && now.saturating_duration_since(session.created_at) > timeout
                {
                    session.mark_errored(format!("Sync session {id} timed out"));
                }
            }
            if session.status == SessionStatus::Errored {
                return Err(session.errored());
            }
            session.last_connection_at = now;
        }
        Ok(handle)
    }

    /// Moves an ended session out of the active map.
    pub fn retire(&self, id: SessionId) {
        let mut sessions = self.sessions.write();
        if let Some(handle) = sessions.remove(&id) {
            self.ended.write().insert(id, handle);
        }
    }

    /// Fails idle sessions, retires ended ones and drops every session
    /// idle for longer than the lapse period. Returns how many were
    /// dropped.
    pub fn purge_lapsed(&self) -> usize {
        let mut sessions = self.sessions.write();
        self.sweep(&mut sessions, Instant::now())
    }

    fn sweep(&self, sessions: &mut HashMap<SessionId, SessionHandle>, now: Instant) -> usize {
        let lapse = self.config.lapsed_session_after;
        let mut purged = 0;
        let mut retired = Vec::new();
        sessions.retain(|id, handle| {
            let mut session = handle.lock();
            if session.idle_for(now) > lapse {
                info!(session_id = %id, status = ?session.status, "purging lapsed sync session");
                session.release_buffers();
                purged += 1;
                return false;
            }
            session.expire_if_idle(self.config.session_timeout, now);
            if session.status.is_terminal() {
                retired.push((*id, Arc::clone(handle)));
                return false;
            }
            true
        });

        let mut ended = self.ended.write();
        ended.retain(|id, handle| {
            let keep = handle.lock().idle_for(now) <= lapse;
            if !keep {
                debug!(session_id = %id, "dropping ended sync session");
                purged += 1;
            }
            keep
        });
        ended.extend(retired);
        purged
    }

    /// Number of sessions that have not ended.
    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|handle| !handle.lock().status.is_terminal())
            .count()
    }

    /// Number of sessions in the active map.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns true if no session is in the active map.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Number of ended sessions kept until they lapse.
    pub fn ended_count(&self) -> usize {
        self.ended.read().len()
    }
}
