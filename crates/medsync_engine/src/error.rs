//! Error types for the sync engine.

use medsync_protocol::SessionId;
use medsync_store::StoreError;
use std::time::SystemTime;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Unknown or purged session.
    #[error("sync session {0} not found")]
    SessionNotFound(SessionId),

    /// The session failed earlier; the facility must start over.
    #[error("sync session '{session_id}' encountered an error: {message}")]
    SessionErrored {
        /// Session ID.
        session_id: SessionId,
        /// Latest recorded error.
        message: String,
    },

    /// The session is still being prepared.
    #[error("sync session {0} is not ready")]
    SessionNotReady(SessionId),

    /// The session has already been ended.
    #[error("sync session {0} is already complete")]
    SessionCompleted(SessionId),

    /// A session lifecycle step was requested out of order.
    #[error("invalid session state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// A facility pushed a record type it may not write.
    #[error("sync security violation: {record_type} {record_id} may not be pushed")]
    SecurityViolation {
        /// Rejected record type.
        record_type: String,
        /// Rejected record ID.
        record_id: String,
    },

    /// No syncable model is registered for the record type.
    #[error("unknown record type: {0}")]
    UnknownRecordType(String),

    /// A pushed change is malformed.
    #[error("invalid change for {record_type} {record_id}: {reason}")]
    InvalidChange {
        /// Record type.
        record_type: String,
        /// Record ID.
        record_id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Sessions cannot start before the lookup table exists.
    #[error("sync lookup table has not yet been built, cannot initiate sync")]
    LookupNotBuilt,

    /// Another lookup-table run is in flight.
    #[error("a sync lookup table run is already in progress")]
    LookupInProgress,

    /// A lookup-table run failed and was rolled back.
    #[error("sync lookup table run failed: {error}")]
    LookupRebuild {
        /// Cause of the failure.
        error: String,
        /// When the run started.
        started_at: SystemTime,
        /// When the run was abandoned.
        completed_at: SystemTime,
    },

    /// Too many sessions are active.
    #[error("sync capacity full: {active} of {max} sessions active")]
    CapacityFull {
        /// Active sessions.
        active: usize,
        /// Configured limit.
        max: usize,
    },

    /// The pull snapshot has not been planned yet.
    #[error("snapshot for sync session {0} is not ready")]
    SnapshotNotReady(SessionId),

    /// A background worker thread could not be started.
    #[error("could not start background worker: {0}")]
    Worker(#[from] std::io::Error),

    /// Storage error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A stored row could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Creates an invalid state transition error.
    pub fn transition(from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Self {
        Self::InvalidStateTransition {
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }

    /// Returns true if the operation may succeed when retried unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::LookupInProgress
            | SyncError::CapacityFull { .. }
            | SyncError::SnapshotNotReady(_)
            | SyncError::SessionNotReady(_)
            | SyncError::LookupNotBuilt => true,
            SyncError::Store(err) => err.is_contention(),
            _ => false,
        }
    }

    /// Returns true if the caller is at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SyncError::SessionNotFound(_)
                | SyncError::SessionErrored { .. }
                | SyncError::SessionCompleted(_)
                | SyncError::InvalidStateTransition { .. }
                | SyncError::SecurityViolation { .. }
                | SyncError::UnknownRecordType(_)
                | SyncError::InvalidChange { .. }
        )
    }
}
