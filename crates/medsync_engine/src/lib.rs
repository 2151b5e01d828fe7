//! # medsync engine
//!
//! The central sync engine of the health-record platform. Facility nodes
//! open sessions against it to pull the records they are entitled to and
//! push the records they changed locally.
//!
//! This crate provides:
//! - [`SyncClock`], the global logical clock every committed write is stamped with
//! - [`LookupTableBuilder`], which materializes a denormalized lookup row per
//!   replicable record
//! - [`SessionRegistry`], the per-session state machine
//! - [`SnapshotPlanner`] and [`OutgoingChangeReader`], which freeze and page
//!   out what a node should pull
//! - [`ChangeIngester`], which applies pushed changes atomically
//! - [`CentralSyncManager`], the facade tying them together
//!
//! # Ticks and boundaries
//!
//! A session captures a boundary tick when it is prepared. Its snapshot
//! contains exactly the lookup rows stamped at or before that boundary.
//! Every writer that could still commit at or below the boundary holds a
//! [`TickReservation`], and publishing a boundary waits for those to be
//! released, so a later session never misses a row an earlier one skipped.
//!
//! # Example
//!
//! ```rust
//! use medsync_engine::{
//!     deny_sensitive, CentralSyncManager, ModelRegistry, ModelSpec, SyncConfig, SyncDirection,
//! };
//! use medsync_protocol::{PagingOptions, PullParams, SessionDirection, StartSessionOptions};
//! use medsync_store::Store;
//!
//! let models = ModelRegistry::new()
//!     .with(ModelSpec::new("reference_data", SyncDirection::PullFromCentral));
//! let config = SyncConfig::default().with_await_background_work(true);
//! let manager = CentralSyncManager::new(Store::new(), models, config);
//!
//! manager.store().create("reference_data", "r1", serde_json::json!({})).unwrap();
//! manager.update_lookup_table(false).unwrap();
//!
//! let session = manager
//!     .start_session(StartSessionOptions::new(SessionDirection::Pull))
//!     .unwrap();
//! manager
//!     .initiate_pull(session, PullParams::initial(["f1"]), deny_sensitive())
//!     .unwrap();
//! let changes = manager
//!     .get_outgoing_changes(session, PagingOptions::default())
//!     .unwrap();
//! assert_eq!(changes.len(), 1);
//! manager.end_session(session).unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod capacity;
mod clock;
mod config;
mod debug_log;
mod error;
mod ingest;
mod lookup;
mod lookup_store;
mod manager;
mod models;
mod outgoing;
mod planner;
mod session;

pub use capacity::{SnapshotCapacity, SnapshotSlot};
pub use clock::{SyncClock, TickReservation, TickTock};
pub use config::{RetryConfig, SyncConfig};
pub use debug_log::{DebugLog, LookupRunRecord, DEBUG_LOGS};
pub use error::{SyncError, SyncResult};
pub use ingest::{device_for_tick, ChangeIngester, SYNC_DEVICE_TICKS};
pub use lookup::LookupTableBuilder;
pub use lookup_store::{LookupStamp, SyncLookupStore, LOOKUP_UP_TO_TICK, SYNC_LOOKUP};
pub use manager::{CentralSyncManager, SessionPurger};
pub use models::{
    LookupProjection, ModelRegistry, ModelSpec, PatientFacilityLink, PatientScope,
    SensitivityCheck, SyncDirection, SyncableModel, PATIENT_FACILITIES,
};
pub use outgoing::OutgoingChangeReader;
pub use planner::{
    allow_sensitive, deny_sensitive, patient_scopes, PatientScopes, PermissionCheck,
    SnapshotPlanner, SnapshotRequest,
};
pub use session::{SessionHandle, SessionRegistry, SessionStatus, SnapshotState, SyncSession};
