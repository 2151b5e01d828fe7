//! Session snapshot planning.
//!
//! A pull is answered from the lookup table as it stood at the session's
//! boundary. Per facility in the request:
//!
//! 1. Patients whose link to the facility was written in
//!    `(since, boundary]` are new to the facility and get every row.
//! 2. Patients linked at or before `since` get rows changed in
//!    `(since, boundary]`.
//! 3. Rows tied to a requested facility, and global rows, follow the
//!    incremental rule of (2).
//!
//! Sensitive rows are dropped unless the caller's permission check accepts
//! them. A patient linked to several requested facilities is planned once.
//!
//! Rows pushed in the same session are never sent back. On an incremental
//! pull, rows last written by a push from the pulling device are not sent
//! back either; a device pulling from scratch gets them.

use crate::error::SyncResult;
use crate::lookup_store::SyncLookupStore;
use crate::models::{PatientFacilityLink, PATIENT_FACILITIES};
use medsync_protocol::{
    OutgoingChange, PullParams, RecordScope, SyncLookupRow, Tick, NEVER_SYNCED,
};
use medsync_store::Store;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Decides whether a sensitive row may be sent.
pub type PermissionCheck = Arc<dyn Fn(&SyncLookupRow) -> bool + Send + Sync>;

/// A check that accepts every sensitive row.
pub fn allow_sensitive() -> PermissionCheck {
    Arc::new(|_| true)
}

/// A check that rejects every sensitive row.
pub fn deny_sensitive() -> PermissionCheck {
    Arc::new(|_| false)
}

/// Everything the planner needs to know about one pull.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotRequest<'a> {
    /// Pull parameters.
    pub params: &'a PullParams,
    /// Session boundary; nothing above it is sent.
    pub boundary: Tick,
    /// Device pulling, if known. Rows it pushed itself are not sent back.
    pub device_id: Option<&'a str>,
    /// Records pushed in this session.
    pub echoed: &'a BTreeSet<(String, String)>,
}

/// Patients in scope for a pull.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PatientScopes {
    /// Patients new to a requested facility.
    pub full_catch_up: BTreeSet<String>,
    /// Patients the facility already holds.
    pub incremental: BTreeSet<String>,
}

/// Computes the outgoing changes of a pull.
#[derive(Debug, Clone)]
pub struct SnapshotPlanner {
    store: Store,
}

impl SnapshotPlanner {
    /// Creates a planner over `store`.
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Plans a snapshot. Changes are ordered by `(record_type, record_id)`
    /// and numbered from 1.
    pub fn plan(
        &self,
        request: SnapshotRequest<'_>,
        check: &PermissionCheck,
    ) -> SyncResult<Vec<OutgoingChange>> {
        let txn = self.store.begin();
        let params = request.params;
        let since = params.since;
        let facilities: BTreeSet<&str> = params.facility_ids.iter().map(String::as_str).collect();

        let links: Vec<PatientFacilityLink> = txn
            .changed_since(PATIENT_FACILITIES, Tick::MIN, Some(request.boundary))?
            .iter()
            .filter_map(PatientFacilityLink::from_record)
            .filter(|link| facilities.contains(link.facility_id.as_str()))
            .collect();
        let patients = patient_scopes(&links, since);

        let mut planned: BTreeMap<(String, String), SyncLookupRow> = BTreeMap::new();
        let mut redacted = 0usize;
        for row in SyncLookupStore::scan_up_to(&txn, request.boundary)? {
            if !params.includes(&row.record_type) {
                continue;
            }
            let changed = row.updated_at_tick > since || params.is_full_resync(&row.record_type);
            let in_scope = match &row.scope {
                RecordScope::Patient { patient_id } => {
                    patients.full_catch_up.contains(patient_id)
                        || (changed && patients.incremental.contains(patient_id))
                }
                RecordScope::Facility { facility_id } => {
                    changed && facilities.contains(facility_id.as_str())
                }
                RecordScope::Global => changed,
                RecordScope::Unresolved => false,
            };
            if !in_scope {
                continue;
            }
            if row.is_sensitive && !check(&row) {
                redacted += 1;
                continue;
            }
            if is_echo(&row, &request) {
                continue;
            }
            planned.insert((row.record_type.clone(), row.record_id.clone()), row);
        }

        debug!(
            since,
            boundary = request.boundary,
            full_catch_up = patients.full_catch_up.len(),
            incremental = patients.incremental.len(),
            planned = planned.len(),
            redacted,
            "planned pull snapshot"
        );

        Ok(planned
            .into_values()
            .zip(1u64..)
            .map(|(row, id)| OutgoingChange::from_lookup(id, &row))
            .collect())
    }
}

/// Splits the linked patients into new and already-held ones. A patient new
/// to any requested facility is planned in full.
pub fn patient_scopes(links: &[PatientFacilityLink], since: Tick) -> PatientScopes {
    let mut scopes = PatientScopes::default();
    for link in links {
        if link.marked_for_sync_tick > since {
            scopes.full_catch_up.insert(link.patient_id.clone());
        }
    }
    for link in links {
        if !scopes.full_catch_up.contains(&link.patient_id) {
            scopes.incremental.insert(link.patient_id.clone());
        }
    }
    scopes
}

fn is_echo(row: &SyncLookupRow, request: &SnapshotRequest<'_>) -> bool {
    if request
        .echoed
        .contains(&(row.record_type.clone(), row.record_id.clone()))
    {
        return true;
    }
    match (request.device_id, row.pushed_by_device_id.as_deref()) {
        (Some(device), Some(pusher)) => request.params.since != NEVER_SYNCED && device == pusher,
        _ => false,
    }
}
