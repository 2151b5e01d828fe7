//! Test fixtures and a seeded central server.

use crate::polling::{await_pull_ready, await_push_complete, await_session_ready, drain_snapshot};
use medsync_engine::{
    deny_sensitive, CentralSyncManager, ModelRegistry, ModelSpec, PermissionCheck, RetryConfig,
    SyncConfig, SyncDirection, SyncResult, PATIENT_FACILITIES,
};
use medsync_protocol::{
    IncomingChange, LookupRunReport, OutgoingChange, PullMetadata, PullParams, SessionDirection,
    SessionId, StartSessionOptions, Tick,
};
use medsync_store::Store;
use serde_json::{json, Value};
use std::time::Duration;

/// Page size used when draining snapshots.
pub const TEST_PAGE_SIZE: usize = 7;

/// Models of a small clinical schema:
///
/// | type                 | direction       | scope                         |
/// |----------------------|-----------------|-------------------------------|
/// | `patients`           | bidirectional   | patient `id`                  |
/// | `encounters`         | bidirectional   | patient `patientId`           |
/// | `notes`              | bidirectional   | `encounterId` -> encounter    |
/// | `lab_requests`       | bidirectional   | patient, sensitive if `restricted` |
/// | `patient_facilities` | bidirectional   | patient `patientId`           |
/// | `facility_settings`  | pull            | facility `facilityId`         |
/// | `facilities`         | pull            | global                        |
/// | `reference_data`     | pull            | global                        |
pub fn standard_models() -> ModelRegistry {
    ModelRegistry::new()
        .with(ModelSpec::new("patients", SyncDirection::Bidirectional).patient_field("id"))
        .with(ModelSpec::new("encounters", SyncDirection::Bidirectional).patient_field("patientId"))
        .with(
            ModelSpec::new("notes", SyncDirection::Bidirectional).patient_via(
                "encounterId",
                "encounters",
                "patientId",
            ),
        )
        .with(
            ModelSpec::new("lab_requests", SyncDirection::Bidirectional)
                .patient_field("patientId")
                .sensitive_when(|data| data.get("restricted") == Some(&Value::Bool(true))),
        )
        .with(
            ModelSpec::new(PATIENT_FACILITIES, SyncDirection::Bidirectional)
                .patient_field("patientId"),
        )
        .with(
            ModelSpec::new("facility_settings", SyncDirection::PullFromCentral)
                .facility_field("facilityId"),
        )
        .with(ModelSpec::new("facilities", SyncDirection::PullFromCentral))
        .with(ModelSpec::new("reference_data", SyncDirection::PullFromCentral))
}

/// Configuration that runs background work inline.
pub fn inline_config() -> SyncConfig {
    SyncConfig::default()
        .with_await_background_work(true)
        .with_clock_retry(fast_retry())
}

/// Configuration that runs background work on worker threads.
pub fn threaded_config() -> SyncConfig {
    SyncConfig::default()
        .with_await_background_work(false)
        .with_clock_retry(fast_retry())
}

fn fast_retry() -> RetryConfig {
    RetryConfig::new(20)
        .with_initial_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(20))
}

/// A fully pulled snapshot.
#[derive(Debug, Clone)]
pub struct PulledSnapshot {
    /// The session the pull ran in.
    pub session: SessionId,
    /// Snapshot metadata.
    pub metadata: PullMetadata,
    /// Every change of the snapshot, in cursor order.
    pub changes: Vec<OutgoingChange>,
}

impl PulledSnapshot {
    /// Returns `type:id` for each change, in cursor order.
    pub fn keys(&self) -> Vec<String> {
        self.changes
            .iter()
            .map(|c| format!("{}:{}", c.record_type, c.record_id))
            .collect()
    }

    /// Returns true if the snapshot contains the record.
    pub fn contains(&self, record_type: &str, record_id: &str) -> bool {
        self.changes
            .iter()
            .any(|c| c.record_type == record_type && c.record_id == record_id)
    }
}

/// A central server over an in-memory store with the standard models.
///
/// Setup helpers panic on failure; they are meant for tests.
#[derive(Debug, Clone)]
pub struct TestCentral {
    /// The manager under test.
    pub manager: CentralSyncManager,
}

impl TestCentral {
    /// Creates a central server that runs background work inline.
    pub fn new() -> Self {
        Self::with_config(inline_config())
    }

    /// Creates a central server that runs background work on threads.
    pub fn threaded() -> Self {
        Self::with_config(threaded_config())
    }

    /// Creates a central server with the standard models and `config`.
    pub fn with_config(config: SyncConfig) -> Self {
        Self::with_models(standard_models(), config)
    }

    /// Creates a central server with custom models.
    pub fn with_models(models: ModelRegistry, config: SyncConfig) -> Self {
        Self {
            manager: CentralSyncManager::new(Store::new(), models, config),
        }
    }

    /// Underlying store.
    pub fn store(&self) -> &Store {
        self.manager.store()
    }

    /// Current value of the global clock.
    pub fn current_tick(&self) -> Tick {
        self.manager
            .clock()
            .current_tick()
            .expect("Failed to read clock")
    }

    /// Moves the clock forward to `tick`.
    pub fn set_tick(&self, tick: Tick) {
        self.manager
            .clock()
            .fast_forward_to(tick)
            .expect("Failed to move clock");
    }

    /// Writes a record directly to the store.
    pub fn write(&self, table: &str, id: &str, data: Value) {
        self.store()
            .upsert(table, id, data)
            .expect("Failed to write record");
    }

    /// Creates a patient and marks it for sync at `facility_id`.
    pub fn seed_patient(&self, patient_id: &str, facility_id: &str) {
        self.write("patients", patient_id, json!({ "id": patient_id }));
        self.link_patient(patient_id, facility_id);
    }

    /// Marks a patient for sync at a facility.
    pub fn link_patient(&self, patient_id: &str, facility_id: &str) {
        self.write(
            PATIENT_FACILITIES,
            &format!("{patient_id}@{facility_id}"),
            json!({ "patientId": patient_id, "facilityId": facility_id }),
        );
    }

    /// Writes an encounter for a patient.
    pub fn seed_encounter(&self, encounter_id: &str, patient_id: &str) {
        self.write(
            "encounters",
            encounter_id,
            json!({ "patientId": patient_id, "reason": "checkup" }),
        );
    }

    /// Runs an incremental lookup pass.
    pub fn rebuild_lookup(&self) -> LookupRunReport {
        self.manager
            .update_lookup_table(false)
            .expect("Failed to update lookup table")
    }

    /// Starts a session and waits for it to be prepared.
    pub fn start(&self, options: StartSessionOptions) -> SyncResult<SessionId> {
        let id = self.manager.start_session(options)?;
        await_session_ready(&self.manager, id)?;
        Ok(id)
    }

    /// Plans a pull in an open session and drains it.
    pub fn pull_in(
        &self,
        session: SessionId,
        params: PullParams,
        check: PermissionCheck,
    ) -> SyncResult<PulledSnapshot> {
        self.manager.initiate_pull(session, params, check)?;
        await_pull_ready(&self.manager, session)?;
        let metadata = self.manager.fetch_pull_metadata(session)?;
        let changes = drain_snapshot(&self.manager, session, TEST_PAGE_SIZE)?;
        Ok(PulledSnapshot {
            session,
            metadata,
            changes,
        })
    }

    /// Runs a complete pull-only session and ends it.
    pub fn pull(
        &self,
        options: StartSessionOptions,
        params: PullParams,
        check: PermissionCheck,
    ) -> SyncResult<PulledSnapshot> {
        let session = self.start(options)?;
        let pulled = self.pull_in(session, params, check)?;
        self.manager.end_session(session)?;
        Ok(pulled)
    }

    /// Runs an initial pull for `facilities` without sensitive access.
    pub fn pull_initial(&self, facilities: &[&str]) -> SyncResult<PulledSnapshot> {
        self.pull(
            StartSessionOptions::new(SessionDirection::Pull).with_facilities(facilities.to_vec()),
            PullParams::initial(facilities.to_vec()),
            deny_sensitive(),
        )
    }

    /// Stages and persists a push in an open session.
    pub fn push_in(&self, session: SessionId, changes: Vec<IncomingChange>) -> SyncResult<Tick> {
        self.manager.add_incoming_changes(session, changes)?;
        self.manager.complete_push(session)?;
        await_push_complete(&self.manager, session)?;
        self.manager
            .inspect_session(session, |s| s.persisted_at_tick())?
            .ok_or(medsync_engine::SyncError::SessionNotReady(session))
    }

    /// Runs a complete push-only session from `device_id`.
    pub fn push(&self, device_id: &str, changes: Vec<IncomingChange>) -> SyncResult<Tick> {
        let session = self.start(
            StartSessionOptions::new(SessionDirection::Push).with_device(device_id),
        )?;
        self.push_in(session, changes)
    }
}

impl Default for TestCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestCentral {
    type Target = CentralSyncManager;

    fn deref(&self) -> &Self::Target {
        &self.manager
    }
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// A central server with `patients` patients spread over `facilities`
    /// facilities, each with `encounters` encounters, plus some reference
    /// data. The lookup table is built.
    pub fn populated_central(patients: usize, facilities: usize, encounters: usize) -> TestCentral {
        let central = TestCentral::new();
        populate(&central, patients, facilities, encounters);
        central.rebuild_lookup();
        central
    }

    /// Writes the population of [`populated_central`] into `central`.
    pub fn populate(central: &TestCentral, patients: usize, facilities: usize, encounters: usize) {
        let facilities = facilities.max(1);
        for f in 0..facilities {
            central.write("facilities", &format!("f{f}"), json!({ "name": format!("Facility {f}") }));
        }
        for r in 0..10 {
            central.write("reference_data", &format!("r{r}"), json!({ "code": r }));
        }
        for p in 0..patients {
            let patient_id = format!("p{p}");
            central.seed_patient(&patient_id, &format!("f{}", p % facilities));
            for e in 0..encounters {
                central.seed_encounter(&format!("e{p}-{e}"), &patient_id);
            }
        }
    }
}
