//! Clock, lookup and session behavior under concurrent access.

use medsync_engine::{
    deny_sensitive, LookupProjection, ModelSpec, RetryConfig, SyncClock, SyncDirection,
    SyncLookupStore, SyncResult, SyncableModel,
};
use medsync_protocol::{IncomingChange, PullParams, SessionDirection, StartSessionOptions, Tick};
use medsync_store::{Store, StoredRecord, Transaction};
use medsync_testkit::prelude::*;
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
enum ClockOp {
    Reserve,
    TickTock,
    Boundary,
    FastForward(Tick),
}

fn clock_op() -> impl Strategy<Value = ClockOp> {
    prop_oneof![
        Just(ClockOp::Reserve),
        Just(ClockOp::TickTock),
        Just(ClockOp::Boundary),
        (0..200i64).prop_map(ClockOp::FastForward),
    ]
}

fn test_clock() -> SyncClock {
    SyncClock::new(
        Store::new(),
        RetryConfig::new(50).with_initial_delay(Duration::from_millis(1)),
    )
}

proptest! {
    #[test]
    fn issued_ticks_strictly_increase(ops in prop::collection::vec(clock_op(), 1..60)) {
        let clock = test_clock();
        let mut issued: Vec<Tick> = Vec::new();
        for op in ops {
            match op {
                ClockOp::Reserve => issued.push(clock.reserve_and_advance().unwrap().tick()),
                ClockOp::TickTock => issued.push(clock.tick_tock().unwrap().tick),
                ClockOp::Boundary => issued.push(clock.publish_boundary().unwrap()),
                ClockOp::FastForward(to) => {
                    clock.fast_forward_to(to).unwrap();
                }
            }
        }
        for pair in issued.windows(2) {
            prop_assert!(pair[0] < pair[1], "{:?}", issued);
        }
        prop_assert!(issued.iter().all(|&tick| tick <= clock.current_tick().unwrap()));
    }
}

#[test]
fn concurrent_reservations_are_unique() {
    let clock = test_clock();
    let ticks: Vec<Tick> = thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let clock = clock.clone();
                scope.spawn(move || {
                    (0..50)
                        .map(|_| clock.reserve_and_advance().unwrap().tick())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect()
    });
    let unique: BTreeSet<Tick> = ticks.iter().copied().collect();
    assert_eq!(unique.len(), 8 * 50);
    assert_eq!(clock.pending_reservations(), 0);
}

#[test]
fn session_boundary_waits_for_in_flight_push() {
    let central = TestCentral::threaded();
    central.rebuild_lookup();

    let reservation = central.clock().reserve_and_advance().unwrap();
    let session = central
        .start_session(StartSessionOptions::new(SessionDirection::Pull).with_facilities(["F"]))
        .unwrap();

    thread::sleep(Duration::from_millis(50));
    assert!(!central.check_session_ready(session).unwrap());

    let reserved = reservation.tick();
    drop(reservation);
    assert!(wait_until(DEFAULT_WAIT, || central.check_session_ready(session)).unwrap());
    let boundary = central.fetch_sync_metadata(session).unwrap().started_at_tick;
    assert!(boundary > reserved);
}

/// Pauses the first lookup pass inside its read transaction.
struct Gate {
    armed: AtomicBool,
    entered: Barrier,
    release: Barrier,
}

impl Gate {
    fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        }
    }
}

struct GatedModel {
    inner: ModelSpec,
    gate: Arc<Gate>,
}

impl SyncableModel for GatedModel {
    fn record_type(&self) -> &str {
        self.inner.record_type()
    }

    fn sync_direction(&self) -> SyncDirection {
        self.inner.sync_direction()
    }

    fn find_changed_since(
        &self,
        txn: &Transaction,
        since: Tick,
        up_to: Tick,
    ) -> SyncResult<Vec<StoredRecord>> {
        if self.gate.armed.swap(false, Ordering::SeqCst) {
            self.gate.entered.wait();
            self.gate.release.wait();
        }
        self.inner.find_changed_since(txn, since, up_to)
    }

    fn project(&self, txn: &Transaction, record: &StoredRecord) -> SyncResult<LookupProjection> {
        self.inner.project(txn, record)
    }
}

fn lookup_keys(central: &TestCentral) -> BTreeSet<String> {
    SyncLookupStore::scan(&central.store().begin())
        .unwrap()
        .into_iter()
        .map(|row| format!("{}:{}", row.record_type, row.record_id))
        .collect()
}

#[test]
fn writes_during_lookup_pass_wait_for_the_next_pass() {
    let gate = Arc::new(Gate::new());
    let models = standard_models().with(GatedModel {
        inner: ModelSpec::new("encounters", SyncDirection::Bidirectional)
            .patient_field("patientId"),
        gate: Arc::clone(&gate),
    });
    let central = TestCentral::with_models(models, inline_config());
    central.seed_patient("P", "F");
    central.seed_encounter("first", "P");
    central.rebuild_lookup();
    central.seed_encounter("before-pass", "P");

    gate.armed.store(true, Ordering::SeqCst);
    let report = thread::scope(|scope| {
        let pass = scope.spawn(|| central.update_lookup_table(false));
        gate.entered.wait();
        central.seed_encounter("during-pass", "P");
        central.write("reference_data", "r-during", json!({ "code": 1 }));
        gate.release.wait();
        pass.join().unwrap().unwrap()
    });
    assert_eq!(report.changes_count, 1);

    let keys = lookup_keys(&central);
    assert!(keys.contains("encounters:first"));
    assert!(keys.contains("encounters:before-pass"));
    assert!(!keys.contains("encounters:during-pass"));
    assert!(!keys.contains("reference_data:r-during"));

    central.rebuild_lookup();
    let keys = lookup_keys(&central);
    assert!(keys.contains("encounters:during-pass"));
    assert!(keys.contains("reference_data:r-during"));
}

#[test]
fn overlapping_lookup_passes_fail_fast() {
    let gate = Arc::new(Gate::new());
    let models = standard_models().with(GatedModel {
        inner: ModelSpec::new("encounters", SyncDirection::Bidirectional)
            .patient_field("patientId"),
        gate: Arc::clone(&gate),
    });
    let central = TestCentral::with_models(models, inline_config());

    gate.armed.store(true, Ordering::SeqCst);
    thread::scope(|scope| {
        let pass = scope.spawn(|| central.update_lookup_table(false));
        gate.entered.wait();
        let err = central.update_lookup_table(false).unwrap_err();
        assert!(err.is_retryable());
        gate.release.wait();
        pass.join().unwrap().unwrap();
    });
}

#[test]
fn threaded_devices_sync_without_failures() {
    let central = TestCentral::threaded();
    let config = StressConfig {
        devices: 4,
        rounds: 4,
        changes_per_push: 3,
    };
    let result = concurrent_sync(&central, &config);
    assert_eq!(result.failed_sessions, 0);
    assert_eq!(result.pushed_changes, 4 * 4 * 3);

    central.rebuild_lookup();
    let observer = central
        .pull(
            StartSessionOptions::new(SessionDirection::Pull)
                .with_facilities(["f0"])
                .with_device("observer"),
            PullParams::initial(["f0"]),
            deny_sensitive(),
        )
        .unwrap();
    let encounters = observer
        .changes
        .iter()
        .filter(|c| c.record_type == "encounters")
        .count();
    assert_eq!(encounters, config.rounds * config.changes_per_push);
}

#[test]
fn pushes_from_many_threads_all_land() {
    let central = TestCentral::threaded();
    central.seed_patient("P", "F");
    central.rebuild_lookup();

    let ticks: Vec<Tick> = thread::scope(|scope| {
        let workers: Vec<_> = (0..6)
            .map(|d| {
                let central = &central;
                scope.spawn(move || {
                    central
                        .push(
                            &format!("device-{d}"),
                            vec![IncomingChange::upsert(
                                "encounters",
                                format!("e{d}"),
                                json!({ "patientId": "P" }),
                            )],
                        )
                        .unwrap()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });
    let unique: BTreeSet<Tick> = ticks.iter().copied().collect();
    assert_eq!(unique.len(), 6);

    for d in 0..6 {
        let row = central
            .store()
            .find("encounters", &format!("e{d}"))
            .unwrap()
            .unwrap();
        assert!(unique.contains(&row.updated_at_tick));
    }
}

#[test]
fn snapshot_planning_is_bounded_separately_from_sessions() {
    let central = TestCentral::with_config(
        threaded_config()
            .with_max_concurrent_sessions(8)
            .with_max_concurrent_snapshots(1),
    );
    scenarios::populate(&central, 6, 2, 3);
    central.rebuild_lookup();

    let sizes: Vec<usize> = thread::scope(|scope| {
        let workers: Vec<_> = (0..4)
            .map(|d| {
                let central = &central;
                scope.spawn(move || {
                    central
                        .pull(
                            StartSessionOptions::new(SessionDirection::Pull)
                                .with_facilities(["f0"])
                                .with_device(format!("device-{d}")),
                            PullParams::initial(["f0"]),
                            deny_sensitive(),
                        )
                        .unwrap()
                        .changes
                        .len()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert!(sizes.iter().all(|&n| n == sizes[0] && n > 0));
    assert_eq!(central.snapshots_in_progress(), 0);
}
