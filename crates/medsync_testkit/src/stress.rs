//! Concurrent sync stress runs.
//!
//! Several devices push and pull at once while the lookup table is rebuilt
//! in a loop, the way a busy central server sees traffic.

use crate::fixtures::TestCentral;
use medsync_engine::{deny_sensitive, SyncError};
use medsync_protocol::{IncomingChange, PullParams, SessionDirection, StartSessionOptions};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Sessions run to completion.
    pub completed_sessions: usize,
    /// Sessions that failed.
    pub failed_sessions: usize,
    /// Changes pushed.
    pub pushed_changes: usize,
    /// Changes pulled.
    pub pulled_changes: usize,
    /// Lookup passes run during the test.
    pub lookup_runs: usize,
    /// Total duration.
    pub duration: Duration,
    /// Sessions per second.
    pub sessions_per_second: f64,
}

impl StressTestResult {
    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Completed sessions: {}", self.completed_sessions);
        println!("Failed sessions: {}", self.failed_sessions);
        println!("Pushed changes: {}", self.pushed_changes);
        println!("Pulled changes: {}", self.pulled_changes);
        println!("Lookup runs: {}", self.lookup_runs);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} sessions/sec", self.sessions_per_second);
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of concurrent devices, one facility and patient each.
    pub devices: usize,
    /// Push-then-pull rounds per device.
    pub rounds: usize,
    /// Encounters pushed per round.
    pub changes_per_push: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            devices: 4,
            rounds: 10,
            changes_per_push: 5,
        }
    }
}

/// Runs `config.devices` devices against `central` concurrently.
///
/// Device `d` owns patient `p{d}` at facility `f{d}`, so every push lands in
/// exactly one facility's scope.
pub fn concurrent_sync(central: &TestCentral, config: &StressConfig) -> StressTestResult {
    for d in 0..config.devices {
        central.seed_patient(&format!("p{d}"), &format!("f{d}"));
    }
    central.rebuild_lookup();

    let completed = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let pushed = AtomicUsize::new(0);
    let pulled = AtomicUsize::new(0);
    let lookup_runs = AtomicUsize::new(0);
    let done = AtomicBool::new(false);

    let start = Instant::now();
    thread::scope(|scope| {
        scope.spawn(|| {
            while !done.load(Ordering::Acquire) {
                match central.update_lookup_table(false) {
                    Ok(_) => {
                        lookup_runs.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(SyncError::LookupInProgress) => {}
                    Err(_) => {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                thread::sleep(Duration::from_millis(1));
            }
        });

        let workers: Vec<_> = (0..config.devices)
            .map(|d| {
                let (completed, failed, pushed, pulled) = (&completed, &failed, &pushed, &pulled);
                scope.spawn(move || {
                    let device = format!("device-{d}");
                    let patient = format!("p{d}");
                    let facility = format!("f{d}");
                    for round in 0..config.rounds {
                        let changes: Vec<IncomingChange> = (0..config.changes_per_push)
                            .map(|c| {
                                IncomingChange::upsert(
                                    "encounters",
                                    format!("{device}-{round}-{c}"),
                                    json!({ "patientId": patient, "round": round }),
                                )
                            })
                            .collect();
                        match central.push(&device, changes) {
                            Ok(_) => {
                                completed.fetch_add(1, Ordering::Relaxed);
                                pushed.fetch_add(config.changes_per_push, Ordering::Relaxed);
                            }
                            Err(_) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                            }
                        }

                        let pull = central.pull(
                            StartSessionOptions::new(SessionDirection::Pull)
                                .with_facilities([facility.as_str()])
                                .with_device(device.as_str()),
                            PullParams::initial([facility.as_str()]),
                            deny_sensitive(),
                        );
                        match pull {
                            Ok(snapshot) => {
                                completed.fetch_add(1, Ordering::Relaxed);
                                pulled.fetch_add(snapshot.changes.len(), Ordering::Relaxed);
                            }
                            Err(_) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            if worker.join().is_err() {
                failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        done.store(true, Ordering::Release);
    });
    let duration = start.elapsed();

    let completed_sessions = completed.into_inner();
    let sessions_per_second = if duration.as_secs_f64() > 0.0 {
        completed_sessions as f64 / duration.as_secs_f64()
    } else {
        0.0
    };

    StressTestResult {
        completed_sessions,
        failed_sessions: failed.into_inner(),
        pushed_changes: pushed.into_inner(),
        pulled_changes: pulled.into_inner(),
        lookup_runs: lookup_runs.into_inner(),
        duration,
        sessions_per_second,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_concurrent_run_completes() {
        let central = TestCentral::threaded();
        let config = StressConfig {
            devices: 3,
            rounds: 3,
            changes_per_push: 2,
        };
        let result = concurrent_sync(&central, &config);
        assert_eq!(result.failed_sessions, 0);
        assert_eq!(result.completed_sessions, 3 * 3 * 2);
        assert_eq!(result.pushed_changes, 3 * 3 * 2);
    }
}
