//! Simulate command implementation.

use super::{print_json, CliResult, OutputFormat};
use medsync_testkit::{concurrent_sync, StressConfig, TestCentral};
use serde::Serialize;

/// Simulation output.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateResult {
    /// Devices simulated.
    pub devices: usize,
    /// Sessions run to completion.
    pub completed_sessions: usize,
    /// Sessions that failed.
    pub failed_sessions: usize,
    /// Changes pushed.
    pub pushed_changes: usize,
    /// Changes pulled.
    pub pulled_changes: usize,
    /// Lookup passes run.
    pub lookup_runs: usize,
    /// Wall time in milliseconds.
    pub duration_ms: u128,
}

/// Runs the simulate command.
pub fn run(devices: usize, rounds: usize, changes: usize, format: OutputFormat) -> CliResult<()> {
    let central = TestCentral::threaded();
    let config = StressConfig {
        devices,
        rounds,
        changes_per_push: changes,
    };
    let result = concurrent_sync(&central, &config);

    match format {
        OutputFormat::Text => result.print_summary("Sync simulation"),
        OutputFormat::Json => print_json(&SimulateResult {
            devices,
            completed_sessions: result.completed_sessions,
            failed_sessions: result.failed_sessions,
            pushed_changes: result.pushed_changes,
            pulled_changes: result.pulled_changes,
            lookup_runs: result.lookup_runs,
            duration_ms: result.duration.as_millis(),
        })?,
    }
    Ok(())
}
