//! Lookup command implementation.

use super::{demo_central, print_json, CliResult, OutputFormat};
use medsync_engine::LookupRunRecord;
use serde::Serialize;
use std::time::UNIX_EPOCH;

/// Lookup command output.
#[derive(Debug, Serialize)]
pub struct LookupResult {
    /// Rows in the lookup table after the last run.
    pub lookup_rows: usize,
    /// Watermark after the last run.
    pub up_to_tick: Option<i64>,
    /// Every recorded run.
    pub runs: Vec<LookupRunRecord>,
}

/// Runs the lookup command.
pub fn run(patients: usize, facilities: usize, force: bool, format: OutputFormat) -> CliResult<()> {
    let manager = demo_central(patients, facilities)?;
    manager.update_lookup_table(false)?;
    // An incremental pass with nothing new
    manager.update_lookup_table(false)?;
    if force {
        manager.update_lookup_table(true)?;
    }

    let builder = manager.lookup_builder();
    let lookup_rows = medsync_engine::SyncLookupStore::scan(&manager.store().begin())?.len();
    let result = LookupResult {
        lookup_rows,
        up_to_tick: builder.watermark()?,
        runs: builder.debug_log().lookup_runs()?,
    };

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Text => {
            println!("Lookup rows: {}", result.lookup_rows);
            match result.up_to_tick {
                Some(tick) => println!("Up to tick: {tick}"),
                None => println!("Up to tick: (not built)"),
            }
            println!("Runs:");
            for run in &result.runs {
                let took = run
                    .completed_at
                    .duration_since(run.started_at)
                    .unwrap_or_default();
                let started = run
                    .started_at
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or_default();
                match &run.error {
                    Some(error) => println!("  [{started}] since {} FAILED: {error}", run.since),
                    None => println!(
                        "  [{started}] since {} up to {} -> {} changes in {took:?}",
                        run.since,
                        run.up_to.unwrap_or_default(),
                        run.changes_count.unwrap_or_default()
                    ),
                }
            }
        }
    }
    Ok(())
}
