//! Plan command implementation.

use super::{demo_central, print_json, CliResult, OutputFormat};
use medsync_engine::{allow_sensitive, deny_sensitive};
use medsync_protocol::{
    OutgoingChange, PagingOptions, PullParams, SessionDirection, StartSessionOptions,
    NEVER_SYNCED,
};
use serde::Serialize;

/// Plan command output.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResult {
    /// Facility pulled for.
    pub facility_id: String,
    /// Lower tick bound of the pull.
    pub since: i64,
    /// Session boundary.
    pub pull_until: i64,
    /// Size of the snapshot.
    pub total_to_pull: usize,
    /// The listed changes.
    pub changes: Vec<OutgoingChange>,
}

/// Runs the plan command.
pub fn run(
    facility: &str,
    since: Option<i64>,
    patients: usize,
    sensitive: bool,
    limit: Option<usize>,
    format: OutputFormat,
) -> CliResult<()> {
    let manager = demo_central(patients, 4)?;
    manager.update_lookup_table(false)?;

    let session = manager.start_session(
        StartSessionOptions::new(SessionDirection::Pull).with_facilities([facility]),
    )?;
    let since = since.unwrap_or(NEVER_SYNCED);
    let check = if sensitive {
        allow_sensitive()
    } else {
        deny_sensitive()
    };
    manager.setup_snapshot_for_pull(session, PullParams::new(since, [facility]), check)?;
    let metadata = manager.fetch_pull_metadata(session)?;

    let mut paging = PagingOptions::default();
    if let Some(limit) = limit {
        paging = paging.with_limit(limit);
    }
    let changes = manager.get_outgoing_changes(session, paging)?;
    manager.end_session(session)?;

    let result = PlanResult {
        facility_id: facility.to_string(),
        since,
        pull_until: metadata.pull_until,
        total_to_pull: metadata.total_to_pull,
        changes,
    };

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Text => {
            println!(
                "Facility {} since {} (boundary {}): {} changes",
                result.facility_id, result.since, result.pull_until, result.total_to_pull
            );
            for change in &result.changes {
                let marker = if change.is_deleted { " (deleted)" } else { "" };
                println!(
                    "  {:>5}  {}:{}{}",
                    change.id, change.record_type, change.record_id, marker
                );
            }
            if result.changes.len() < result.total_to_pull {
                println!("  ... {} more", result.total_to_pull - result.changes.len());
            }
        }
    }
    Ok(())
}
