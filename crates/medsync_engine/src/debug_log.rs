//! Observability sink for lookup-table runs.

use crate::error::SyncResult;
use medsync_store::{Store, Tick};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::SystemTime;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Table the sink writes to.
pub const DEBUG_LOGS: &str = "debug_logs";

const LOOKUP_RUN_TYPE: &str = "syncLookupUpdate";

/// One lookup-table run, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupRunRecord {
    /// Watermark the run started from.
    pub since: Tick,
    /// Watermark the run advanced to, if it committed.
    pub up_to: Option<Tick>,
    /// Lookup rows written, if it committed.
    pub changes_count: Option<usize>,
    /// When the run started.
    pub started_at: SystemTime,
    /// When the run committed or failed.
    pub completed_at: SystemTime,
    /// Failure cause.
    pub error: Option<String>,
}

/// Persists run records to the store and mirrors them as tracing events.
#[derive(Debug, Clone)]
pub struct DebugLog {
    store: Store,
}

impl DebugLog {
    /// Creates a sink writing to `store`.
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Records a lookup-table run.
    pub fn record_lookup_run(&self, run: &LookupRunRecord) -> SyncResult<()> {
        match &run.error {
            None => info!(
                since = run.since,
                up_to = run.up_to,
                changes_count = run.changes_count,
                "sync lookup table updated"
            ),
            Some(err) => error!(since = run.since, error = %err, "sync lookup table update failed"),
        }
        let info = serde_json::to_value(run)?;
        self.store.create(
            DEBUG_LOGS,
            &Uuid::new_v4().to_string(),
            json!({ "type": LOOKUP_RUN_TYPE, "info": info }),
        )?;
        Ok(())
    }

    /// Returns the recorded lookup runs, oldest first.
    pub fn lookup_runs(&self) -> SyncResult<Vec<LookupRunRecord>> {
        let mut runs: Vec<LookupRunRecord> = self
            .store
            .scan(DEBUG_LOGS)?
            .into_iter()
            .filter(|row| row.field_str("type") == Some(LOOKUP_RUN_TYPE))
            .filter_map(|row| match serde_json::from_value(row.data["info"].clone()) {
                Ok(run) => Some(run),
                Err(err) => {
                    warn!(id = %row.id, error = %err, "skipping unreadable lookup run record");
                    None
                }
            })
            .collect();
        runs.sort_by_key(|run| run.started_at);
        Ok(runs)
    }
}
