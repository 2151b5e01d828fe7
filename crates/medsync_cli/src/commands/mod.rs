//! CLI command implementations.

pub mod lookup;
pub mod plan;
pub mod simulate;

use medsync_engine::{CentralSyncManager, SyncError, PATIENT_FACILITIES};
use medsync_store::{Store, StoreError};
use medsync_testkit::{inline_config, standard_models};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::info;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// The engine failed.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Output could not be encoded.
    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),

    /// Unsupported `--format`.
    #[error("unknown output format '{0}' (expected text or json)")]
    UnknownFormat(String),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// How command results are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

impl OutputFormat {
    /// Parses a `--format` value.
    pub fn parse(value: &str) -> CliResult<Self> {
        match value {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(CliError::UnknownFormat(other.to_string())),
        }
    }
}

/// Prints `value` as JSON.
pub fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Creates a central server holding demo data for `patients` patients
/// spread over `facilities` facilities.
///
/// Every fifth patient gets a restricted lab request.
pub fn demo_central(patients: usize, facilities: usize) -> CliResult<CentralSyncManager> {
    let manager = CentralSyncManager::new(Store::new(), standard_models(), inline_config());
    let store = manager.store();
    let facilities = facilities.max(1);

    for f in 0..facilities {
        store.upsert("facilities", &format!("f{f}"), json!({ "name": format!("Facility {f}") }))?;
        store.upsert(
            "facility_settings",
            &format!("settings-f{f}"),
            json!({ "facilityId": format!("f{f}"), "openingHour": 8 }),
        )?;
    }
    for p in 0..patients {
        let patient_id = format!("p{p}");
        let facility_id = format!("f{}", p % facilities);
        manager.clock().tick_tock()?;
        store.upsert("patients", &patient_id, json!({ "id": patient_id }))?;
        store.upsert(
            PATIENT_FACILITIES,
            &format!("{patient_id}@{facility_id}"),
            json!({ "patientId": patient_id, "facilityId": facility_id }),
        )?;
        store.upsert(
            "encounters",
            &format!("e-{patient_id}"),
            json!({ "patientId": patient_id, "reason": "checkup" }),
        )?;
        store.upsert(
            "notes",
            &format!("n-{patient_id}"),
            json!({ "encounterId": format!("e-{patient_id}"), "text": "routine" }),
        )?;
        if p % 5 == 0 {
            store.upsert(
                "lab_requests",
                &format!("lab-{patient_id}"),
                json!({ "patientId": patient_id, "restricted": true }),
            )?;
        }
    }
    info!(patients, facilities, "demo data written");
    Ok(manager)
}
