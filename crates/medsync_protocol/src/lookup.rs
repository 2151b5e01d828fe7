//! Lookup rows and lookup run reports.

use crate::Tick;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;

/// One denormalized row per replicable record.
///
/// Identity is `(record_type, record_id)`; the same ID may appear under
/// several record types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLookupRow {
    /// Source record ID.
    pub record_id: String,
    /// Source record type.
    pub record_type: String,
    /// Projection of the source record as of capture.
    pub data: Value,
    /// Whether the record is of a restricted kind.
    pub is_sensitive: bool,
    /// Whether the source record was deleted.
    pub is_deleted: bool,
    /// Tick at which the projection was captured.
    pub updated_at_tick: Tick,
    /// Which facilities the row is replicated to.
    pub scope: RecordScope,
    /// Device whose push produced the captured version, if any.
    #[serde(default)]
    pub pushed_by_device_id: Option<String>,
}

impl SyncLookupRow {
    /// Returns the `(record_type, record_id)` identity.
    #[must_use]
    pub fn key(&self) -> (&str, &str) {
        (&self.record_type, &self.record_id)
    }
}

/// Replication scope of a lookup row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RecordScope {
    /// Reference data sent to every facility.
    Global,
    /// Data tied to one facility.
    Facility {
        /// Facility ID.
        #[serde(rename = "facilityId")]
        facility_id: String,
    },
    /// Data belonging to a patient; sent where the patient is marked for sync.
    Patient {
        /// Patient ID.
        #[serde(rename = "patientId")]
        patient_id: String,
    },
    /// Patient data whose patient could not be resolved. Sent nowhere.
    Unresolved,
}

impl RecordScope {
    /// Returns the patient, for patient-scoped rows.
    #[must_use]
    pub fn patient_id(&self) -> Option<&str> {
        match self {
            RecordScope::Patient { patient_id } => Some(patient_id),
            _ => None,
        }
    }

    /// Returns the facility, for facility-scoped rows.
    #[must_use]
    pub fn facility_id(&self) -> Option<&str> {
        match self {
            RecordScope::Facility { facility_id } => Some(facility_id),
            _ => None,
        }
    }
}

/// Outcome of a successful lookup-table run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupRunReport {
    /// Watermark the run started from (`-1` for a full build).
    pub since: Tick,
    /// Watermark the run advanced to.
    pub up_to: Tick,
    /// Number of lookup rows written.
    pub changes_count: usize,
    /// When the run started.
    pub started_at: SystemTime,
    /// When the run committed.
    pub completed_at: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scope_accessors() {
        let scope = RecordScope::Patient {
            patient_id: "p1".into(),
        };
        assert_eq!(scope.patient_id(), Some("p1"));
        assert_eq!(scope.facility_id(), None);
        assert_eq!(RecordScope::Global.patient_id(), None);
    }

    #[test]
    fn scope_is_tagged() {
        let value = serde_json::to_value(RecordScope::Facility {
            facility_id: "f1".into(),
        })
        .unwrap();
        assert_eq!(value, json!({ "kind": "facility", "facilityId": "f1" }));
    }
}
