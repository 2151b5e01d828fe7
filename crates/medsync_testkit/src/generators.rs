//! Property-based test generators using proptest.

use crate::fixtures::TestCentral;
use medsync_protocol::IncomingChange;
use proptest::prelude::*;
use serde_json::json;

/// Strategy for generating record IDs.
pub fn record_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9]{1,12}").expect("Invalid regex")
}

/// Strategy for picking one of `count` facility IDs (`f0`, `f1`, ...).
pub fn facility_id_strategy(count: usize) -> impl Strategy<Value = String> {
    (0..count.max(1)).prop_map(|f| format!("f{f}"))
}

/// A direct write to the central store.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Creates or updates a patient marked for sync at a facility.
    Patient {
        /// Patient ID.
        patient_id: String,
        /// Facility ID.
        facility_id: String,
    },
    /// Creates or updates an encounter of a patient.
    Encounter {
        /// Encounter ID.
        encounter_id: String,
        /// Patient ID.
        patient_id: String,
    },
    /// Creates or updates a reference-data row.
    Reference {
        /// Row ID.
        id: String,
    },
    /// Rebuilds the lookup table.
    RebuildLookup,
}

impl WriteOp {
    /// Applies the write.
    pub fn apply(&self, central: &TestCentral) {
        match self {
            WriteOp::Patient {
                patient_id,
                facility_id,
            } => central.seed_patient(patient_id, facility_id),
            WriteOp::Encounter {
                encounter_id,
                patient_id,
            } => central.seed_encounter(encounter_id, patient_id),
            WriteOp::Reference { id } => {
                central.write("reference_data", id, json!({ "code": id }));
            }
            WriteOp::RebuildLookup => {
                central.rebuild_lookup();
            }
        }
    }
}

/// Strategy for a single write over a small ID space, so that updates hit
/// existing rows.
pub fn write_op_strategy(facilities: usize) -> impl Strategy<Value = WriteOp> {
    prop_oneof![
        ((0..8usize), facility_id_strategy(facilities)).prop_map(|(p, facility_id)| {
            WriteOp::Patient {
                patient_id: format!("p{p}"),
                facility_id,
            }
        }),
        ((0..16usize), (0..8usize)).prop_map(|(e, p)| WriteOp::Encounter {
            encounter_id: format!("e{e}"),
            patient_id: format!("p{p}"),
        }),
        (0..4usize).prop_map(|r| WriteOp::Reference { id: format!("r{r}") }),
        Just(WriteOp::RebuildLookup),
    ]
}

/// Strategy for a sequence of writes.
pub fn write_ops_strategy(
    facilities: usize,
    max_len: usize,
) -> impl Strategy<Value = Vec<WriteOp>> {
    prop::collection::vec(write_op_strategy(facilities), 1..max_len.max(2))
}

/// Strategy for pushed encounter changes of one patient.
pub fn pushed_encounters_strategy(patient_id: String) -> impl Strategy<Value = Vec<IncomingChange>> {
    prop::collection::vec((record_id_strategy(), any::<bool>()), 1..10).prop_map(move |rows| {
        rows.into_iter()
            .map(|(id, deleted)| {
                let data = json!({ "patientId": patient_id });
                if deleted {
                    IncomingChange::deletion("encounters", id, data)
                } else {
                    IncomingChange::upsert("encounters", id, data)
                }
            })
            .collect()
    })
}
