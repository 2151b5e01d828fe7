//! Syncable record models.
//!
//! Every record type that takes part in replication registers a
//! [`SyncableModel`] adapter in a [`ModelRegistry`]. Most types are fully
//! described by a declarative [`ModelSpec`]; types with unusual scoping
//! rules implement the trait directly.

use crate::error::{SyncError, SyncResult};
use medsync_protocol::{IncomingChange, RecordScope};
use medsync_store::{StoredRecord, Tick, Transaction};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Table holding patient-to-facility sync links.
pub const PATIENT_FACILITIES: &str = "patient_facilities";

/// Which way records of a type travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncDirection {
    /// Never replicated.
    DoNotSync,
    /// Central to facilities only.
    PullFromCentral,
    /// Facilities to central only.
    PushToCentral,
    /// Both ways.
    Bidirectional,
}

impl SyncDirection {
    /// Returns true if central sends records of this type.
    pub fn pulls(self) -> bool {
        matches!(
            self,
            SyncDirection::PullFromCentral | SyncDirection::Bidirectional
        )
    }

    /// Returns true if facilities may send records of this type.
    pub fn pushes(self) -> bool {
        matches!(
            self,
            SyncDirection::PushToCentral | SyncDirection::Bidirectional
        )
    }
}

/// How a record appears in the lookup table.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupProjection {
    /// Replication scope.
    pub scope: RecordScope,
    /// Whether the record is of a restricted kind.
    pub is_sensitive: bool,
    /// Denormalized data sent to facilities.
    pub data: Value,
}

/// Adapter between a record type and the sync engine.
pub trait SyncableModel: Send + Sync {
    /// Table (record type) name.
    fn record_type(&self) -> &str;

    /// Direction records of this type travel in.
    fn sync_direction(&self) -> SyncDirection;

    /// Rows whose tick lies in `(since, up_to]`, tombstones included.
    fn find_changed_since(
        &self,
        txn: &Transaction,
        since: Tick,
        up_to: Tick,
    ) -> SyncResult<Vec<StoredRecord>> {
        Ok(txn.changed_since(self.record_type(), since, Some(up_to))?)
    }

    /// Computes the lookup projection of a row.
    fn project(&self, txn: &Transaction, record: &StoredRecord) -> SyncResult<LookupProjection>;

    /// Applies a pushed change: a tombstone if it is a deletion, otherwise a
    /// create or an update of the row with the change's ID.
    fn apply_change(&self, txn: &mut Transaction, change: &IncomingChange) -> SyncResult<()> {
        if !change.data.is_object() {
            return Err(SyncError::InvalidChange {
                record_type: change.record_type.clone(),
                record_id: change.record_id.clone(),
                reason: "data must be an object".into(),
            });
        }
        let table = self.record_type();
        if change.is_deleted {
            txn.tombstone(table, &change.record_id, change.data.clone())?;
        } else {
            txn.upsert(table, &change.record_id, change.data.clone())?;
        }
        Ok(())
    }
}

/// Predicate marking a record as sensitive.
pub type SensitivityCheck = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// How a model finds the patient a row belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatientScope {
    /// Not patient data.
    None,
    /// The row has a column holding the patient ID.
    Field(String),
    /// The row references a parent row that holds the patient ID.
    Via {
        /// Column holding the parent ID.
        field: String,
        /// Parent record type.
        parent_type: String,
        /// Parent column holding the patient ID.
        parent_field: String,
    },
}

/// Declarative [`SyncableModel`].
///
/// ```
/// use medsync_engine::{ModelSpec, SyncDirection};
///
/// let notes = ModelSpec::new("notes", SyncDirection::Bidirectional)
///     .patient_via("encounterId", "encounters", "patientId");
/// ```
#[derive(Clone)]
pub struct ModelSpec {
    record_type: String,
    direction: SyncDirection,
    patient: PatientScope,
    facility_field: Option<String>,
    sensitive: Option<SensitivityCheck>,
}

impl ModelSpec {
    /// Creates a model of global (unscoped) data.
    pub fn new(record_type: impl Into<String>, direction: SyncDirection) -> Self {
        Self {
            record_type: record_type.into(),
            direction,
            patient: PatientScope::None,
            facility_field: None,
            sensitive: None,
        }
    }

    /// Scopes rows to the patient named in `field`.
    #[must_use]
    pub fn patient_field(mut self, field: impl Into<String>) -> Self {
        self.patient = PatientScope::Field(field.into());
        self
    }

    /// Scopes rows to the patient of the parent row referenced by `field`.
    #[must_use]
    pub fn patient_via(
        mut self,
        field: impl Into<String>,
        parent_type: impl Into<String>,
        parent_field: impl Into<String>,
    ) -> Self {
        self.patient = PatientScope::Via {
            field: field.into(),
            parent_type: parent_type.into(),
            parent_field: parent_field.into(),
        };
        self
    }

    /// Scopes rows to the facility named in `field`.
    #[must_use]
    pub fn facility_field(mut self, field: impl Into<String>) -> Self {
        self.facility_field = Some(field.into());
        self
    }

    /// Marks rows sensitive when `check` returns true for their data.
    #[must_use]
    pub fn sensitive_when<F>(mut self, check: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.sensitive = Some(Arc::new(check));
        self
    }

    /// Returns the patient scoping rule.
    pub fn patient_scope(&self) -> &PatientScope {
        &self.patient
    }

    fn resolve_scope(&self, txn: &Transaction, record: &StoredRecord) -> SyncResult<RecordScope> {
        let patient_id = match &self.patient {
            PatientScope::None => {
                return Ok(match &self.facility_field {
                    None => RecordScope::Global,
                    Some(field) => record
                        .field_str(field)
                        .map_or(RecordScope::Unresolved, |id| RecordScope::Facility {
                            facility_id: id.to_string(),
                        }),
                });
            }
            PatientScope::Field(field) => record.field_str(field).map(str::to_string),
            PatientScope::Via {
                field,
                parent_type,
                parent_field,
            } => match record.field_str(field) {
                Some(parent_id) => txn
                    .find(parent_type, parent_id)?
                    .and_then(|parent| parent.field_str(parent_field).map(str::to_string)),
                None => None,
            },
        };
        Ok(patient_id.map_or(RecordScope::Unresolved, |patient_id| {
            RecordScope::Patient { patient_id }
        }))
    }
}

impl fmt::Debug for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSpec")
            .field("record_type", &self.record_type)
            .field("direction", &self.direction)
            .field("patient", &self.patient)
            .field("facility_field", &self.facility_field)
            .field("sensitive", &self.sensitive.is_some())
            .finish()
    }
}

impl SyncableModel for ModelSpec {
    fn record_type(&self) -> &str {
        &self.record_type
    }

    fn sync_direction(&self) -> SyncDirection {
        self.direction
    }

    fn project(&self, txn: &Transaction, record: &StoredRecord) -> SyncResult<LookupProjection> {
        Ok(LookupProjection {
            scope: self.resolve_scope(txn, record)?,
            is_sensitive: self
                .sensitive
                .as_ref()
                .is_some_and(|check| check(&record.data)),
            data: record.data.clone(),
        })
    }
}

/// A patient marked for sync at a facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientFacilityLink {
    /// Patient ID.
    pub patient_id: String,
    /// Facility ID.
    pub facility_id: String,
    /// Tick at which the link was last written.
    pub marked_for_sync_tick: Tick,
}

impl PatientFacilityLink {
    /// Reads a link from a `patient_facilities` row. Deleted or incomplete
    /// rows yield `None`.
    pub fn from_record(record: &StoredRecord) -> Option<Self> {
        if record.is_deleted {
            return None;
        }
        Some(Self {
            patient_id: record.field_str("patientId")?.to_string(),
            facility_id: record.field_str("facilityId")?.to_string(),
            marked_for_sync_tick: record.updated_at_tick,
        })
    }
}

/// The set of syncable models, keyed by record type.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<dyn SyncableModel>>,
}

impl ModelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model, replacing any model for the same record type.
    pub fn register(&mut self, model: impl SyncableModel + 'static) -> &mut Self {
        self.models
            .insert(model.record_type().to_string(), Arc::new(model));
        self
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, model: impl SyncableModel + 'static) -> Self {
        self.register(model);
        self
    }

    /// Returns the model for a record type.
    pub fn get(&self, record_type: &str) -> Option<&Arc<dyn SyncableModel>> {
        self.models.get(record_type)
    }

    /// Models whose records are materialized into the lookup table.
    pub fn pull_models(&self) -> impl Iterator<Item = &Arc<dyn SyncableModel>> {
        self.models
            .values()
            .filter(|model| model.sync_direction().pulls())
    }

    /// Returns the model that accepts a pushed change, or the reason it is
    /// refused.
    pub fn push_model(&self, change: &IncomingChange) -> SyncResult<&Arc<dyn SyncableModel>> {
        let model = self
            .get(&change.record_type)
            .ok_or_else(|| SyncError::UnknownRecordType(change.record_type.clone()))?;
        if !model.sync_direction().pushes() {
            return Err(SyncError::SecurityViolation {
                record_type: change.record_type.clone(),
                record_id: change.record_id.clone(),
            });
        }
        Ok(model)
    }

    /// Registered record types.
    pub fn record_types(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// Number of registered models.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Returns true if no model is registered.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("record_types", &self.models.keys().collect::<Vec<_>>())
            .finish()
    }
}
