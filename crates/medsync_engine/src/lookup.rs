//! Incremental lookup-table builder.

use crate::clock::SyncClock;
use crate::debug_log::{DebugLog, LookupRunRecord};
use crate::error::{SyncError, SyncResult};
use crate::ingest::device_for_tick;
use crate::lookup_store::{LookupStamp, SyncLookupStore, LOOKUP_UP_TO_TICK};
use crate::models::ModelRegistry;
use medsync_protocol::{LookupRunReport, SyncLookupRow, NEVER_SYNCED};
use medsync_store::{Store, Tick};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Keeps the lookup table current with the syncable models.
///
/// Each run materializes the rows changed in `(watermark, boundary]` and
/// advances the watermark to `boundary`, all in one transaction. The
/// transaction reads a snapshot taken after the boundary was published, so
/// a write that commits while a run is in flight is never half-seen: it is
/// either below the boundary and visible, or above it and left for the next
/// run.
pub struct LookupTableBuilder {
    store: Store,
    clock: SyncClock,
    models: Arc<ModelRegistry>,
    debug_log: DebugLog,
    running: Mutex<()>,
}

impl LookupTableBuilder {
    /// Creates a builder.
    pub fn new(store: Store, clock: SyncClock, models: Arc<ModelRegistry>) -> Self {
        let debug_log = DebugLog::new(store.clone());
        Self {
            store,
            clock,
            models,
            debug_log,
            running: Mutex::new(()),
        }
    }

    /// Returns the lookup watermark, or `None` before the first build.
    pub fn watermark(&self) -> SyncResult<Option<Tick>> {
        Ok(self.store.get_fact(LOOKUP_UP_TO_TICK)?)
    }

    /// Returns true once a run has committed.
    pub fn is_built(&self) -> SyncResult<bool> {
        Ok(self.watermark()?.is_some())
    }

    /// Returns the run records written so far.
    pub fn debug_log(&self) -> &DebugLog {
        &self.debug_log
    }

    /// Runs one pass.
    ///
    /// With `force_full_rebuild` every row of every model is materialized
    /// again. Rows whose projection is unchanged keep their tick, so a
    /// forced rebuild only re-sends rows that actually differ. A run that
    /// fails is rolled back entirely, recorded, and
    /// returned as [`SyncError::LookupRebuild`]. A run attempted while
    /// another is in flight fails with [`SyncError::LookupInProgress`].
    pub fn run(&self, force_full_rebuild: bool) -> SyncResult<LookupRunReport> {
        let _running = self.running.try_lock().ok_or(SyncError::LookupInProgress)?;
        let started_at = SystemTime::now();

        let watermark = self.watermark()?;
        let since = match watermark {
            Some(tick) if !force_full_rebuild => tick,
            _ => NEVER_SYNCED,
        };
        // The first build keeps the source ticks; later passes stamp at commit
        let stamp = if watermark.is_none() {
            LookupStamp::Source
        } else {
            LookupStamp::AtCommit
        };
        let keep_unchanged = force_full_rebuild && watermark.is_some();
        info!(since, force_full_rebuild, "sync lookup table update starting");

        match self.materialize(since, stamp, keep_unchanged) {
            Ok((up_to, changes_count)) => {
                let completed_at = SystemTime::now();
                self.debug_log.record_lookup_run(&LookupRunRecord {
                    since,
                    up_to: Some(up_to),
                    changes_count: Some(changes_count),
                    started_at,
                    completed_at,
                    error: None,
                })?;
                Ok(LookupRunReport {
                    since,
                    up_to,
                    changes_count,
                    started_at,
                    completed_at,
                })
            }
            Err(err) => {
                let completed_at = SystemTime::now();
                let message = err.to_string();
                let recorded = self.debug_log.record_lookup_run(&LookupRunRecord {
                    since,
                    up_to: None,
                    changes_count: None,
                    started_at,
                    completed_at,
                    error: Some(message.clone()),
                });
                if let Err(log_err) = recorded {
                    warn!(error = %log_err, "could not record failed sync lookup run");
                }
                Err(SyncError::LookupRebuild {
                    error: message,
                    started_at,
                    completed_at,
                })
            }
        }
    }

    fn materialize(
        &self,
        since: Tick,
        stamp: LookupStamp,
        keep_unchanged: bool,
    ) -> SyncResult<(Tick, usize)> {
        let up_to = self.clock.publish_boundary()?;
        debug!(since, up_to, "sync lookup boundary published");

        self.store.transaction(|txn| {
            let mut changes_count = 0;
            for model in self.models.pull_models() {
                let changed = model.find_changed_since(txn, since, up_to)?;
                debug!(
                    record_type = model.record_type(),
                    count = changed.len(),
                    "materializing changed records"
                );
                for record in changed {
                    let projection = model.project(txn, &record)?;
                    let pushed_by_device_id = device_for_tick(txn, record.updated_at_tick)?;
                    let mut row = SyncLookupRow {
                        record_id: record.id,
                        record_type: model.record_type().to_string(),
                        data: projection.data,
                        is_sensitive: projection.is_sensitive,
                        is_deleted: record.is_deleted,
                        updated_at_tick: record.updated_at_tick,
                        scope: projection.scope,
                        pushed_by_device_id,
                    };
                    let previous = if keep_unchanged {
                        SyncLookupStore::get(txn, &row.record_type, &row.record_id)?
                    } else {
                        None
                    };
                    match previous {
                        Some(previous) if same_projection(&previous, &row) => {
                            row.updated_at_tick = previous.updated_at_tick;
                            SyncLookupStore::write(txn, &row, LookupStamp::Source)?;
                        }
                        _ => SyncLookupStore::write(txn, &row, stamp)?,
                    }
                    changes_count += 1;
                }
            }
            txn.set_fact(LOOKUP_UP_TO_TICK, up_to)?;
            Ok((up_to, changes_count))
        })
    }
}

/// Compares everything a facility receives, ignoring the tick.
fn same_projection(a: &SyncLookupRow, b: &SyncLookupRow) -> bool {
    a.data == b.data
        && a.is_sensitive == b.is_sensitive
        && a.is_deleted == b.is_deleted
        && a.scope == b.scope
        && a.pushed_by_device_id == b.pushed_by_device_id
}

impl std::fmt::Debug for LookupTableBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupTableBuilder")
            .field("models", &self.models)
            .field("running", &self.running.is_locked())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::models::{LookupProjection, ModelSpec, SyncDirection, SyncableModel};
    use medsync_store::{StoredRecord, Transaction};
    use serde_json::json;

    fn builder_with(models: ModelRegistry) -> (Store, SyncClock, LookupTableBuilder) {
        let store = Store::new();
        let clock = SyncClock::new(store.clone(), RetryConfig::no_retry());
        let builder = LookupTableBuilder::new(store.clone(), clock.clone(), Arc::new(models));
        (store, clock, builder)
    }

    fn registry() -> ModelRegistry {
        ModelRegistry::new()
            .with(ModelSpec::new("patients", SyncDirection::Bidirectional).patient_field("id"))
            .with(
                ModelSpec::new("encounters", SyncDirection::Bidirectional)
                    .patient_field("patientId"),
            )
            .with(ModelSpec::new("audit", SyncDirection::DoNotSync))
    }

    fn lookup_rows(store: &Store) -> Vec<SyncLookupRow> {
        SyncLookupStore::scan(&store.begin()).unwrap()
    }

    #[test]
    fn initial_build_keeps_source_ticks() {
        let (store, clock, builder) = builder_with(registry());
        clock.fast_forward_to(10).unwrap();
        store.create("patients", "p1", json!({ "id": "p1" })).unwrap();
        store.create("audit", "a1", json!({})).unwrap();
        assert!(!builder.is_built().unwrap());

        let report = builder.run(false).unwrap();
        assert_eq!(report.since, NEVER_SYNCED);
        assert_eq!(report.changes_count, 1);
        assert_eq!(report.up_to, 11);
        assert_eq!(builder.watermark().unwrap(), Some(11));

        let rows = lookup_rows(&store);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].updated_at_tick, 10);
        assert_eq!(rows[0].scope.patient_id(), Some("p1"));
    }

    #[test]
    fn incremental_build_stamps_after_boundary() {
        let (store, _clock, builder) = builder_with(registry());
        builder.run(false).unwrap();
        store.create("patients", "p1", json!({ "id": "p1" })).unwrap();

        let report = builder.run(false).unwrap();
        assert_eq!(report.changes_count, 1);
        let rows = lookup_rows(&store);
        assert!(rows[0].updated_at_tick > report.up_to);

        // Nothing changed since
        assert_eq!(builder.run(false).unwrap().changes_count, 0);
    }

    #[test]
    fn deletion_keeps_row_as_tombstone() {
        let (store, _clock, builder) = builder_with(registry());
        store.create("patients", "p1", json!({ "id": "p1" })).unwrap();
        builder.run(false).unwrap();
        store.destroy("patients", "p1").unwrap();
        builder.run(false).unwrap();

        let rows = lookup_rows(&store);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_deleted);
    }

    #[test]
    fn force_full_rebuild_rescans_everything() {
        let (store, _clock, builder) = builder_with(registry());
        store.create("patients", "p1", json!({ "id": "p1" })).unwrap();
        store
            .create("encounters", "e1", json!({ "patientId": "p1" }))
            .unwrap();
        builder.run(false).unwrap();
        assert_eq!(builder.run(false).unwrap().changes_count, 0);

        let report = builder.run(true).unwrap();
        assert_eq!(report.since, NEVER_SYNCED);
        assert_eq!(report.changes_count, 2);
    }

    #[test]
    fn forced_rebuild_only_restamps_changed_rows() {
        let (store, _clock, builder) = builder_with(registry());
        store.create("patients", "p1", json!({ "id": "p1" })).unwrap();
        store.create("patients", "p2", json!({ "id": "p2" })).unwrap();
        builder.run(false).unwrap();
        let before: Vec<Tick> = lookup_rows(&store).iter().map(|r| r.updated_at_tick).collect();

        // Changed behind the watermark, e.g. by a direct import
        let mut txn = store.begin();
        txn.upsert_at("patients", "p2", json!({ "id": "p2", "name": "Ana" }), false, 1)
            .unwrap();
        store.commit(&mut txn).unwrap();

        let report = builder.run(true).unwrap();
        assert_eq!(report.changes_count, 2);

        let rows = lookup_rows(&store);
        assert_eq!(rows[0].record_id, "p1");
        assert_eq!(rows[0].updated_at_tick, before[0]);
        assert_eq!(rows[1].record_id, "p2");
        assert!(rows[1].updated_at_tick > report.up_to);
        assert_eq!(rows[1].data["name"], json!("Ana"));
    }

    struct FailingModel;

    impl SyncableModel for FailingModel {
        fn record_type(&self) -> &str {
            "broken"
        }

        fn sync_direction(&self) -> SyncDirection {
            SyncDirection::PullFromCentral
        }

        fn project(&self, _txn: &Transaction, record: &StoredRecord) -> SyncResult<LookupProjection> {
            Err(SyncError::InvalidChange {
                record_type: "broken".into(),
                record_id: record.id.clone(),
                reason: "cannot project".into(),
            })
        }
    }

    #[test]
    fn failed_run_rolls_back_and_is_recorded() {
        let (store, _clock, builder) = builder_with(registry().with(FailingModel));
        store.create("patients", "p1", json!({ "id": "p1" })).unwrap();
        store.create("broken", "b1", json!({})).unwrap();

        let err = builder.run(false).unwrap_err();
        assert!(matches!(err, SyncError::LookupRebuild { .. }));
        assert_eq!(builder.watermark().unwrap(), None);
        assert!(lookup_rows(&store).is_empty());

        let runs = builder.debug_log().lookup_runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].error.as_deref().unwrap().contains("cannot project"));
    }

    #[test]
    fn successful_run_is_recorded() {
        let (store, _clock, builder) = builder_with(registry());
        store.create("patients", "p1", json!({ "id": "p1" })).unwrap();
        builder.run(false).unwrap();

        let runs = builder.debug_log().lookup_runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].since, NEVER_SYNCED);
        assert_eq!(runs[0].changes_count, Some(1));
        assert!(runs[0].error.is_none());
    }
}
