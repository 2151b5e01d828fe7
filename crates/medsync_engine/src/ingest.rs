//! Persisting pushed changes.

use crate::clock::SyncClock;
use crate::error::{SyncError, SyncResult};
use crate::models::ModelRegistry;
use medsync_protocol::IncomingChange;
use medsync_store::{Store, Tick, Transaction};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Table recording which device's push produced each reserved tick.
pub const SYNC_DEVICE_TICKS: &str = "sync_device_ticks";

/// Returns the device whose push was persisted at `tick`, if any.
pub fn device_for_tick(txn: &Transaction, tick: Tick) -> SyncResult<Option<String>> {
    Ok(txn
        .find_live(SYNC_DEVICE_TICKS, &tick.to_string())?
        .and_then(|row| row.field_str("deviceId").map(str::to_string)))
}

/// Validates and applies pushed changes to the live tables.
#[derive(Debug, Clone)]
pub struct ChangeIngester {
    store: Store,
    clock: SyncClock,
    models: Arc<ModelRegistry>,
}

impl ChangeIngester {
    /// Creates an ingester.
    pub fn new(store: Store, clock: SyncClock, models: Arc<ModelRegistry>) -> Self {
        Self {
            store,
            clock,
            models,
        }
    }

    /// Checks that every change targets a registered, push-capable model.
    pub fn validate(&self, changes: &[IncomingChange]) -> SyncResult<()> {
        for change in changes {
            self.models.push_model(change)?;
        }
        Ok(())
    }

    /// Applies `changes` in a single transaction stamped with a freshly
    /// reserved tick, and returns that tick.
    ///
    /// Either every change is applied or none is. Changes to the same record
    /// are applied in order, so the last one wins.
    pub fn persist(&self, changes: &[IncomingChange], device_id: Option<&str>) -> SyncResult<Tick> {
        let reservation = self.clock.reserve_and_advance()?;
        let tick = reservation.tick();

        self.store.transaction(|txn| {
            txn.stamp_with(tick);
            for change in changes {
                let model = self.models.push_model(change)?;
                model.apply_change(txn, change)?;
            }
            if let Some(device_id) = device_id {
                txn.upsert(
                    SYNC_DEVICE_TICKS,
                    &tick.to_string(),
                    json!({ "deviceId": device_id, "persistedAtSyncTick": tick }),
                )?;
            }
            Ok::<_, SyncError>(())
        })?;
        drop(reservation);

        info!(tick, count = changes.len(), device_id, "persisted pushed changes");
        Ok(tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::models::{ModelSpec, SyncDirection};

    fn ingester() -> (Store, SyncClock, ChangeIngester) {
        let store = Store::new();
        let clock = SyncClock::new(store.clone(), RetryConfig::no_retry());
        let models = ModelRegistry::new()
            .with(ModelSpec::new("patients", SyncDirection::Bidirectional))
            .with(ModelSpec::new("reference_data", SyncDirection::PullFromCentral));
        let ingester = ChangeIngester::new(store.clone(), clock.clone(), Arc::new(models));
        (store, clock, ingester)
    }

    #[test]
    fn validate_rejects_pull_only_and_unknown_types() {
        let (_store, _clock, ingester) = ingester();
        assert!(ingester
            .validate(&[IncomingChange::upsert("patients", "p1", json!({}))])
            .is_ok());
        assert!(matches!(
            ingester.validate(&[IncomingChange::upsert("reference_data", "r1", json!({}))]),
            Err(SyncError::SecurityViolation { .. })
        ));
        assert!(matches!(
            ingester.validate(&[IncomingChange::upsert("nope", "x", json!({}))]),
            Err(SyncError::UnknownRecordType(_))
        ));
    }

    #[test]
    fn persist_stamps_reserved_tick() {
        let (store, clock, ingester) = ingester();
        clock.fast_forward_to(10).unwrap();
        let tick = ingester
            .persist(
                &[
                    IncomingChange::upsert("patients", "p1", json!({ "v": 1 })),
                    IncomingChange::upsert("patients", "p2", json!({ "v": 1 })),
                ],
                Some("tablet-1"),
            )
            .unwrap();

        assert_eq!(tick, 11);
        assert_eq!(clock.current_tick().unwrap(), 12);
        assert_eq!(clock.pending_reservations(), 0);
        assert_eq!(store.find("patients", "p1").unwrap().unwrap().updated_at_tick, 11);

        let txn = store.begin();
        assert_eq!(
            device_for_tick(&txn, 11).unwrap().as_deref(),
            Some("tablet-1")
        );
        assert_eq!(device_for_tick(&txn, 12).unwrap(), None);
    }

    #[test]
    fn last_change_to_a_record_wins() {
        let (store, _clock, ingester) = ingester();
        ingester
            .persist(
                &[
                    IncomingChange::upsert("patients", "p1", json!({ "v": 1 })),
                    IncomingChange::upsert("patients", "p1", json!({ "v": 2 })),
                ],
                None,
            )
            .unwrap();
        assert_eq!(
            store.find("patients", "p1").unwrap().unwrap().data,
            json!({ "v": 2 })
        );
    }

    #[test]
    fn failed_batch_is_rolled_back() {
        let (store, clock, ingester) = ingester();
        let err = ingester
            .persist(
                &[
                    IncomingChange::upsert("patients", "p1", json!({ "v": 1 })),
                    IncomingChange::upsert("patients", "p2", json!("not an object")),
                ],
                Some("tablet-1"),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidChange { .. }));
        assert!(store.find("patients", "p1").unwrap().is_none());
        assert!(store.scan(SYNC_DEVICE_TICKS).unwrap().is_empty());
        // The reserved tick is skipped, not reused
        assert_eq!(clock.pending_reservations(), 0);
        assert_eq!(clock.reserve_and_advance().unwrap().tick(), 3);
    }
}
