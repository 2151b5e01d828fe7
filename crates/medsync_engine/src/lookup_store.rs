//! The sync lookup table.
//!
//! Rows live in the [`SYNC_LOOKUP`] table of the store, keyed by
//! `record_type:record_id`. The stored row's tick is the lookup row's
//! `updated_at_tick`.

use crate::error::SyncResult;
use medsync_protocol::SyncLookupRow;
use medsync_store::{StoredRecord, Tick, Transaction};

/// Table holding lookup rows.
pub const SYNC_LOOKUP: &str = "sync_lookup";

/// Fact holding the lookup watermark.
pub const LOOKUP_UP_TO_TICK: &str = "syncLookupUpToTick";

/// How a lookup row's tick is chosen when it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStamp {
    /// Keep the tick carried by the row.
    Source,
    /// Stamp with the current tick at commit.
    AtCommit,
}

/// Typed access to the lookup table inside a store transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncLookupStore;

impl SyncLookupStore {
    /// Storage key of a row.
    pub fn key(record_type: &str, record_id: &str) -> String {
        format!("{record_type}:{record_id}")
    }

    /// Reads the lookup watermark.
    pub fn watermark(txn: &Transaction) -> SyncResult<Option<Tick>> {
        Ok(txn.get_fact(LOOKUP_UP_TO_TICK)?)
    }

    /// Writes a row, replacing any row with the same identity.
    pub fn write(txn: &mut Transaction, row: &SyncLookupRow, stamp: LookupStamp) -> SyncResult<()> {
        let key = Self::key(&row.record_type, &row.record_id);
        let data = serde_json::to_value(row)?;
        match stamp {
            LookupStamp::Source => txn.upsert_at(SYNC_LOOKUP, &key, data, false, row.updated_at_tick)?,
            LookupStamp::AtCommit => txn.upsert(SYNC_LOOKUP, &key, data)?,
        }
        Ok(())
    }

    /// Reads one row.
    pub fn get(
        txn: &Transaction,
        record_type: &str,
        record_id: &str,
    ) -> SyncResult<Option<SyncLookupRow>> {
        txn.find_live(SYNC_LOOKUP, &Self::key(record_type, record_id))?
            .map(decode)
            .transpose()
    }

    /// Reads every row, ordered by storage key.
    pub fn scan(txn: &Transaction) -> SyncResult<Vec<SyncLookupRow>> {
        txn.scan(SYNC_LOOKUP)?
            .into_iter()
            .filter(StoredRecord::is_live)
            .map(decode)
            .collect()
    }

    /// Reads the rows with a tick at or below `boundary`.
    pub fn scan_up_to(txn: &Transaction, boundary: Tick) -> SyncResult<Vec<SyncLookupRow>> {
        txn.changed_since(SYNC_LOOKUP, Tick::MIN, Some(boundary))?
            .into_iter()
            .filter(StoredRecord::is_live)
            .map(decode)
            .collect()
    }
}

fn decode(record: StoredRecord) -> SyncResult<SyncLookupRow> {
    let mut row: SyncLookupRow = serde_json::from_value(record.data)?;
    row.updated_at_tick = record.updated_at_tick;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use medsync_protocol::RecordScope;
    use medsync_store::Store;
    use serde_json::json;

    fn row(record_type: &str, record_id: &str, tick: Tick) -> SyncLookupRow {
        SyncLookupRow {
            record_id: record_id.into(),
            record_type: record_type.into(),
            data: json!({ "id": record_id }),
            is_sensitive: false,
            is_deleted: false,
            updated_at_tick: tick,
            scope: RecordScope::Global,
            pushed_by_device_id: None,
        }
    }

    #[test]
    fn same_id_different_type_coexist() {
        let store = Store::new();
        let mut txn = store.begin();
        SyncLookupStore::write(&mut txn, &row("patients", "x1", 3), LookupStamp::Source).unwrap();
        SyncLookupStore::write(&mut txn, &row("encounters", "x1", 4), LookupStamp::Source).unwrap();
        store.commit(&mut txn).unwrap();

        let txn = store.begin();
        let rows = SyncLookupStore::scan(&txn).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            SyncLookupStore::get(&txn, "patients", "x1").unwrap().unwrap().updated_at_tick,
            3
        );
        assert_eq!(
            SyncLookupStore::get(&txn, "encounters", "x1").unwrap().unwrap().updated_at_tick,
            4
        );
    }

    #[test]
    fn commit_stamp_uses_current_tick() {
        let store = Store::new();
        store.set_fact("currentSyncTick", 9).unwrap();
        let mut txn = store.begin();
        SyncLookupStore::write(&mut txn, &row("patients", "p1", 1), LookupStamp::AtCommit).unwrap();
        store.commit(&mut txn).unwrap();

        let txn = store.begin();
        let stored = SyncLookupStore::get(&txn, "patients", "p1").unwrap().unwrap();
        assert_eq!(stored.updated_at_tick, 9);
        assert!(SyncLookupStore::scan_up_to(&txn, 8).unwrap().is_empty());
        assert_eq!(SyncLookupStore::scan_up_to(&txn, 9).unwrap().len(), 1);
    }
}
