//! Transaction state and snapshot reads.

use crate::error::{StoreError, StoreResult};
use crate::record::StoredRecord;
use crate::store::StoreInner;
use crate::types::{SequenceNumber, Tick, TransactionId, FACTS_TABLE};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can perform operations.
    Active,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been aborted.
    Aborted,
}

/// A buffered row mutation.
#[derive(Debug, Clone)]
pub(crate) struct PendingWrite {
    pub data: Value,
    pub is_deleted: bool,
    /// Explicit tick; otherwise stamped at commit.
    pub tick: Option<Tick>,
}

pub(crate) type WriteKey = (String, String);

/// An open transaction.
///
/// Reads see the rows committed when the transaction began plus the
/// transaction's own buffered writes. Writes become visible to others
/// atomically when the transaction is committed through
/// [`Store::commit`](crate::Store::commit). Dropping an active transaction
/// discards its writes.
pub struct Transaction {
    store: Arc<StoreInner>,
    id: TransactionId,
    snapshot_seq: SequenceNumber,
    state: TransactionState,
    writes: BTreeMap<WriteKey, PendingWrite>,
    /// Tick applied to every write that has no explicit tick.
    stamp_tick: Option<Tick>,
}

impl Transaction {
    pub(crate) fn new(
        store: Arc<StoreInner>,
        id: TransactionId,
        snapshot_seq: SequenceNumber,
    ) -> Self {
        Self {
            store,
            id,
            snapshot_seq,
            state: TransactionState::Active,
            writes: BTreeMap::new(),
            stamp_tick: None,
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the snapshot sequence number.
    #[must_use]
    pub fn snapshot_seq(&self) -> SequenceNumber {
        self.snapshot_seq
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Returns the number of buffered writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Returns the tick that will stamp writes without an explicit tick.
    #[must_use]
    pub fn stamp_tick(&self) -> Option<Tick> {
        self.stamp_tick
    }

    /// Stamps every write of this transaction that carries no explicit
    /// tick with `tick` instead of the current tick at commit.
    pub fn stamp_with(&mut self, tick: Tick) {
        self.stamp_tick = Some(tick);
    }

    /// Finds a row by ID, tombstones included.
    pub fn find(&self, table: &str, id: &str) -> StoreResult<Option<StoredRecord>> {
        self.ensure_active()?;
        if let Some(write) = self.writes.get(&(table.to_string(), id.to_string())) {
            return Ok(Some(self.materialize(id, write)?));
        }
        let tables = self.store.tables.read();
        Ok(tables.visible(table, id, self.snapshot_seq).cloned())
    }

    /// Finds a row by ID, ignoring tombstones.
    pub fn find_live(&self, table: &str, id: &str) -> StoreResult<Option<StoredRecord>> {
        Ok(self.find(table, id)?.filter(StoredRecord::is_live))
    }

    /// Returns every row of `table`, tombstones included, ordered by ID.
    pub fn scan(&self, table: &str) -> StoreResult<Vec<StoredRecord>> {
        self.ensure_active()?;
        let mut merged: BTreeMap<String, StoredRecord> = {
            let tables = self.store.tables.read();
            tables
                .visible_rows(table, self.snapshot_seq)
                .map(|r| (r.id.clone(), r.clone()))
                .collect()
        };
        let range_start = (table.to_string(), String::new());
        for ((write_table, id), write) in self.writes.range(range_start..) {
            if write_table != table {
                break;
            }
            merged.insert(id.clone(), self.materialize(id, write)?);
        }
        Ok(merged.into_values().collect())
    }

    /// Returns the rows of `table` whose tick lies in `(since, up_to]`.
    ///
    /// `up_to` of `None` leaves the range open above.
    pub fn changed_since(
        &self,
        table: &str,
        since: Tick,
        up_to: Option<Tick>,
    ) -> StoreResult<Vec<StoredRecord>> {
        self.ensure_active()?;
        let in_range = |tick: Tick| tick > since && up_to.map_or(true, |u| tick <= u);
        let mut changed: BTreeMap<String, StoredRecord> = {
            let tables = self.store.tables.read();
            tables
                .changed_rows(table, since, up_to, self.snapshot_seq)
                .into_iter()
                .map(|(id, record)| (id.to_string(), record.clone()))
                .collect()
        };
        let range_start = (table.to_string(), String::new());
        for ((write_table, id), write) in self.writes.range(range_start..) {
            if write_table != table {
                break;
            }
            let record = self.materialize(id, write)?;
            if in_range(record.updated_at_tick) {
                changed.insert(id.clone(), record);
            } else {
                changed.remove(id);
            }
        }
        Ok(changed.into_values().collect())
    }

    /// Inserts a new row. Fails if a live row with the ID exists.
    pub fn create(&mut self, table: &str, id: &str, data: Value) -> StoreResult<()> {
        if self.find_live(table, id)?.is_some() {
            return Err(StoreError::AlreadyExists {
                table: table.to_string(),
                id: id.to_string(),
            });
        }
        self.put(table, id, data, false, None)
    }

    /// Replaces the data of a live row.
    pub fn update(&mut self, table: &str, id: &str, data: Value) -> StoreResult<()> {
        if self.find_live(table, id)?.is_none() {
            return Err(StoreError::RecordNotFound {
                table: table.to_string(),
                id: id.to_string(),
            });
        }
        self.put(table, id, data, false, None)
    }

    /// Inserts or replaces a row, reviving it if it was deleted.
    pub fn upsert(&mut self, table: &str, id: &str, data: Value) -> StoreResult<()> {
        self.put(table, id, data, false, None)
    }

    /// Writes a row carrying an explicit tick rather than a commit-time one.
    pub fn upsert_at(
        &mut self,
        table: &str,
        id: &str,
        data: Value,
        is_deleted: bool,
        tick: Tick,
    ) -> StoreResult<()> {
        self.put(table, id, data, is_deleted, Some(tick))
    }

    /// Logically deletes a live row. The row's data is kept.
    pub fn destroy(&mut self, table: &str, id: &str) -> StoreResult<()> {
        let existing = self
            .find_live(table, id)?
            .ok_or_else(|| StoreError::RecordNotFound {
                table: table.to_string(),
                id: id.to_string(),
            })?;
        self.put(table, id, existing.data, true, None)
    }

    /// Writes a tombstone whether or not the row exists.
    pub fn tombstone(&mut self, table: &str, id: &str, data: Value) -> StoreResult<()> {
        self.put(table, id, data, true, None)
    }

    /// Reads an integer fact.
    pub fn get_fact(&self, key: &str) -> StoreResult<Option<i64>> {
        match self.find(FACTS_TABLE, key)? {
            Some(record) if record.is_live() => fact_value(key, &record.data).map(Some),
            _ => Ok(None),
        }
    }

    /// Writes an integer fact.
    pub fn set_fact(&mut self, key: &str, value: i64) -> StoreResult<()> {
        self.put(FACTS_TABLE, key, Value::from(value), false, None)
    }

    fn put(
        &mut self,
        table: &str,
        id: &str,
        data: Value,
        is_deleted: bool,
        tick: Option<Tick>,
    ) -> StoreResult<()> {
        self.ensure_active()?;
        self.writes.insert(
            (table.to_string(), id.to_string()),
            PendingWrite {
                data,
                is_deleted,
                tick,
            },
        );
        Ok(())
    }

    /// Builds the reader's view of a buffered write. Its tick is provisional
    /// until commit unless it was given explicitly.
    fn materialize(&self, id: &str, write: &PendingWrite) -> StoreResult<StoredRecord> {
        let tick = match write.tick.or(self.stamp_tick) {
            Some(tick) => tick,
            None => self.snapshot_tick()?,
        };
        Ok(StoredRecord {
            id: id.to_string(),
            data: write.data.clone(),
            updated_at_tick: tick,
            is_deleted: write.is_deleted,
        })
    }

    fn snapshot_tick(&self) -> StoreResult<Tick> {
        let key = self.store.config.tick_fact_key.as_str();
        if let Some(write) = self.writes.get(&(FACTS_TABLE.to_string(), key.to_string())) {
            return fact_value(key, &write.data);
        }
        let tables = self.store.tables.read();
        Ok(tables.fact_at(key, self.snapshot_seq)?.unwrap_or(0))
    }

    /// Tick to stamp the writes that carry none, given the committed value
    /// of the current-tick fact.
    pub(crate) fn commit_tick(&self, committed_tick: Tick) -> StoreResult<Tick> {
        if let Some(tick) = self.stamp_tick {
            return Ok(tick);
        }
        let key = self.store.config.tick_fact_key.as_str();
        match self.writes.get(&(FACTS_TABLE.to_string(), key.to_string())) {
            Some(write) => fact_value(key, &write.data),
            None => Ok(committed_tick),
        }
    }

    pub(crate) fn belongs_to(&self, store: &Arc<StoreInner>) -> bool {
        Arc::ptr_eq(&self.store, store)
    }

    pub(crate) fn take_writes(&mut self) -> BTreeMap<WriteKey, PendingWrite> {
        std::mem::take(&mut self.writes)
    }

    pub(crate) fn mark_committed(&mut self) {
        self.state = TransactionState::Committed;
    }

    pub(crate) fn mark_aborted(&mut self) {
        self.writes.clear();
        self.state = TransactionState::Aborted;
    }

    pub(crate) fn ensure_active(&self) -> StoreResult<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Committed => Err(StoreError::invalid_operation(
                "transaction already committed",
            )),
            TransactionState::Aborted => {
                Err(StoreError::invalid_operation("transaction already aborted"))
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_active() {
            self.store.forget(self.id);
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("snapshot_seq", &self.snapshot_seq)
            .field("state", &self.state)
            .field("write_count", &self.writes.len())
            .field("stamp_tick", &self.stamp_tick)
            .finish_non_exhaustive()
    }
}

pub(crate) fn fact_value(key: &str, data: &Value) -> StoreResult<i64> {
    data.as_i64().ok_or_else(|| StoreError::InvalidFact {
        key: key.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use crate::{Store, StoreError, TransactionState};
    use serde_json::json;

    #[test]
    fn new_transaction_is_active() {
        let store = Store::new();
        let txn = store.begin();
        assert!(txn.is_active());
        assert_eq!(txn.state(), TransactionState::Active);
        assert_eq!(txn.write_count(), 0);
    }

    #[test]
    fn reads_own_writes() {
        let store = Store::new();
        let mut txn = store.begin();
        txn.create("patients", "p1", json!({ "firstName": "Ana" }))
            .unwrap();
        let found = txn.find_live("patients", "p1").unwrap().unwrap();
        assert_eq!(found.field_str("firstName"), Some("Ana"));
        assert_eq!(txn.scan("patients").unwrap().len(), 1);
        assert!(txn.scan("encounters").unwrap().is_empty());
    }

    #[test]
    fn create_rejects_existing_live_row() {
        let store = Store::new();
        let mut txn = store.begin();
        txn.create("patients", "p1", json!({})).unwrap();
        let err = txn.create("patients", "p1", json!({})).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[test]
    fn update_requires_live_row() {
        let store = Store::new();
        let mut txn = store.begin();
        let err = txn.update("patients", "ghost", json!({})).unwrap_err();
        assert!(matches!(err, StoreError::RecordNotFound { .. }));

        txn.create("patients", "p1", json!({ "v": 1 })).unwrap();
        txn.destroy("patients", "p1").unwrap();
        assert!(txn.update("patients", "p1", json!({ "v": 2 })).is_err());
        // A tombstoned row can be created again
        txn.create("patients", "p1", json!({ "v": 3 })).unwrap();
    }

    #[test]
    fn destroy_keeps_data_as_tombstone() {
        let store = Store::new();
        let mut txn = store.begin();
        txn.create("patients", "p1", json!({ "v": 1 })).unwrap();
        txn.destroy("patients", "p1").unwrap();
        let row = txn.find("patients", "p1").unwrap().unwrap();
        assert!(row.is_deleted);
        assert_eq!(row.data, json!({ "v": 1 }));
        assert!(txn.find_live("patients", "p1").unwrap().is_none());
    }

    #[test]
    fn pending_ticks_are_provisional() {
        let store = Store::new();
        store.set_fact("currentSyncTick", 4).unwrap();
        let mut txn = store.begin();
        txn.upsert("patients", "p1", json!({})).unwrap();
        txn.upsert_at("patients", "p2", json!({}), false, 2).unwrap();
        assert_eq!(txn.find("patients", "p1").unwrap().unwrap().updated_at_tick, 4);
        assert_eq!(txn.find("patients", "p2").unwrap().unwrap().updated_at_tick, 2);

        txn.stamp_with(9);
        assert_eq!(txn.find("patients", "p1").unwrap().unwrap().updated_at_tick, 9);
        assert_eq!(txn.stamp_tick(), Some(9));
    }

    #[test]
    fn changed_since_range_is_half_open() {
        let store = Store::new();
        let mut txn = store.begin();
        for tick in 1..=5 {
            txn.upsert_at("t", &format!("r{tick}"), json!({}), false, tick)
                .unwrap();
        }
        let ids: Vec<_> = txn
            .changed_since("t", 2, Some(4))
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["r3", "r4"]);
        assert_eq!(txn.changed_since("t", -1, None).unwrap().len(), 5);
    }

    #[test]
    fn facts_in_transaction() {
        let store = Store::new();
        let mut txn = store.begin();
        assert_eq!(txn.get_fact("syncLookupUpToTick").unwrap(), None);
        txn.set_fact("syncLookupUpToTick", 12).unwrap();
        assert_eq!(txn.get_fact("syncLookupUpToTick").unwrap(), Some(12));
    }

    #[test]
    fn non_integer_fact_is_rejected() {
        let store = Store::new();
        let mut txn = store.begin();
        txn.upsert(crate::FACTS_TABLE, "weird", json!("text")).unwrap();
        assert!(matches!(
            txn.get_fact("weird"),
            Err(StoreError::InvalidFact { .. })
        ));
    }

    #[test]
    fn dropping_active_transaction_releases_it() {
        let store = Store::new();
        {
            let mut txn = store.begin();
            txn.upsert("patients", "p1", json!({})).unwrap();
            assert_eq!(store.active_count(), 1);
        }
        assert_eq!(store.active_count(), 0);
        assert!(store.find("patients", "p1").unwrap().is_none());
    }
}
