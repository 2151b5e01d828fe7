//! The record store.

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::record::{visible_at, StoredRecord, Version};
use crate::transaction::{fact_value, Transaction};
use crate::types::{SequenceNumber, Tick, TransactionId, FACTS_TABLE};
use parking_lot::{RwLock, RwLockWriteGuard};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// All committed row versions.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    rows: HashMap<String, BTreeMap<String, Vec<Version>>>,
    /// `(tick, id)` of every stored version, per table.
    by_tick: HashMap<String, BTreeSet<(Tick, String)>>,
    committed_seq: SequenceNumber,
}

impl Tables {
    pub(crate) fn visible(
        &self,
        table: &str,
        id: &str,
        snapshot: SequenceNumber,
    ) -> Option<&StoredRecord> {
        self.rows
            .get(table)
            .and_then(|rows| rows.get(id))
            .and_then(|versions| visible_at(versions, snapshot))
    }

    pub(crate) fn visible_rows<'a>(
        &'a self,
        table: &str,
        snapshot: SequenceNumber,
    ) -> impl Iterator<Item = &'a StoredRecord> + 'a {
        self.rows
            .get(table)
            .into_iter()
            .flat_map(|rows| rows.values())
            .filter_map(move |versions| visible_at(versions, snapshot))
    }

    /// Rows visible at `snapshot` whose tick lies in `(since, up_to]`,
    /// keyed by ID.
    pub(crate) fn changed_rows<'a>(
        &'a self,
        table: &str,
        since: Tick,
        up_to: Option<Tick>,
        snapshot: SequenceNumber,
    ) -> BTreeMap<&'a str, &'a StoredRecord> {
        let mut changed = BTreeMap::new();
        let (Some(index), Some(rows)) = (self.by_tick.get(table), self.rows.get(table)) else {
            return changed;
        };
        let Some(from) = since.checked_add(1) else {
            return changed;
        };
        let in_range = |tick: Tick| tick > since && up_to.map_or(true, |u| tick <= u);
        for (tick, id) in index.range((from, String::new())..) {
            if !in_range(*tick) {
                break;
            }
            if changed.contains_key(id.as_str()) {
                continue;
            }
            // The index holds every version; only the visible one counts
            if let Some(record) = rows.get(id).and_then(|v| visible_at(v, snapshot)) {
                if in_range(record.updated_at_tick) {
                    changed.insert(id.as_str(), record);
                }
            }
        }
        changed
    }

    pub(crate) fn fact_at(&self, key: &str, snapshot: SequenceNumber) -> StoreResult<Option<i64>> {
        match self.visible(FACTS_TABLE, key, snapshot) {
            Some(record) if record.is_live() => fact_value(key, &record.data).map(Some),
            _ => Ok(None),
        }
    }

    fn latest_fact(&self, key: &str) -> StoreResult<Option<i64>> {
        self.fact_at(key, self.committed_seq)
    }

    fn push(&mut self, table: String, seq: SequenceNumber, record: StoredRecord) {
        self.by_tick
            .entry(table.clone())
            .or_default()
            .insert((record.updated_at_tick, record.id.clone()));
        self.rows
            .entry(table)
            .or_default()
            .entry(record.id.clone())
            .or_default()
            .push(Version { seq, record });
    }
}

/// Shared state behind every [`Store`] handle and [`Transaction`].
#[derive(Debug)]
pub(crate) struct StoreInner {
    pub(crate) config: StoreConfig,
    pub(crate) tables: RwLock<Tables>,
    next_txid: AtomicU64,
    /// Active transactions and their snapshot sequences.
    active_txns: RwLock<Vec<(TransactionId, SequenceNumber)>>,
    commits_since_vacuum: AtomicU64,
}

impl StoreInner {
    pub(crate) fn forget(&self, txid: TransactionId) {
        self.active_txns.write().retain(|(id, _)| *id != txid);
    }

    /// Takes the commit lock, giving up after the configured timeout.
    fn lock_for_commit(&self) -> StoreResult<RwLockWriteGuard<'_, Tables>> {
        let timeout = self.config.lock_timeout;
        self.tables
            .try_write_for(timeout)
            .ok_or(StoreError::LockTimeout {
                waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
    }
}

/// A transactional record store.
///
/// The store is cheap to clone; clones share the same data.
///
/// Concurrency model:
/// - Readers never block writers for longer than a single commit
/// - Every transaction reads from the snapshot taken when it began
/// - Commits are serialized and applied atomically
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Creates an empty store with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Creates an empty store with the given configuration.
    #[must_use]
    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config,
                tables: RwLock::new(Tables::default()),
                next_txid: AtomicU64::new(1),
                active_txns: RwLock::new(Vec::new()),
                commits_since_vacuum: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the store configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Begins a transaction on a snapshot of the committed state.
    pub fn begin(&self) -> Transaction {
        let txid = TransactionId::new(self.inner.next_txid.fetch_add(1, Ordering::SeqCst));
        // The snapshot and the registration happen under the read lock so
        // that vacuum never drops a version this transaction can see.
        let tables = self.inner.tables.read();
        let snapshot_seq = tables.committed_seq;
        self.inner.active_txns.write().push((txid, snapshot_seq));
        drop(tables);
        Transaction::new(Arc::clone(&self.inner), txid, snapshot_seq)
    }

    /// Commits a transaction.
    ///
    /// All buffered writes become visible atomically. A transaction without
    /// writes does not consume a sequence number.
    pub fn commit(&self, txn: &mut Transaction) -> StoreResult<SequenceNumber> {
        txn.ensure_active()?;
        if !txn.belongs_to(&self.inner) {
            return Err(StoreError::invalid_operation(
                "transaction belongs to another store",
            ));
        }

        let mut tables = self.inner.lock_for_commit()?;
        if txn.write_count() == 0 {
            let seq = tables.committed_seq;
            drop(tables);
            self.finish(txn);
            return Ok(seq);
        }

        let committed_tick = tables
            .latest_fact(&self.inner.config.tick_fact_key)?
            .unwrap_or(0);
        let stamp = txn.commit_tick(committed_tick)?;
        let seq = tables.committed_seq.next();
        for ((table, id), write) in txn.take_writes() {
            let record = StoredRecord {
                id,
                data: write.data,
                updated_at_tick: write.tick.unwrap_or(stamp),
                is_deleted: write.is_deleted,
            };
            tables.push(table, seq, record);
        }
        tables.committed_seq = seq;
        drop(tables);

        self.finish(txn);
        self.after_commit();
        Ok(seq)
    }

    /// Vacuums once enough commits have piled up. Skipped, and tried again
    /// on a later commit, while the tables are busy.
    fn after_commit(&self) {
        let Some(every) = self.inner.config.auto_vacuum_every else {
            return;
        };
        let commits = self.inner.commits_since_vacuum.fetch_add(1, Ordering::SeqCst) + 1;
        if commits < every {
            return;
        }
        if let Some(mut tables) = self.inner.tables.try_write() {
            let removed = self.vacuum_locked(&mut tables);
            drop(tables);
            self.inner.commits_since_vacuum.store(0, Ordering::SeqCst);
            debug!(removed, commits, "store vacuumed");
        }
    }

    fn finish(&self, txn: &mut Transaction) {
        self.inner.forget(txn.id());
        txn.mark_committed();
    }

    /// Aborts a transaction, discarding its writes.
    pub fn abort(&self, txn: &mut Transaction) -> StoreResult<()> {
        txn.ensure_active()?;
        self.inner.forget(txn.id());
        txn.mark_aborted();
        Ok(())
    }

    /// Runs `f` in a transaction that commits if `f` succeeds and aborts
    /// otherwise.
    pub fn transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut txn = self.begin();
        match f(&mut txn) {
            Ok(value) => {
                self.commit(&mut txn)?;
                Ok(value)
            }
            Err(err) => {
                if txn.is_active() {
                    self.abort(&mut txn)?;
                }
                Err(err)
            }
        }
    }

    /// Reads the committed value of a fact.
    pub fn get_fact(&self, key: &str) -> StoreResult<Option<i64>> {
        self.inner.tables.read().latest_fact(key)
    }

    /// Writes a fact in its own transaction.
    pub fn set_fact(&self, key: &str, value: i64) -> StoreResult<()> {
        self.transaction(|txn| txn.set_fact(key, value))
    }

    /// Atomically adds `by` to a fact (missing facts count as zero) and
    /// returns the new value.
    ///
    /// The increment is serialized with commits, so a commit either sees
    /// the old value for its tick stamp or the new one, never a mix.
    pub fn increment_fact(&self, key: &str, by: i64) -> StoreResult<i64> {
        let mut tables = self.inner.lock_for_commit()?;
        let value = tables.latest_fact(key)?.unwrap_or(0) + by;
        let tick_key = self.inner.config.tick_fact_key.as_str();
        let stamp: Tick = if key == tick_key {
            value
        } else {
            tables.latest_fact(tick_key)?.unwrap_or(0)
        };
        let seq = tables.committed_seq.next();
        tables.push(
            FACTS_TABLE.to_string(),
            seq,
            StoredRecord {
                id: key.to_string(),
                data: Value::from(value),
                updated_at_tick: stamp,
                is_deleted: false,
            },
        );
        tables.committed_seq = seq;
        drop(tables);
        self.after_commit();
        Ok(value)
    }

    /// Finds a committed row, tombstones included.
    pub fn find(&self, table: &str, id: &str) -> StoreResult<Option<StoredRecord>> {
        let tables = self.inner.tables.read();
        Ok(tables.visible(table, id, tables.committed_seq).cloned())
    }

    /// Returns every committed row of a table, tombstones included.
    pub fn scan(&self, table: &str) -> StoreResult<Vec<StoredRecord>> {
        let tables = self.inner.tables.read();
        Ok(tables
            .visible_rows(table, tables.committed_seq)
            .cloned()
            .collect())
    }

    /// Creates a row in its own transaction.
    pub fn create(&self, table: &str, id: &str, data: Value) -> StoreResult<()> {
        self.transaction(|txn| txn.create(table, id, data))
    }

    /// Updates a row in its own transaction.
    pub fn update(&self, table: &str, id: &str, data: Value) -> StoreResult<()> {
        self.transaction(|txn| txn.update(table, id, data))
    }

    /// Upserts a row in its own transaction.
    pub fn upsert(&self, table: &str, id: &str, data: Value) -> StoreResult<()> {
        self.transaction(|txn| txn.upsert(table, id, data))
    }

    /// Deletes a row in its own transaction.
    pub fn destroy(&self, table: &str, id: &str) -> StoreResult<()> {
        self.transaction(|txn| txn.destroy(table, id))
    }

    /// Drops row versions that no active or future transaction can see.
    /// Returns the number of versions removed.
    ///
    /// Runs on its own every [`StoreConfig::auto_vacuum_every`] commits.
    pub fn vacuum(&self) -> StoreResult<usize> {
        let mut tables = self.inner.lock_for_commit()?;
        Ok(self.vacuum_locked(&mut tables))
    }

    fn vacuum_locked(&self, tables: &mut Tables) -> usize {
        let horizon = self
            .inner
            .active_txns
            .read()
            .iter()
            .map(|(_, snapshot)| *snapshot)
            .min()
            .unwrap_or(tables.committed_seq);

        let Tables { rows, by_tick, .. } = tables;
        let mut removed = 0;
        for (table, table_rows) in rows.iter_mut() {
            for (id, versions) in table_rows.iter_mut() {
                // Keep the newest version at or below the horizon and all later ones
                let keep_from = versions
                    .iter()
                    .rposition(|v| v.seq <= horizon)
                    .unwrap_or(0);
                if keep_from == 0 {
                    continue;
                }
                let dropped: Vec<Tick> = versions
                    .drain(..keep_from)
                    .map(|v| v.record.updated_at_tick)
                    .collect();
                removed += dropped.len();
                if let Some(index) = by_tick.get_mut(table) {
                    for tick in dropped {
                        if !versions.iter().any(|v| v.record.updated_at_tick == tick) {
                            index.remove(&(tick, id.clone()));
                        }
                    }
                }
            }
        }
        removed
    }

    /// Blocks every commit, fact increment and read until the returned
    /// guard is dropped.
    pub fn pause_commits(&self) -> CommitPause<'_> {
        CommitPause {
            _guard: self.inner.tables.write(),
        }
    }

    /// Returns the current committed sequence number.
    #[must_use]
    pub fn committed_seq(&self) -> SequenceNumber {
        self.inner.tables.read().committed_seq
    }

    /// Returns the number of active transactions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.active_txns.read().len()
    }
}

/// Guard returned by [`Store::pause_commits`].
#[must_use = "commits resume as soon as the guard is dropped"]
pub struct CommitPause<'a> {
    _guard: RwLockWriteGuard<'a, Tables>,
}

impl std::fmt::Debug for CommitPause<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitPause").finish_non_exhaustive()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("committed_seq", &self.committed_seq())
            .field("active_count", &self.active_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn commit_empty_transaction() {
        let store = Store::new();
        let mut txn = store.begin();
        let seq = store.commit(&mut txn).unwrap();
        assert_eq!(seq.as_u64(), 0);
        assert!(!txn.is_active());
        assert_eq!(store.active_count(), 0);
    }

    #[test]
    fn cannot_commit_twice() {
        let store = Store::new();
        let mut txn = store.begin();
        store.commit(&mut txn).unwrap();
        assert!(store.commit(&mut txn).is_err());
        assert!(store.abort(&mut txn).is_err());
    }

    #[test]
    fn commit_rejects_foreign_transaction() {
        let a = Store::new();
        let b = Store::new();
        let mut txn = a.begin();
        assert!(matches!(
            b.commit(&mut txn),
            Err(StoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn writes_are_stamped_with_current_tick() {
        let store = Store::new();
        store.set_fact("currentSyncTick", 10).unwrap();
        store.create("patients", "p1", json!({})).unwrap();
        assert_eq!(store.find("patients", "p1").unwrap().unwrap().updated_at_tick, 10);

        store.increment_fact("currentSyncTick", 2).unwrap();
        store.update("patients", "p1", json!({ "v": 2 })).unwrap();
        assert_eq!(store.find("patients", "p1").unwrap().unwrap().updated_at_tick, 12);
    }

    #[test]
    fn stamp_tick_overrides_current_tick() {
        let store = Store::new();
        store.set_fact("currentSyncTick", 10).unwrap();
        store
            .transaction(|txn| {
                txn.stamp_with(7);
                txn.upsert("patients", "p1", json!({}))?;
                txn.upsert_at("patients", "p2", json!({}), false, 3)
            })
            .unwrap();
        assert_eq!(store.find("patients", "p1").unwrap().unwrap().updated_at_tick, 7);
        assert_eq!(store.find("patients", "p2").unwrap().unwrap().updated_at_tick, 3);
    }

    #[test]
    fn stamp_follows_tick_written_in_same_transaction() {
        let store = Store::new();
        store
            .transaction(|txn| {
                txn.set_fact("currentSyncTick", 30)?;
                txn.upsert("patients", "p1", json!({}))
            })
            .unwrap();
        assert_eq!(store.find("patients", "p1").unwrap().unwrap().updated_at_tick, 30);
    }

    #[test]
    fn snapshot_isolation_reader_sees_old_version() {
        let store = Store::new();
        store.create("patients", "p1", json!({ "v": 1 })).unwrap();

        let reader = store.begin();
        store.update("patients", "p1", json!({ "v": 2 })).unwrap();
        store.create("patients", "p2", json!({})).unwrap();

        let seen = reader.find("patients", "p1").unwrap().unwrap();
        assert_eq!(seen.data, json!({ "v": 1 }));
        assert!(reader.find("patients", "p2").unwrap().is_none());
        assert_eq!(reader.scan("patients").unwrap().len(), 1);

        let fresh = store.begin();
        assert_eq!(fresh.scan("patients").unwrap().len(), 2);
    }

    #[test]
    fn failed_closure_rolls_back() {
        let store = Store::new();
        let result: StoreResult<()> = store.transaction(|txn| {
            txn.create("patients", "p1", json!({}))?;
            txn.update("patients", "missing", json!({}))
        });
        assert!(result.is_err());
        assert!(store.find("patients", "p1").unwrap().is_none());
        assert_eq!(store.active_count(), 0);
    }

    #[test]
    fn increment_fact_starts_from_zero() {
        let store = Store::new();
        assert_eq!(store.increment_fact("currentSyncTick", 2).unwrap(), 2);
        assert_eq!(store.increment_fact("currentSyncTick", 2).unwrap(), 4);
        assert_eq!(store.get_fact("currentSyncTick").unwrap(), Some(4));
    }

    #[test]
    fn increment_times_out_under_held_lock() {
        let store = Store::with_config(
            StoreConfig::new().with_lock_timeout(Duration::from_millis(10)),
        );
        let guard = store.pause_commits();
        let err = store.increment_fact("currentSyncTick", 2).unwrap_err();
        assert!(err.is_contention());
        drop(guard);
        assert_eq!(store.increment_fact("currentSyncTick", 2).unwrap(), 2);
    }

    #[test]
    fn destroy_leaves_tombstone() {
        let store = Store::new();
        store.create("patients", "p1", json!({ "v": 1 })).unwrap();
        store.destroy("patients", "p1").unwrap();
        let row = store.find("patients", "p1").unwrap().unwrap();
        assert!(row.is_deleted);
        assert!(store.destroy("patients", "p1").is_err());
    }

    #[test]
    fn vacuum_keeps_versions_visible_to_readers() {
        let store = Store::new();
        store.create("patients", "p1", json!({ "v": 1 })).unwrap();
        let reader = store.begin();
        store.update("patients", "p1", json!({ "v": 2 })).unwrap();
        store.update("patients", "p1", json!({ "v": 3 })).unwrap();

        assert_eq!(store.vacuum().unwrap(), 0);
        assert_eq!(
            reader.find("patients", "p1").unwrap().unwrap().data,
            json!({ "v": 1 })
        );

        drop(reader);
        assert_eq!(store.vacuum().unwrap(), 2);
        assert_eq!(
            store.find("patients", "p1").unwrap().unwrap().data,
            json!({ "v": 3 })
        );
    }

    #[test]
    fn vacuum_runs_after_enough_commits() {
        let store = Store::with_config(StoreConfig::new().with_auto_vacuum_every(Some(4)));
        for _ in 0..10 {
            store.increment_fact("currentSyncTick", 2).unwrap();
        }
        // Only the versions written since the last automatic pass are left
        assert!(store.vacuum().unwrap() < 4);
        assert_eq!(store.get_fact("currentSyncTick").unwrap(), Some(20));

        let manual = Store::with_config(StoreConfig::new().with_auto_vacuum_every(None));
        for _ in 0..10 {
            manual.increment_fact("currentSyncTick", 2).unwrap();
        }
        assert_eq!(manual.vacuum().unwrap(), 9);
    }

    #[test]
    fn changed_rows_follow_the_reader_snapshot() {
        let store = Store::new();
        store.set_fact("currentSyncTick", 5).unwrap();
        store.create("patients", "p1", json!({ "v": 1 })).unwrap();
        let reader = store.begin();

        store.set_fact("currentSyncTick", 9).unwrap();
        store.update("patients", "p1", json!({ "v": 2 })).unwrap();
        store.create("patients", "p2", json!({})).unwrap();

        let old = reader.changed_since("patients", 4, Some(6)).unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].data, json!({ "v": 1 }));
        assert!(reader.changed_since("patients", 6, None).unwrap().is_empty());

        let fresh = store.begin();
        assert!(fresh.changed_since("patients", 4, Some(6)).unwrap().is_empty());
        let ids: Vec<String> = fresh
            .changed_since("patients", 6, None)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["p1", "p2"]);
        drop(fresh);

        // Vacuum drops the superseded version and its index entry
        drop(reader);
        assert_eq!(store.vacuum().unwrap(), 2);
        let after = store.begin();
        assert!(after.changed_since("patients", 4, Some(6)).unwrap().is_empty());
        assert_eq!(after.changed_since("patients", 6, Some(9)).unwrap().len(), 2);
    }

    proptest! {
        #[test]
        fn committed_sequences_strictly_increase(writes in 1usize..20) {
            let store = Store::new();
            let mut last = store.committed_seq();
            for i in 0..writes {
                store.upsert("t", &format!("r{i}"), json!({ "i": i })).unwrap();
                let seq = store.committed_seq();
                prop_assert!(seq > last);
                last = seq;
            }
            prop_assert_eq!(store.scan("t").unwrap().len(), writes);
        }
    }
}
