//! # medsync store
//!
//! The storage collaborator of the sync engine: a transactional record
//! store holding one table per record type.
//!
//! This crate provides:
//! - Multi-version rows with snapshot isolation for readers
//! - Buffered write transactions applied atomically at commit
//! - Logical deletion (tombstones)
//! - Named integer facts with an atomic increment
//! - Tick stamping of every committed write
//!
//! ## Tick stamping
//!
//! Every row carries the sync tick of its last committed mutation. A write
//! that does not carry an explicit tick is stamped, at commit, with the
//! value of the current-tick fact ([`StoreConfig::tick_fact_key`]) as of
//! that commit.
//!
//! ## Example
//!
//! ```rust
//! use medsync_store::{Store, StoreError};
//! use serde_json::json;
//!
//! let store = Store::new();
//! store.set_fact("currentSyncTick", 7).unwrap();
//! store
//!     .transaction(|txn| {
//!         txn.create("patients", "p1", json!({ "firstName": "Ana" }))?;
//!         Ok::<_, StoreError>(())
//!     })
//!     .unwrap();
//!
//! let patient = store.find("patients", "p1").unwrap().unwrap();
//! assert_eq!(patient.updated_at_tick, 7);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod record;
mod store;
mod transaction;
mod types;

pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use record::StoredRecord;
pub use store::{CommitPause, Store};
pub use transaction::{Transaction, TransactionState};
pub use types::{SequenceNumber, Tick, TransactionId, CURRENT_SYNC_TICK, FACTS_TABLE};
