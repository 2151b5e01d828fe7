//! # medsync protocol
//!
//! Types exchanged between facility nodes and the central sync engine.
//!
//! This crate provides:
//! - [`IncomingChange`] and [`OutgoingChange`] for pushed and pulled records
//! - [`SyncLookupRow`], one denormalized row per replicable record
//! - Session request types ([`StartSessionOptions`], [`PullParams`],
//!   [`PagingOptions`]) and their responses
//! - [`LookupRunReport`], the outcome of one lookup-table rebuild
//!
//! This is a pure data crate with no I/O. Every type derives `serde`
//! traits; no particular wire encoding is implied.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changes;
mod lookup;
mod messages;

pub use changes::{ChangeDirection, IncomingChange, OutgoingChange};
pub use lookup::{LookupRunReport, RecordScope, SyncLookupRow};
pub use messages::{
    PagingOptions, PullMetadata, PullParams, SessionDirection, SessionId, StartSessionOptions,
    SyncMetadata,
};

/// A sync tick. `-1` means "never synced".
pub type Tick = i64;

/// The `since` value of a node that has never synced.
pub const NEVER_SYNCED: Tick = -1;
