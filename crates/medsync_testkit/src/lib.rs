//! # medsync testkit
//!
//! Test utilities for the medsync sync engine.
//!
//! This crate provides:
//! - A standard set of clinical models and a seeded central server
//! - Polling helpers that drive a session through its lifecycle
//! - Property-based test generators using proptest
//! - Concurrent push/pull stress runs
//!
//! ## Usage
//!
//! ```rust
//! use medsync_testkit::prelude::*;
//!
//! let central = TestCentral::new();
//! central.seed_patient("p1", "f1");
//! central.rebuild_lookup();
//!
//! let pulled = central.pull_initial(&["f1"]).unwrap();
//! assert_eq!(pulled.metadata.total_to_pull, pulled.changes.len());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod polling;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::polling::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use polling::*;
pub use stress::*;
