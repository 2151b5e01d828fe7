//! Benchmark utilities for medsync.

#![warn(missing_docs)]

pub mod utils;
