//! Error types for store operations.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A live record with this identity already exists.
    #[error("record already exists: {table}/{id}")]
    AlreadyExists {
        /// Table (record type).
        table: String,
        /// Record ID.
        id: String,
    },

    /// No live record with this identity exists.
    #[error("record not found: {table}/{id}")]
    RecordNotFound {
        /// Table (record type).
        table: String,
        /// Record ID.
        id: String,
    },

    /// The commit lock could not be taken in time.
    #[error("lock timeout after {waited_ms}ms")]
    LockTimeout {
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// A fact holds something other than an integer.
    #[error("fact {key} is not an integer")]
    InvalidFact {
        /// Fact key.
        key: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl StoreError {
    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if retrying the same operation may succeed.
    pub fn is_contention(&self) -> bool {
        matches!(self, StoreError::LockTimeout { .. })
    }
}
