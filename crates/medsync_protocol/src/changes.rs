//! Pushed and pulled record changes.

use crate::lookup::SyncLookupRow;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Direction of a change, seen from the node that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeDirection {
    /// Received by the node.
    Incoming,
    /// Sent by the node. Pushed changes carry this tag.
    Outgoing,
}

/// A change pushed by a facility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingChange {
    /// Record type (table name).
    pub record_type: String,
    /// Record ID.
    pub record_id: String,
    /// Full record data.
    pub data: Value,
    /// Whether the record was deleted on the facility.
    pub is_deleted: bool,
    /// Direction tag.
    pub direction: ChangeDirection,
}

impl IncomingChange {
    /// Creates an upsert pushed by a facility.
    pub fn upsert(record_type: impl Into<String>, record_id: impl Into<String>, data: Value) -> Self {
        Self {
            record_type: record_type.into(),
            record_id: record_id.into(),
            data,
            is_deleted: false,
            direction: ChangeDirection::Outgoing,
        }
    }

    /// Creates a deletion pushed by a facility.
    pub fn deletion(record_type: impl Into<String>, record_id: impl Into<String>, data: Value) -> Self {
        Self {
            is_deleted: true,
            ..Self::upsert(record_type, record_id, data)
        }
    }

    /// Returns the `(record_type, record_id)` identity.
    #[must_use]
    pub fn key(&self) -> (&str, &str) {
        (&self.record_type, &self.record_id)
    }
}

/// A change sent to a facility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingChange {
    /// Paging cursor, unique and increasing within a session snapshot.
    pub id: u64,
    /// Record type (table name).
    pub record_type: String,
    /// Record ID.
    pub record_id: String,
    /// Denormalized record data.
    pub data: Value,
    /// Whether the record is a tombstone.
    pub is_deleted: bool,
}

impl OutgoingChange {
    /// Builds the change sent for a lookup row.
    #[must_use]
    pub fn from_lookup(id: u64, row: &SyncLookupRow) -> Self {
        Self {
            id,
            record_type: row.record_type.clone(),
            record_id: row.record_id.clone(),
            data: row.data.clone(),
            is_deleted: row.is_deleted,
        }
    }
}
