//! Stored record representation.

use crate::types::{SequenceNumber, Tick};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A row as seen by a reader.
///
/// Deleted rows are kept as tombstones so that a deletion replicates like
/// any other change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    /// Record ID, unique within its table.
    pub id: String,
    /// Column values.
    pub data: Value,
    /// Sync tick of the last committed mutation.
    pub updated_at_tick: Tick,
    /// Whether the record has been logically deleted.
    pub is_deleted: bool,
}

impl StoredRecord {
    /// Returns true if the record has not been deleted.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.is_deleted
    }

    /// Returns a string column.
    #[must_use]
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(Value::as_str)
    }

    /// Returns an integer column.
    #[must_use]
    pub fn field_i64(&self, name: &str) -> Option<i64> {
        self.data.get(name).and_then(Value::as_i64)
    }
}

/// One committed version of a row.
#[derive(Debug, Clone)]
pub(crate) struct Version {
    /// Commit that produced this version.
    pub seq: SequenceNumber,
    pub record: StoredRecord,
}

/// Returns the newest version visible at `snapshot`.
pub(crate) fn visible_at(versions: &[Version], snapshot: SequenceNumber) -> Option<&StoredRecord> {
    versions
        .iter()
        .rev()
        .find(|v| v.seq <= snapshot)
        .map(|v| &v.record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(tick: Tick) -> StoredRecord {
        StoredRecord {
            id: "p1".into(),
            data: json!({ "displayId": "AAA", "age": 40 }),
            updated_at_tick: tick,
            is_deleted: false,
        }
    }

    #[test]
    fn field_accessors() {
        let r = record(1);
        assert_eq!(r.field_str("displayId"), Some("AAA"));
        assert_eq!(r.field_i64("age"), Some(40));
        assert_eq!(r.field_str("missing"), None);
        assert!(r.is_live());
    }

    #[test]
    fn visibility_picks_newest_at_snapshot() {
        let versions = vec![
            Version {
                seq: SequenceNumber::new(1),
                record: record(10),
            },
            Version {
                seq: SequenceNumber::new(3),
                record: record(12),
            },
        ];
        assert!(visible_at(&versions, SequenceNumber::new(0)).is_none());
        assert_eq!(
            visible_at(&versions, SequenceNumber::new(2)).map(|r| r.updated_at_tick),
            Some(10)
        );
        assert_eq!(
            visible_at(&versions, SequenceNumber::new(9)).map(|r| r.updated_at_tick),
            Some(12)
        );
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(record(5)).unwrap();
        assert_eq!(json["updatedAtTick"], 5);
        assert_eq!(json["isDeleted"], false);
    }
}
