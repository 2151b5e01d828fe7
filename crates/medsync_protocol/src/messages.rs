//! Session request and response types.

use crate::{Tick, NEVER_SYNCED};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generates a new random session ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which legs a session performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionDirection {
    /// Central to facility only.
    Pull,
    /// Facility to central only.
    Push,
    /// Both legs.
    Bidirectional,
}

impl SessionDirection {
    /// Returns true if the session has a pull leg.
    #[must_use]
    pub fn pulls(self) -> bool {
        matches!(self, SessionDirection::Pull | SessionDirection::Bidirectional)
    }

    /// Returns true if the session has a push leg.
    #[must_use]
    pub fn pushes(self) -> bool {
        matches!(self, SessionDirection::Push | SessionDirection::Bidirectional)
    }
}

/// Options for starting a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionOptions {
    /// Session legs.
    pub direction: SessionDirection,
    /// Facilities the node serves.
    pub facility_ids: Vec<String>,
    /// Node identity, used to close its stale sessions.
    pub device_id: Option<String>,
}

impl StartSessionOptions {
    /// Creates options for a session in the given direction.
    #[must_use]
    pub fn new(direction: SessionDirection) -> Self {
        Self {
            direction,
            facility_ids: Vec::new(),
            device_id: None,
        }
    }

    /// Sets the facilities.
    #[must_use]
    pub fn with_facilities<I, S>(mut self, facility_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.facility_ids = facility_ids.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the device.
    #[must_use]
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

/// Parameters of a pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullParams {
    /// Last tick the facility has seen; [`NEVER_SYNCED`] for a first sync.
    pub since: Tick,
    /// Facilities to pull for.
    pub facility_ids: Vec<String>,
    /// Restricts the pull to these record types.
    pub tables_to_include: Option<Vec<String>>,
    /// Record types re-sent in full regardless of `since`.
    pub tables_for_full_resync: Option<Vec<String>>,
}

impl PullParams {
    /// Creates pull parameters.
    pub fn new<I, S>(since: Tick, facility_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            since,
            facility_ids: facility_ids.into_iter().map(Into::into).collect(),
            tables_to_include: None,
            tables_for_full_resync: None,
        }
    }

    /// Creates parameters for a facility's first sync.
    pub fn initial<I, S>(facility_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(NEVER_SYNCED, facility_ids)
    }

    /// Restricts the pull to the given record types.
    #[must_use]
    pub fn with_tables_to_include<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables_to_include = Some(tables.into_iter().map(Into::into).collect());
        self
    }

    /// Re-sends the given record types in full.
    #[must_use]
    pub fn with_full_resync<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables_for_full_resync = Some(tables.into_iter().map(Into::into).collect());
        self
    }

    /// Returns true if `record_type` is part of the pull.
    #[must_use]
    pub fn includes(&self, record_type: &str) -> bool {
        self.tables_to_include
            .as_ref()
            .map_or(true, |tables| tables.iter().any(|t| t == record_type))
    }

    /// Returns true if `record_type` is re-sent in full.
    #[must_use]
    pub fn is_full_resync(&self, record_type: &str) -> bool {
        self.tables_for_full_resync
            .as_ref()
            .is_some_and(|tables| tables.iter().any(|t| t == record_type))
    }
}

/// Paging cursor for outgoing changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagingOptions {
    /// Return changes with a cursor strictly greater than this.
    pub from_id: Option<u64>,
    /// Maximum number of changes to return.
    pub limit: Option<usize>,
}

impl PagingOptions {
    /// Pages starting after `from_id`.
    #[must_use]
    pub fn after(from_id: u64) -> Self {
        Self {
            from_id: Some(from_id),
            limit: None,
        }
    }

    /// Sets the page size.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Returned once a session is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    /// Tick captured when the session was prepared.
    pub started_at_tick: Tick,
}

/// Returned once a pull snapshot is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullMetadata {
    /// Number of changes in the snapshot.
    pub total_to_pull: usize,
    /// Boundary the snapshot was planned at; the facility's next `since`.
    pub pull_until: Tick,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_legs() {
        assert!(SessionDirection::Pull.pulls());
        assert!(!SessionDirection::Pull.pushes());
        assert!(SessionDirection::Push.pushes());
        assert!(SessionDirection::Bidirectional.pulls());
        assert!(SessionDirection::Bidirectional.pushes());
    }

    #[test]
    fn pull_params_table_filters() {
        let params = PullParams::initial(["f1"]);
        assert_eq!(params.since, NEVER_SYNCED);
        assert!(params.includes("encounters"));
        assert!(!params.is_full_resync("encounters"));

        let params = PullParams::new(10, ["f1"])
            .with_tables_to_include(["patients"])
            .with_full_resync(["reference_data"]);
        assert!(params.includes("patients"));
        assert!(!params.includes("encounters"));
        assert!(params.is_full_resync("reference_data"));
    }

    #[test]
    fn session_ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 36);
    }

    #[test]
    fn start_options_builder() {
        let opts = StartSessionOptions::new(SessionDirection::Bidirectional)
            .with_facilities(["f1", "f2"])
            .with_device("dev-1");
        assert_eq!(opts.facility_ids, vec!["f1", "f2"]);
        assert_eq!(opts.device_id.as_deref(), Some("dev-1"));
    }
}
