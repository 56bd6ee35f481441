//! # Event Log
//!
//! The narrow interface the runtime consumes from a durable event store:
//! per-entity append-only event streams plus optional snapshots.
//!
//! # Architecture Note
//! The store itself is an external collaborator. The runtime only relies on
//! three properties of an implementation:
//! - `append` is atomic for the whole batch and rejects a batch whose first
//!   sequence number is not exactly `highest + 1` ([`StoreError::SequenceConflict`]);
//! - `read_events` returns events in ascending sequence order;
//! - snapshots are advisory. Losing one only costs a longer replay.
//!
//! Payloads are stored as `serde_json::Value` so the log never needs to know
//! the concrete event types of the entities it serves.

mod memory;

pub use memory::InMemoryEventLog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::sharding::EntityId;

/// Globally unique key of an event stream: entity kind plus entity id.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PersistenceId {
    pub type_name: String,
    pub entity_id: EntityId,
}

impl PersistenceId {
    pub fn of(type_name: impl Into<String>, entity_id: EntityId) -> Self {
        Self {
            type_name: type_name.into(),
            entity_id,
        }
    }
}

impl fmt::Display for PersistenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.type_name, self.entity_id)
    }
}

/// An event as stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEvent {
    pub persistence_id: PersistenceId,
    pub sequence_nr: u64,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Folded state as of `sequence_nr`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub persistence_id: PersistenceId,
    pub sequence_nr: u64,
    pub state: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("sequence conflict for {persistence_id}: expected {expected}, got {actual}")]
    SequenceConflict {
        persistence_id: PersistenceId,
        expected: u64,
        actual: u64,
    },
    #[error("event log unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt event stream for {persistence_id}: {reason}")]
    Corrupt {
        persistence_id: PersistenceId,
        reason: String,
    },
    #[error("serialization error: {0}")]
    Serde(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e.to_string())
    }
}

/// Durable, per-entity, append-only event storage.
#[async_trait]
pub trait EventLog: Send + Sync + 'static {
    /// Appends `events` atomically. The first event receives `from_sequence_nr`,
    /// which must equal the stream's highest sequence number plus one.
    async fn append(
        &self,
        persistence_id: &PersistenceId,
        from_sequence_nr: u64,
        events: Vec<serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// Returns every event with `sequence_nr >= from_sequence_nr`, ascending.
    async fn read_events(
        &self,
        persistence_id: &PersistenceId,
        from_sequence_nr: u64,
    ) -> Result<Vec<PersistedEvent>, StoreError>;

    /// Highest stored sequence number, `0` for an empty stream.
    async fn highest_sequence_nr(&self, persistence_id: &PersistenceId) -> Result<u64, StoreError>;

    async fn read_snapshot(
        &self,
        persistence_id: &PersistenceId,
    ) -> Result<Option<Snapshot>, StoreError>;

    async fn write_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError>;
}

/// When to take snapshots of an entity's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    #[default]
    Never,
    /// Snapshot whenever a persisted batch crosses a multiple of `n`.
    Every(u64),
}

impl SnapshotPolicy {
    pub fn should_snapshot(&self, before: u64, after: u64) -> bool {
        match self {
            SnapshotPolicy::Never => false,
            SnapshotPolicy::Every(0) => false,
            SnapshotPolicy::Every(n) => after / n > before / n,
        }
    }
}
