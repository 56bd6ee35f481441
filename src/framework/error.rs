//! # Framework Errors
//!
//! Every failure a caller of the sharding runtime can observe. The enum is
//! `Clone` so a single failure (a corrupt stream, a closed region) can be
//! handed to every pending ask it affects.

use crate::persistence::PersistenceId;
use crate::sharding::{EntityId, NodeId, ShardId};
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ShardingError {
    /// The event stream could not be read or replayed. Fatal to this
    /// activation only; the next message triggers a fresh attempt.
    #[error("activation of {persistence_id} failed: {reason}")]
    ActivationFailure {
        persistence_id: PersistenceId,
        reason: String,
    },
    /// Appending the events of a command failed. The command was aborted and
    /// the in-memory instance discarded.
    #[error("persisting events for {persistence_id} failed: {reason}")]
    PersistFailure {
        persistence_id: PersistenceId,
        reason: String,
    },
    #[error("{shard_id} is not hosted on {node_id}")]
    NotOwner { shard_id: ShardId, node_id: NodeId },
    /// Routing gave up. The command may or may not have been processed.
    #[error("delivery to {entity_id} uncertain: {reason}")]
    DeliveryUncertain { entity_id: EntityId, reason: String },
    /// No reply before the deadline. Does not imply the command was not processed.
    #[error("ask timed out after {timeout:?}")]
    AskTimeout { timeout: Duration },
    /// Another writer appended to a stream this instance owns.
    #[error("single-writer violation on {persistence_id}: {reason}")]
    HandoffViolation {
        persistence_id: PersistenceId,
        reason: String,
    },
    #[error("{0} is being handed off")]
    HandoffInProgress(ShardId),
    #[error("entity type {0} is not registered on this node")]
    NotRegistered(String),
    #[error("entity type {0} is already registered")]
    AlreadyRegistered(String),
    #[error("coordinator error: {0}")]
    Coordinator(String),
    #[error("region on {0} is closed")]
    RegionClosed(NodeId),
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
    #[error("reply did not have the expected type")]
    ReplyTypeMismatch,
}

impl ShardingError {
    /// Failures caused by a stale or moving shard location. Routing refreshes
    /// the location and tries again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShardingError::NotOwner { .. }
                | ShardingError::HandoffInProgress(_)
                | ShardingError::Coordinator(_)
                | ShardingError::RegionClosed(_)
        )
    }
}
