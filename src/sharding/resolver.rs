//! # Shard Resolver
//!
//! Maps an [`EntityId`] to its [`ShardId`]. The mapping is a pure function of the
//! entity id and the configured number of shards, so every node computes the same
//! answer without consulting any node-local state. Where a shard lives is a
//! separate question answered by the coordinator.

use crate::framework::ShardingError;
use crate::sharding::hash::djb2_hash;
use crate::sharding::types::{EntityId, ShardId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardResolver {
    number_of_shards: u32,
}

impl ShardResolver {
    /// Creates a resolver for `number_of_shards` shards.
    ///
    /// # Errors
    /// Returns [`ShardingError::InvalidConfig`] when `number_of_shards` is zero.
    pub fn new(number_of_shards: u32) -> Result<Self, ShardingError> {
        if number_of_shards == 0 {
            return Err(ShardingError::InvalidConfig {
                reason: "number_of_shards must be >= 1".to_string(),
            });
        }
        Ok(Self { number_of_shards })
    }

    pub fn number_of_shards(&self) -> u32 {
        self.number_of_shards
    }

    pub fn shard_id_for(&self, entity_id: &EntityId) -> ShardId {
        ShardId(djb2_hash(entity_id.as_str().as_bytes()) % self.number_of_shards)
    }
}
