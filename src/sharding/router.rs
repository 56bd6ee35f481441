//! # Shard Router
//!
//! Delivers envelopes to the region hosting their shard.
//!
//! The routing table (`ShardId -> NodeId`) is a cache of coordinator answers.
//! A stale entry shows up as a retryable rejection (`NotOwner`, a closed
//! region, a handoff in progress); the router then drops the entry, waits with
//! exponential backoff and asks the coordinator again. After
//! `RetrySettings::max_attempts` it gives up with
//! [`ShardingError::DeliveryUncertain`] and resolves the envelope's ask with it.
//! A region that accepts an envelope and then stops before confirming it is
//! reported the same way.

use crate::config::RetrySettings;
use crate::framework::{Envelope, EventSourcedEntity, ShardingError};
use crate::scheduler::Scheduler;
use crate::sharding::coordinator::ShardCoordinator;
use crate::sharding::region::Rejected;
use crate::sharding::resolver::ShardResolver;
use crate::sharding::transport::RegionDirectory;
use crate::sharding::types::{NodeId, ShardId};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ShardRouter<E: EventSourcedEntity> {
    type_name: String,
    resolver: ShardResolver,
    coordinator: Arc<dyn ShardCoordinator>,
    directory: RegionDirectory<E>,
    scheduler: Scheduler,
    retry: RetrySettings,
    routing_table: DashMap<ShardId, NodeId>,
}

impl<E: EventSourcedEntity> ShardRouter<E> {
    pub fn new(
        type_name: impl Into<String>,
        resolver: ShardResolver,
        coordinator: Arc<dyn ShardCoordinator>,
        directory: RegionDirectory<E>,
        scheduler: Scheduler,
        retry: RetrySettings,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            resolver,
            coordinator,
            directory,
            scheduler,
            retry,
            routing_table: DashMap::new(),
        }
    }

    pub fn resolver(&self) -> &ShardResolver {
        &self.resolver
    }

    /// Cached location of `shard_id`, if any.
    pub fn cached_location(&self, shard_id: ShardId) -> Option<NodeId> {
        self.routing_table.get(&shard_id).map(|node| node.clone())
    }

    pub fn invalidate(&self, shard_id: ShardId) {
        self.routing_table.remove(&shard_id);
    }

    /// Routes `envelope` to the region owning its shard, retrying stale
    /// locations with backoff.
    pub async fn route(&self, envelope: Envelope<E>) -> Result<(), ShardingError> {
        let shard_id = self.resolver.shard_id_for(&envelope.entity_id);
        let entity_id = envelope.entity_id.clone();
        let mut envelope = envelope;
        let mut attempt = 1;

        loop {
            let ask = envelope.ask.clone();
            let reason = match self.try_deliver(shard_id, envelope).await {
                Ok(node_id) => {
                    debug!(entity_type = self.type_name.as_str(), %entity_id, %shard_id, %node_id, attempt, "Routed");
                    return Ok(());
                }
                Err(Rejected {
                    envelope: Some(returned),
                    reason,
                }) if reason.is_retryable() => {
                    envelope = returned;
                    reason
                }
                Err(Rejected {
                    envelope: Some(returned),
                    reason,
                }) => {
                    returned.fail(reason.clone());
                    return Err(reason);
                }
                // The region took the envelope and went away; whether the
                // command ran is unknown.
                Err(Rejected {
                    envelope: None,
                    reason,
                }) => {
                    let error = match reason {
                        e @ ShardingError::DeliveryUncertain { .. } => e,
                        other => ShardingError::DeliveryUncertain {
                            entity_id: entity_id.clone(),
                            reason: other.to_string(),
                        },
                    };
                    if let Some(ask) = ask {
                        ask.fail(error.clone());
                    }
                    return Err(error);
                }
            };

            self.invalidate(shard_id);
            if attempt >= self.retry.max_attempts {
                warn!(
                    entity_type = self.type_name.as_str(),
                    %entity_id,
                    %shard_id,
                    attempts = attempt,
                    error = %reason,
                    "Routing retries exhausted"
                );
                let error = ShardingError::DeliveryUncertain {
                    entity_id,
                    reason: format!("gave up after {attempt} attempts: {reason}"),
                };
                envelope.fail(error.clone());
                return Err(error);
            }

            let backoff = self.retry.backoff_for(attempt);
            debug!(
                entity_type = self.type_name.as_str(),
                %entity_id,
                %shard_id,
                attempt,
                ?backoff,
                error = %reason,
                "Retrying route"
            );
            self.scheduler.sleep(backoff).await;
            attempt += 1;
        }
    }

    async fn try_deliver(
        &self,
        shard_id: ShardId,
        envelope: Envelope<E>,
    ) -> Result<NodeId, Rejected<E>> {
        let node_id = match self.location(shard_id).await {
            Ok(node_id) => node_id,
            Err(reason) => {
                return Err(Rejected {
                    envelope: Some(envelope),
                    reason,
                })
            }
        };
        let Some(region) = self.directory.lookup(&node_id) else {
            return Err(Rejected {
                envelope: Some(envelope),
                reason: ShardingError::RegionClosed(node_id),
            });
        };
        region.deliver(envelope).await.map(|()| node_id)
    }

    async fn location(&self, shard_id: ShardId) -> Result<NodeId, ShardingError> {
        if let Some(node_id) = self.cached_location(shard_id) {
            return Ok(node_id);
        }
        let node_id = self.coordinator.shard_location(shard_id).await?;
        self.routing_table.insert(shard_id, node_id.clone());
        Ok(node_id)
    }
}
