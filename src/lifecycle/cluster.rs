use crate::config::ShardingSettings;
use crate::framework::{Entity, EventSourcedEntity, ShardingError};
use crate::lifecycle::ClusterSharding;
use crate::persistence::EventLog;
use crate::sharding::coordinator::{LocalCoordinator, StaticMembership};
use crate::sharding::transport::LocalTransport;
use crate::sharding::{EntityId, NodeId, ShardCoordinator, ShardId, ShardResolver};
use std::sync::Arc;
use tracing::info;

/// Several sharding nodes in one process, sharing a coordinator, a transport
/// and an event log.
pub struct LocalCluster {
    membership: Arc<StaticMembership>,
    coordinator: Arc<LocalCoordinator>,
    resolver: ShardResolver,
    nodes: Vec<Arc<ClusterSharding>>,
}

impl LocalCluster {
    /// Starts `node_count` nodes named `node-0`, `node-1`, ...
    pub fn start(
        node_count: usize,
        settings: ShardingSettings,
        event_log: Arc<dyn EventLog>,
    ) -> Result<Self, ShardingError> {
        if node_count == 0 {
            return Err(ShardingError::InvalidConfig {
                reason: "a cluster needs at least one node".to_string(),
            });
        }
        settings.validate()?;
        let resolver = ShardResolver::new(settings.number_of_shards)?;

        let node_ids: Vec<NodeId> = (0..node_count)
            .map(|i| NodeId::new(format!("node-{i}")))
            .collect();
        let membership = Arc::new(StaticMembership::new(node_ids.clone()));
        let coordinator = Arc::new(LocalCoordinator::new(membership.clone()));
        let transport = Arc::new(LocalTransport::new());

        let nodes = node_ids
            .into_iter()
            .map(|node_id| {
                ClusterSharding::new(
                    node_id,
                    settings.clone(),
                    coordinator.clone(),
                    event_log.clone(),
                    transport.clone(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(nodes = node_count, shards = settings.number_of_shards, "Local cluster started");
        Ok(Self {
            membership,
            coordinator,
            resolver,
            nodes,
        })
    }

    pub fn node(&self, index: usize) -> Option<&Arc<ClusterSharding>> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[Arc<ClusterSharding>] {
        &self.nodes
    }

    pub fn coordinator(&self) -> &Arc<LocalCoordinator> {
        &self.coordinator
    }

    pub fn membership(&self) -> &Arc<StaticMembership> {
        &self.membership
    }

    /// Registers `entity` on every node.
    pub fn init_all<E: EventSourcedEntity>(&self, entity: Entity<E>) -> Result<(), ShardingError> {
        for node in &self.nodes {
            node.init(entity.clone())?;
        }
        Ok(())
    }

    pub fn shard_id_for(&self, entity_id: &EntityId) -> ShardId {
        self.resolver.shard_id_for(entity_id)
    }

    /// Node currently owning the shard of `entity_id`, allocating it if needed.
    pub async fn owner_of(&self, entity_id: &EntityId) -> Result<NodeId, ShardingError> {
        self.coordinator
            .shard_location(self.shard_id_for(entity_id))
            .await
    }

    /// Moves `shard_id` to the node at `to_index`.
    pub async fn handoff(&self, shard_id: ShardId, to_index: usize) -> Result<(), ShardingError> {
        let to = self
            .nodes
            .get(to_index)
            .map(|node| node.node_id().clone())
            .ok_or_else(|| ShardingError::InvalidConfig {
                reason: format!("no node at index {to_index}"),
            })?;
        self.coordinator.handoff(shard_id, to).await
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
        info!("Local cluster stopped");
    }
}
