use crate::clients::entity_ref::EntityRef;
use crate::framework::{EventSourcedEntity, ShardingError};
use crate::lifecycle::ClusterSharding;
use crate::sharding::{EntityId, EntityTypeKey};
use std::time::Duration;

/// Trait for entity-specific clients to share the way they reach entities.
///
/// Implementors provide the node's [`ClusterSharding`], the type key and an
/// error mapping; `entity_ref` comes for free.
pub trait EntityClient<E: EventSourcedEntity>: Send + Sync {
    /// The entity-specific error type.
    type Error: From<ShardingError> + Send;

    fn sharding(&self) -> &ClusterSharding;

    fn type_key(&self) -> &EntityTypeKey<E>;

    fn ask_timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// Reference to the entity `entity_id`, wherever it lives.
    fn entity_ref(&self, entity_id: &str) -> Result<EntityRef<E>, Self::Error> {
        self.sharding()
            .entity_ref_for(self.type_key(), EntityId::new(entity_id))
            .map_err(Self::Error::from)
    }
}
