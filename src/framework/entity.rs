//! # EventSourcedEntity Trait
//!
//! The contract every sharded, event-sourced entity implements.
//!
//! # Architecture Note
//! The behavior is split into two pure functions:
//! - `command_handler(&State, Command) -> Effect` decides *what happened*;
//! - `event_handler(State, &Event) -> State` folds *what happened* into state.
//!
//! The runtime owns everything in between: appending events with the next
//! sequence numbers, folding them, running replies after the append, and
//! replaying the same `event_handler` on recovery. Because the fold is the only
//! way state changes, replaying the stored events always yields the state the
//! live instance had.
//!
//! Associated types keep a behavior's commands, events and state apart from any
//! other behavior's. An [`EntityRef`](crate::clients::EntityRef) for
//! `HelloWorld` can only carry `HelloWorld` commands.

use crate::framework::effect::Effect;
use crate::persistence::{PersistenceId, SnapshotPolicy};
use crate::sharding::{EntityId, EntityTypeKey, NodeId, ShardId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;

pub trait EventSourcedEntity: Sized + Send + 'static {
    type Command: Debug + Send + 'static;
    type Event: Serialize + DeserializeOwned + Debug + Clone + Send + 'static;
    type State: Serialize + DeserializeOwned + Debug + Clone + Send + 'static;

    fn empty_state(&self) -> Self::State;

    fn command_handler(&self, state: &Self::State, command: Self::Command) -> Effect<Self>;

    fn event_handler(&self, state: Self::State, event: &Self::Event) -> Self::State;

    /// Overrides the node-wide snapshot policy for this behavior.
    fn snapshot_policy(&self) -> Option<SnapshotPolicy> {
        None
    }

    /// Called once replay has finished, before the first command is handled.
    fn on_recovery_completed(&self, _state: &Self::State, _sequence_nr: u64) {}
}

/// Everything a behavior factory knows about the instance it creates.
#[derive(Debug, Clone)]
pub struct EntityContext {
    pub type_name: String,
    pub entity_id: EntityId,
    pub persistence_id: PersistenceId,
    pub shard_id: ShardId,
    pub node_id: NodeId,
}

type Factory<E> = Arc<dyn Fn(&EntityContext) -> E + Send + Sync>;

/// Registration of an entity kind: its key and how to build a behavior for an id.
pub struct Entity<E: EventSourcedEntity> {
    type_key: EntityTypeKey<E>,
    factory: Factory<E>,
}

impl<E: EventSourcedEntity> Entity<E> {
    pub fn of<F>(type_key: EntityTypeKey<E>, factory: F) -> Self
    where
        F: Fn(&EntityContext) -> E + Send + Sync + 'static,
    {
        Self {
            type_key,
            factory: Arc::new(factory),
        }
    }

    pub fn type_key(&self) -> &EntityTypeKey<E> {
        &self.type_key
    }

    pub(crate) fn create(&self, context: &EntityContext) -> E {
        (self.factory)(context)
    }
}

impl<E: EventSourcedEntity> Clone for Entity<E> {
    fn clone(&self) -> Self {
        Self {
            type_key: self.type_key.clone(),
            factory: self.factory.clone(),
        }
    }
}
