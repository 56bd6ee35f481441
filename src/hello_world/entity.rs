//! [`EventSourcedEntity`] implementation for [`HelloWorld`].

use super::model::{Greeted, Greeting, HelloWorldCommand, KnownPeople};
use crate::framework::{Effect, Entity, EntityContext, EventSourcedEntity};
use crate::sharding::EntityTypeKey;
use tracing::info;

/// A world that remembers everybody it has greeted.
#[derive(Debug, Clone, Copy, Default)]
pub struct HelloWorld;

impl HelloWorld {
    pub const TYPE_NAME: &'static str = "HelloWorld";

    pub fn type_key() -> EntityTypeKey<HelloWorld> {
        EntityTypeKey::new(Self::TYPE_NAME)
    }

    pub fn create(context: &EntityContext) -> Self {
        info!(entity_id = %context.entity_id, persistence_id = %context.persistence_id, "Starting HelloWorld");
        HelloWorld
    }

    /// Registration value for [`ClusterSharding::init`](crate::lifecycle::ClusterSharding::init).
    pub fn entity() -> Entity<HelloWorld> {
        Entity::of(Self::type_key(), Self::create)
    }
}

impl EventSourcedEntity for HelloWorld {
    type Command = HelloWorldCommand;
    type Event = Greeted;
    type State = KnownPeople;

    fn empty_state(&self) -> KnownPeople {
        KnownPeople::default()
    }

    fn command_handler(&self, state: &KnownPeople, command: HelloWorldCommand) -> Effect<Self> {
        match command {
            HelloWorldCommand::Greet { whom, reply_to } => Effect::persist(Greeted::new(whom.clone()))
                .then_reply(reply_to, move |state: &KnownPeople| Greeting {
                    whom,
                    number_of_people: state.len(),
                }),
            HelloWorldCommand::KnownPeople { reply_to } => Effect::reply(reply_to, state.names()),
            HelloWorldCommand::Retire { reply_to } => {
                Effect::reply(reply_to, state.len()).then_stop()
            }
        }
    }

    fn event_handler(&self, state: KnownPeople, event: &Greeted) -> KnownPeople {
        state.with(event.whom.clone())
    }
}
