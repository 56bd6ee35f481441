//! # Messages
//!
//! What travels from an [`EntityRef`](crate::clients::EntityRef) through the
//! router and region into an entity's mailbox.

use crate::clients::AskHandle;
use crate::framework::entity::EventSourcedEntity;
use crate::framework::error::ShardingError;
use crate::sharding::EntityId;
use std::fmt;

/// A command addressed to one entity, plus the pending ask it belongs to (if any).
pub struct Envelope<E: EventSourcedEntity> {
    pub entity_id: EntityId,
    pub command: E::Command,
    pub(crate) ask: Option<AskHandle>,
}

impl<E: EventSourcedEntity> Envelope<E> {
    pub fn tell(entity_id: EntityId, command: E::Command) -> Self {
        Self {
            entity_id,
            command,
            ask: None,
        }
    }

    pub(crate) fn ask(entity_id: EntityId, command: E::Command, ask: AskHandle) -> Self {
        Self {
            entity_id,
            command,
            ask: Some(ask),
        }
    }

    /// Resolves the pending ask with `error`. A no-op for tells.
    pub fn fail(&self, error: ShardingError) {
        if let Some(ask) = &self.ask {
            ask.fail(error);
        }
    }
}

impl<E: EventSourcedEntity> fmt::Debug for Envelope<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("entity_id", &self.entity_id)
            .field("command", &self.command)
            .field("ask", &self.ask.as_ref().map(AskHandle::correlation_id))
            .finish()
    }
}

/// Mailbox message of a single entity instance.
pub(crate) enum EntityMessage<E: EventSourcedEntity> {
    Command(Envelope<E>),
    /// Finish everything queued before this, then exit.
    Passivate,
}
