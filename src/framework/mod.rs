//! Event-sourced entity framework.
//!
//! This module provides the building blocks of a persistent entity: the
//! behavior contract, the declarative effect a command handler returns, the
//! per-entity task that recovers and persists, and the shared error type.
//!
//! # Main Components
//!
//! - [`EventSourcedEntity`] - Trait that entity behaviors implement
//! - [`Effect`] - What a command handler wants persisted and done afterwards
//! - [`Entity`] - Registration of a behavior under an [`EntityTypeKey`](crate::sharding::EntityTypeKey)
//! - [`ShardingError`] - Every failure a caller can observe

pub mod effect;
pub mod entity;
pub mod error;
pub(crate) mod instance;
pub mod message;

pub use effect::Effect;
pub use entity::{Entity, EntityContext, EventSourcedEntity};
pub use error::ShardingError;
pub use instance::{EntityPhase, Termination, TerminationReason};
pub use message::Envelope;
