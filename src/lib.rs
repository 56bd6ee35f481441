//! # Sharded Entities
//!
//! > **Event-sourced entities, sharded across nodes, reached through stable handles.**
//!
//! This crate hosts many independent stateful entities across a set of nodes.
//! Each entity is active at most once cluster-wide, persists its state changes
//! as an ordered event log, recovers its state by replaying that log, and is
//! reached through an [`EntityRef`](clients::EntityRef) no matter which node
//! currently hosts it.
//!
//! ## 🏗️ Design Philosophy
//!
//! ### One entity, one task
//! Every active entity is a Tokio task with a single FIFO mailbox. Commands
//! for one entity are handled strictly one after another; parallelism comes
//! from running many entities at once, never from running one entity twice.
//!
//! ### Events first, replies after
//! A command handler returns an [`Effect`](framework::Effect): the events to
//! persist plus what to do once they are stored. Nothing observable (a reply,
//! a stop) happens before the events are durable.
//!
//! ### Stop, then activate
//! A shard only moves after its old owner has stopped every entity of the
//! shard and acknowledged the release. Two writers for one event stream are
//! prevented by the handoff protocol, and detected as a
//! [`HandoffViolation`](framework::ShardingError::HandoffViolation) should the
//! log ever report one.
//!
//! ## 🗺️ Module Tour
//!
//! ### 1. The Engine ([`framework`])
//! - **Role**: Separates the *business logic* (your entity) from the *plumbing*
//!   (mailboxes, recovery, persistence, replies).
//! - **Key items**: [`EventSourcedEntity`](framework::EventSourcedEntity),
//!   [`Effect`](framework::Effect), [`Entity`](framework::Entity).
//!
//! ### 2. Placement ([`sharding`])
//! - **Role**: Entity id to shard, shard to node, envelope to region.
//! - **Key items**: [`ShardResolver`](sharding::ShardResolver),
//!   [`LocalCoordinator`](sharding::LocalCoordinator),
//!   [`ShardRouter`](sharding::ShardRouter), [`RegionHandle`](sharding::RegionHandle).
//!
//! ### 3. Storage ([`persistence`])
//! - **Role**: The narrow event log interface entities write through.
//! - **Key items**: [`EventLog`](persistence::EventLog),
//!   [`InMemoryEventLog`](persistence::InMemoryEventLog).
//!
//! ### 4. The Orchestrator ([`lifecycle`])
//! - **Role**: Wires coordinator, transport and event log into running nodes.
//! - **Key items**: [`ClusterSharding`](lifecycle::ClusterSharding),
//!   [`LocalCluster`](lifecycle::LocalCluster).
//!
//! ### 5. The Interface ([`clients`])
//! - **Role**: Ask/tell on entity references and domain-specific clients on top.
//! - **Key items**: [`EntityRef`](clients::EntityRef),
//!   [`HelloWorldClient`](clients::HelloWorldClient).
//!
//! ### 6. The Implementation ([`hello_world`])
//! A sample entity that greets people and remembers who it greeted.
//!
//! ## 🚀 Quick Start
//!
//! ### Running the Demo
//!
//! ```bash
//! # Run with info logs
//! RUST_LOG=info cargo run
//! ```
//!
//! ### Running Tests
//!
//! ```bash
//! cargo test
//! ```

pub mod clients;
pub mod config;
pub mod framework;
pub mod hello_world;
pub mod lifecycle;
pub mod persistence;
pub mod scheduler;
pub mod sharding;
