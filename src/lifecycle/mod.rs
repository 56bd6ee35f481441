//! Runtime orchestration and lifecycle management.
//!
//! This module contains the infrastructure for running sharded entities:
//!
//! - **Per-node sharding**: registering entity kinds, handing out entity
//!   references and releasing shards on handoff
//! - **In-process clusters**: several nodes sharing a coordinator and an event log
//! - **Observability setup**: initializing tracing and logging
//!
//! # Main Components
//!
//! - [`ClusterSharding`] - The per-node entry point
//! - [`LocalCluster`] - Starts and stops a set of nodes in one process
//! - [`setup_tracing`] - Initializes the tracing/logging infrastructure

pub mod cluster;
pub mod cluster_sharding;
pub mod tracing;

pub use cluster::*;
pub use cluster_sharding::*;
pub use tracing::*;
