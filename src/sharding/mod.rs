//! Placement and routing: which shard an entity belongs to, which node owns
//! that shard, and how an envelope gets there.
//!
//! - [`ShardResolver`] maps entity ids to shards.
//! - [`ShardCoordinator`] maps shards to nodes and drives handoff.
//! - [`ShardRouter`] delivers envelopes, retrying when its routing cache is stale.
//! - [`EntityRegion`](region) hosts the active entities of one kind on one node.

pub mod coordinator;
pub mod hash;
pub mod region;
pub mod resolver;
pub mod router;
pub mod transport;
pub mod types;

pub use coordinator::{
    Allocation, LocalCoordinator, MembershipOracle, ShardCoordinator, ShardEvent, ShardHost,
    StaticMembership,
};
pub use region::{HandoffReport, RegionControl, RegionHandle, RegionStats, Rejected};
pub use resolver::ShardResolver;
pub use router::ShardRouter;
pub use transport::{LocalTransport, RegionDirectory};
pub use types::{EntityId, EntityTypeKey, NodeId, ShardId};
