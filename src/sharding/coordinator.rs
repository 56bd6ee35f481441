//! # Shard Coordinator
//!
//! Decides which node hosts each shard and drives ownership handoff.
//!
//! # Architecture Note
//! Regions consume the coordinator through the [`ShardCoordinator`] trait only.
//! Membership is consumed the same way, through a read-only
//! [`MembershipOracle`], so neither is ever a global singleton and both can be
//! replaced in tests.
//!
//! [`LocalCoordinator`] is the in-process implementation. It allocates shards
//! with rendezvous hashing over the current members, and moves a shard in
//! three steps:
//!
//! 1. mark the shard as handing off, so every location lookup fails with a
//!    retryable [`ShardingError::HandoffInProgress`];
//! 2. await the old owner's [`ShardHost::release_shard`], which returns only
//!    after every entity of the shard on that node has stopped. When the old
//!    owner was dropped, await its [`ShardHost::stopped`] token instead, which
//!    fires once its regions have stopped their entities and exited;
//! 3. record the new owner.
//!
//! The new owner can therefore only activate an entity of the shard after the
//! old instance is gone. Two writers for one stream cannot coexist.

use crate::framework::ShardingError;
use crate::sharding::hash::hash64;
use crate::sharding::types::{NodeId, ShardId};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Location oracle for shards.
#[async_trait]
pub trait ShardCoordinator: Send + Sync + 'static {
    /// Node currently owning `shard_id`. The answer may be stale by the time
    /// the caller acts on it.
    async fn shard_location(&self, shard_id: ShardId) -> Result<NodeId, ShardingError>;

    /// Registers a node that takes part in handoffs.
    fn register_host(&self, _host: Weak<dyn ShardHost>) {}
}

/// A node that can give up a shard.
#[async_trait]
pub trait ShardHost: Send + Sync {
    fn node_id(&self) -> &NodeId;

    /// Stops every entity of `shard_id` on this node. Must not return before
    /// all of them have stopped.
    async fn release_shard(&self, shard_id: ShardId) -> Result<(), ShardingError>;

    /// Cancelled once every region of this node has stopped. Outlives the
    /// host itself.
    fn stopped(&self) -> CancellationToken;
}

/// Read-only view of cluster membership.
pub trait MembershipOracle: Send + Sync + 'static {
    fn members(&self) -> Vec<NodeId>;
}

/// Membership list set by hand.
#[derive(Debug, Default)]
pub struct StaticMembership {
    members: RwLock<Vec<NodeId>>,
}

impl StaticMembership {
    pub fn new(members: Vec<NodeId>) -> Self {
        Self {
            members: RwLock::new(members),
        }
    }

    pub fn add(&self, node_id: NodeId) {
        let mut members = self.members.write();
        if !members.contains(&node_id) {
            members.push(node_id);
        }
    }

    pub fn remove(&self, node_id: &NodeId) {
        self.members.write().retain(|member| member != node_id);
    }
}

impl MembershipOracle for StaticMembership {
    fn members(&self) -> Vec<NodeId> {
        self.members.read().clone()
    }
}

/// Handoff notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardEvent {
    Allocated { shard_id: ShardId, node_id: NodeId },
    HandoffStarted { shard_id: ShardId, from: NodeId, to: NodeId },
    HandoffCompleted { shard_id: ShardId, from: NodeId, to: NodeId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation {
    Allocated(NodeId),
    HandingOff { from: NodeId, to: NodeId },
}

struct RegisteredHost {
    host: Weak<dyn ShardHost>,
    stopped: CancellationToken,
}

pub struct LocalCoordinator {
    membership: Arc<dyn MembershipOracle>,
    allocations: Mutex<HashMap<ShardId, Allocation>>,
    hosts: RwLock<HashMap<NodeId, RegisteredHost>>,
    handoffs: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ShardEvent>,
}

impl LocalCoordinator {
    pub fn new(membership: Arc<dyn MembershipOracle>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            membership,
            allocations: Mutex::new(HashMap::new()),
            hosts: RwLock::new(HashMap::new()),
            handoffs: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShardEvent> {
        self.events.subscribe()
    }

    pub fn allocation(&self, shard_id: ShardId) -> Option<Allocation> {
        self.allocations.lock().get(&shard_id).cloned()
    }

    /// Highest-random-weight owner of `shard_id` among the current members.
    pub fn rendezvous_owner(&self, shard_id: ShardId) -> Option<NodeId> {
        self.membership.members().into_iter().max_by(|a, b| {
            let score_a = hash64(format!("{a}/{}", shard_id.0).as_bytes());
            let score_b = hash64(format!("{b}/{}", shard_id.0).as_bytes());
            score_a.cmp(&score_b).then_with(|| a.cmp(b))
        })
    }

    /// Moves `shard_id` to `to`, awaiting the old owner's release first.
    pub async fn handoff(&self, shard_id: ShardId, to: NodeId) -> Result<(), ShardingError> {
        let _serialized = self.handoffs.lock().await;

        let from = {
            let mut allocations = self.allocations.lock();
            match allocations.get(&shard_id).cloned() {
                Some(Allocation::Allocated(from)) if from == to => return Ok(()),
                Some(Allocation::Allocated(from)) => {
                    allocations.insert(
                        shard_id,
                        Allocation::HandingOff {
                            from: from.clone(),
                            to: to.clone(),
                        },
                    );
                    from
                }
                Some(Allocation::HandingOff { .. }) => {
                    return Err(ShardingError::HandoffInProgress(shard_id));
                }
                None => {
                    allocations.insert(shard_id, Allocation::Allocated(to.clone()));
                    let _ = self.events.send(ShardEvent::Allocated {
                        shard_id,
                        node_id: to,
                    });
                    return Ok(());
                }
            }
        };

        info!(%shard_id, %from, %to, "Handoff started");
        let _ = self.events.send(ShardEvent::HandoffStarted {
            shard_id,
            from: from.clone(),
            to: to.clone(),
        });

        let released = self.release(shard_id, &from).await;

        let mut allocations = self.allocations.lock();
        match released {
            Ok(()) => {
                allocations.insert(shard_id, Allocation::Allocated(to.clone()));
                info!(%shard_id, %from, %to, "Handoff completed");
                let _ = self
                    .events
                    .send(ShardEvent::HandoffCompleted { shard_id, from, to });
                Ok(())
            }
            Err(e) => {
                warn!(%shard_id, %from, %to, error = %e, "Handoff aborted");
                allocations.insert(shard_id, Allocation::Allocated(from));
                Err(e)
            }
        }
    }

    async fn release(&self, shard_id: ShardId, from: &NodeId) -> Result<(), ShardingError> {
        let (host, stopped) = match self.hosts.read().get(from) {
            Some(registered) => (registered.host.upgrade(), registered.stopped.clone()),
            // Never registered, so it never hosted an entity.
            None => return Ok(()),
        };
        match host {
            Some(host) => host.release_shard(shard_id).await,
            None => {
                info!(%shard_id, %from, "Old owner dropped, waiting for its regions to stop");
                stopped.cancelled().await;
                Ok(())
            }
        }
    }

    /// Hands off every allocated shard whose rendezvous owner changed. Returns
    /// the number of shards moved.
    pub async fn rebalance(&self) -> Result<usize, ShardingError> {
        let allocated: Vec<(ShardId, NodeId)> = self
            .allocations
            .lock()
            .iter()
            .filter_map(|(shard_id, allocation)| match allocation {
                Allocation::Allocated(node_id) => Some((*shard_id, node_id.clone())),
                Allocation::HandingOff { .. } => None,
            })
            .collect();

        let mut moved = 0;
        for (shard_id, current) in allocated {
            if let Some(owner) = self.rendezvous_owner(shard_id) {
                if owner != current {
                    self.handoff(shard_id, owner).await?;
                    moved += 1;
                }
            }
        }
        info!(moved, "Rebalance finished");
        Ok(moved)
    }
}

#[async_trait]
impl ShardCoordinator for LocalCoordinator {
    async fn shard_location(&self, shard_id: ShardId) -> Result<NodeId, ShardingError> {
        let mut allocations = self.allocations.lock();
        match allocations.get(&shard_id) {
            Some(Allocation::Allocated(node_id)) => Ok(node_id.clone()),
            Some(Allocation::HandingOff { .. }) => Err(ShardingError::HandoffInProgress(shard_id)),
            None => {
                let node_id = self.rendezvous_owner(shard_id).ok_or_else(|| {
                    ShardingError::Coordinator("no members to allocate shards to".to_string())
                })?;
                allocations.insert(shard_id, Allocation::Allocated(node_id.clone()));
                let _ = self.events.send(ShardEvent::Allocated {
                    shard_id,
                    node_id: node_id.clone(),
                });
                Ok(node_id)
            }
        }
    }

    fn register_host(&self, host: Weak<dyn ShardHost>) {
        if let Some(strong) = host.upgrade() {
            let registered = RegisteredHost {
                stopped: strong.stopped(),
                host,
            };
            self.hosts.write().insert(strong.node_id().clone(), registered);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn nodes(n: usize) -> Vec<NodeId> {
        (0..n).map(|i| NodeId::new(format!("node-{i}"))).collect()
    }

    struct RecordingHost {
        node_id: NodeId,
        released: AtomicUsize,
        delay: Duration,
        stopped: CancellationToken,
    }

    impl RecordingHost {
        fn new(node_id: NodeId, delay: Duration) -> Self {
            Self {
                node_id,
                released: AtomicUsize::new(0),
                delay,
                stopped: CancellationToken::new(),
            }
        }
    }

    #[async_trait]
    impl ShardHost for RecordingHost {
        fn node_id(&self) -> &NodeId {
            &self.node_id
        }

        async fn release_shard(&self, _shard_id: ShardId) -> Result<(), ShardingError> {
            tokio::time::sleep(self.delay).await;
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stopped(&self) -> CancellationToken {
            self.stopped.clone()
        }
    }

    #[tokio::test]
    async fn allocation_is_stable_and_spread() {
        let coordinator = LocalCoordinator::new(Arc::new(StaticMembership::new(nodes(3))));
        let mut per_node: HashMap<NodeId, usize> = HashMap::new();
        for shard in 0..300 {
            let first = coordinator.shard_location(ShardId(shard)).await.unwrap();
            let again = coordinator.shard_location(ShardId(shard)).await.unwrap();
            assert_eq!(first, again);
            *per_node.entry(first).or_default() += 1;
        }
        assert_eq!(per_node.len(), 3);
        assert!(per_node.values().all(|&count| count > 50), "{per_node:?}");
    }

    #[tokio::test]
    async fn no_members_is_an_error() {
        let coordinator = LocalCoordinator::new(Arc::new(StaticMembership::default()));
        assert!(matches!(
            coordinator.shard_location(ShardId(1)).await,
            Err(ShardingError::Coordinator(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn lookups_fail_while_handing_off() {
        let membership = Arc::new(StaticMembership::new(nodes(2)));
        let coordinator = Arc::new(LocalCoordinator::new(membership));
        let shard = ShardId(7);
        let from = coordinator.shard_location(shard).await.unwrap();
        let to = nodes(2).into_iter().find(|n| *n != from).unwrap();

        let host: Arc<dyn ShardHost> =
            Arc::new(RecordingHost::new(from.clone(), Duration::from_millis(100)));
        coordinator.register_host(Arc::downgrade(&host));
        let mut events = coordinator.subscribe();

        let handoff = {
            let coordinator = coordinator.clone();
            let to = to.clone();
            tokio::spawn(async move { coordinator.handoff(shard, to).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            coordinator.shard_location(shard).await,
            Err(ShardingError::HandoffInProgress(_))
        ));

        handoff.await.unwrap().unwrap();
        assert_eq!(coordinator.shard_location(shard).await.unwrap(), to);
        assert!(matches!(
            events.recv().await.unwrap(),
            ShardEvent::HandoffStarted { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ShardEvent::HandoffCompleted { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_host_is_waited_for() {
        let membership = Arc::new(StaticMembership::new(nodes(2)));
        let coordinator = Arc::new(LocalCoordinator::new(membership));
        let shard = ShardId(3);
        let from = coordinator.shard_location(shard).await.unwrap();
        let to = nodes(2).into_iter().find(|n| *n != from).unwrap();

        let host = Arc::new(RecordingHost::new(from.clone(), Duration::ZERO));
        let stopped = host.stopped.clone();
        let weak = Arc::downgrade(&host);
        let weak: Weak<dyn ShardHost> = weak;
        coordinator.register_host(weak);
        drop(host);

        let handoff = {
            let coordinator = coordinator.clone();
            let to = to.clone();
            tokio::spawn(async move { coordinator.handoff(shard, to).await })
        };
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!handoff.is_finished());
        assert_eq!(
            coordinator.allocation(shard),
            Some(Allocation::HandingOff {
                from: from.clone(),
                to: to.clone()
            })
        );

        stopped.cancel();
        handoff.await.unwrap().unwrap();
        assert_eq!(coordinator.shard_location(shard).await.unwrap(), to);
    }

    #[tokio::test]
    async fn rebalance_follows_membership() {
        let membership = Arc::new(StaticMembership::new(nodes(2)));
        let coordinator = LocalCoordinator::new(membership.clone());
        for shard in 0..50 {
            coordinator.shard_location(ShardId(shard)).await.unwrap();
        }

        membership.add(NodeId::new("node-2"));
        let moved = coordinator.rebalance().await.unwrap();
        assert!(moved > 0);
        for shard in 0..50 {
            let shard = ShardId(shard);
            assert_eq!(
                coordinator.allocation(shard),
                coordinator.rendezvous_owner(shard).map(Allocation::Allocated)
            );
        }
        assert_eq!(coordinator.rebalance().await.unwrap(), 0);
    }
}
