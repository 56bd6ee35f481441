//! # Cluster Sharding
//!
//! The per-node entry point: registers entity kinds, hands out entity
//! references, and takes part in shard handoff.
//!
//! Dropping the last reference to a node stops its regions in the background.
//! The coordinator keeps the node's `stopped` token and waits on it before
//! giving the node's shards to anyone else.
//!
//! # Example
//!
//! ```ignore
//! let sharding = ClusterSharding::new(node_id, settings, coordinator, event_log, transport)?;
//! sharding.init(HelloWorld::entity())?;
//!
//! let world = sharding.entity_ref_for(&HelloWorld::type_key(), "world-1")?;
//! let greeting = world
//!     .ask(|reply_to| HelloWorldCommand::Greet { whom: "Alice".into(), reply_to }, timeout)
//!     .await?;
//!
//! sharding.shutdown().await;
//! ```

use crate::clients::{EntityRef, PendingReplies};
use crate::config::ShardingSettings;
use crate::framework::{Entity, EventSourcedEntity, ShardingError};
use crate::persistence::EventLog;
use crate::scheduler::Scheduler;
use crate::sharding::coordinator::{ShardCoordinator, ShardHost};
use crate::sharding::region::{EntityRegion, RegionControl, RegionHandle, RegionSetup};
use crate::sharding::router::ShardRouter;
use crate::sharding::transport::LocalTransport;
use crate::sharding::{EntityId, EntityTypeKey, NodeId, ShardId, ShardResolver};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

struct TypedRegion<E: EventSourcedEntity> {
    handle: RegionHandle<E>,
    router: Arc<ShardRouter<E>>,
}

struct RegisteredRegion {
    control: Arc<dyn RegionControl>,
    typed: Box<dyn Any + Send + Sync>,
    task: Mutex<Option<JoinHandle<()>>>,
}

pub struct ClusterSharding {
    node_id: NodeId,
    settings: ShardingSettings,
    resolver: ShardResolver,
    coordinator: Arc<dyn ShardCoordinator>,
    event_log: Arc<dyn EventLog>,
    transport: Arc<LocalTransport>,
    scheduler: Scheduler,
    replies: Arc<PendingReplies>,
    regions: DashMap<String, RegisteredRegion>,
    /// Tells the regions to stop when the node is dropped.
    stopping: CancellationToken,
    stopped: CancellationToken,
}

impl ClusterSharding {
    /// Creates the sharding extension of one node and registers it with the
    /// coordinator as a handoff participant.
    pub fn new(
        node_id: NodeId,
        settings: ShardingSettings,
        coordinator: Arc<dyn ShardCoordinator>,
        event_log: Arc<dyn EventLog>,
        transport: Arc<LocalTransport>,
    ) -> Result<Arc<Self>, ShardingError> {
        settings.validate()?;
        let resolver = ShardResolver::new(settings.number_of_shards)?;
        let sharding = Arc::new(Self {
            node_id,
            settings,
            resolver,
            coordinator,
            event_log,
            transport,
            scheduler: Scheduler::new(),
            replies: Arc::new(PendingReplies::new()),
            regions: DashMap::new(),
            stopping: CancellationToken::new(),
            stopped: CancellationToken::new(),
        });
        let weak = Arc::downgrade(&sharding);
        let host: Weak<dyn ShardHost> = weak;
        sharding.coordinator.register_host(host);
        Ok(sharding)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn settings(&self) -> &ShardingSettings {
        &self.settings
    }

    pub fn shard_id_for(&self, entity_id: &EntityId) -> ShardId {
        self.resolver.shard_id_for(entity_id)
    }

    /// Number of asks started on this node that are still waiting for a reply.
    pub fn pending_asks(&self) -> usize {
        self.replies.pending_count()
    }

    /// Registers an entity kind and starts its region on this node.
    pub fn init<E: EventSourcedEntity>(
        &self,
        entity: Entity<E>,
    ) -> Result<RegionHandle<E>, ShardingError> {
        let type_name = entity.type_key().name().to_string();
        let Entry::Vacant(slot) = self.regions.entry(type_name.clone()) else {
            return Err(ShardingError::AlreadyRegistered(type_name));
        };

        let directory = self.transport.directory::<E>(&type_name)?;
        let router = Arc::new(ShardRouter::new(
            type_name.clone(),
            self.resolver,
            self.coordinator.clone(),
            directory.clone(),
            self.scheduler.clone(),
            self.settings.routing_retry.clone(),
        ));
        let (region, handle) = EntityRegion::new(RegionSetup {
            node_id: self.node_id.clone(),
            entity,
            settings: self.settings.clone(),
            coordinator: self.coordinator.clone(),
            event_log: self.event_log.clone(),
            router: router.clone(),
            directory: directory.clone(),
            scheduler: self.scheduler.clone(),
            stop: self.stopping.clone(),
        });
        directory.register(self.node_id.clone(), handle.clone());
        let task = tokio::spawn(region.run());

        slot.insert(RegisteredRegion {
            control: Arc::new(handle.clone()),
            typed: Box::new(TypedRegion {
                handle: handle.clone(),
                router,
            }),
            task: Mutex::new(Some(task)),
        });
        info!(entity_type = type_name.as_str(), node_id = %self.node_id, "Entity type registered");
        Ok(handle)
    }

    /// Location-transparent reference to `entity_id` of the given kind.
    pub fn entity_ref_for<E: EventSourcedEntity>(
        &self,
        type_key: &EntityTypeKey<E>,
        entity_id: impl Into<EntityId>,
    ) -> Result<EntityRef<E>, ShardingError> {
        let router = self.with_typed(type_key, |typed| typed.router.clone())?;
        Ok(EntityRef::new(
            entity_id.into(),
            router,
            self.replies.clone(),
        ))
    }

    /// This node's region for the given kind.
    pub fn region<E: EventSourcedEntity>(
        &self,
        type_key: &EntityTypeKey<E>,
    ) -> Result<RegionHandle<E>, ShardingError> {
        self.with_typed(type_key, |typed| typed.handle.clone())
    }

    fn with_typed<E: EventSourcedEntity, T>(
        &self,
        type_key: &EntityTypeKey<E>,
        f: impl FnOnce(&TypedRegion<E>) -> T,
    ) -> Result<T, ShardingError> {
        let not_registered = || ShardingError::NotRegistered(type_key.name().to_string());
        let registered = self.regions.get(type_key.name()).ok_or_else(not_registered)?;
        let typed = registered
            .typed
            .downcast_ref::<TypedRegion<E>>()
            .ok_or_else(not_registered)?;
        Ok(f(typed))
    }

    fn controls(&self) -> Vec<Arc<dyn RegionControl>> {
        self.regions
            .iter()
            .map(|registered| registered.control.clone())
            .collect()
    }

    /// Stops every region of this node and the node's timers.
    pub async fn shutdown(&self) {
        info!(node_id = %self.node_id, "Shutting down sharding...");
        let names: Vec<String> = self.regions.iter().map(|r| r.key().clone()).collect();
        for name in names {
            let Some((_, registered)) = self.regions.remove(&name) else {
                continue;
            };
            registered.control.shutdown().await;
            let task = registered.task.lock().take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    error!(entity_type = name.as_str(), error = %e, "Region task failed");
                }
            }
        }
        self.scheduler.shutdown();
        self.stopped.cancel();
        info!(node_id = %self.node_id, "Sharding shutdown complete.");
    }
}

impl Drop for ClusterSharding {
    fn drop(&mut self) {
        if self.stopped.is_cancelled() {
            return;
        }
        self.stopping.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .regions
            .iter()
            .filter_map(|registered| registered.task.lock().take())
            .collect();
        let stopped = self.stopped.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) if !tasks.is_empty() => {
                info!(node_id = %self.node_id, "Node dropped, stopping its regions");
                runtime.spawn(async move {
                    for task in tasks {
                        let _ = task.await;
                    }
                    stopped.cancel();
                });
            }
            // Without a runtime the region tasks are gone already.
            _ => stopped.cancel(),
        }
    }
}

#[async_trait]
impl ShardHost for ClusterSharding {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn release_shard(&self, shard_id: ShardId) -> Result<(), ShardingError> {
        for control in self.controls() {
            match control.release_shard(shard_id).await {
                Ok(_) => {}
                // A region that already stopped hosts nothing.
                Err(ShardingError::RegionClosed(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn stopped(&self) -> CancellationToken {
        self.stopped.clone()
    }
}
