//! # Entity Region
//!
//! The per-node, per-entity-type actor that hosts the active entities of the
//! shards assigned to this node.
//!
//! # Architecture Note
//! The region is a single Tokio task that owns all of its bookkeeping (hosted
//! shards, active instances, buffered commands) and processes its requests one
//! at a time, like any other actor in this crate. Each active entity is a
//! separate task with its own FIFO mailbox (see
//! [`EntityInstance`](crate::framework::instance)), so entities run in parallel
//! while each one stays strictly sequential.
//!
//! ## Delivery
//! 1. The shard of the entity is resolved. A shard is hosted only after the
//!    coordinator confirmed that this node owns it; otherwise the envelope is
//!    handed back with [`ShardingError::NotOwner`] for the router to retry.
//! 2. An inactive entity is activated. Recovery runs inside the new task before
//!    its first command, and later commands simply queue behind it.
//! 3. Commands for an entity that is passivating are buffered in the region and
//!    sent to a fresh instance once the old one has exited.
//!
//! ## Passivation
//! Passivation is two-phase. The region stops forwarding and enqueues a
//! passivation signal behind every command already in the mailbox. The entity
//! finishes those commands and exits; only then is it evicted.
//!
//! ## Handoff
//! Releasing a shard stops every entity of the shard and awaits their tasks
//! before acknowledging. Commands left behind are routed to the new owner,
//! including those queued behind an entity that had to be aborted. Only the
//! command the aborted entity was handling has an unknown outcome.

use crate::config::ShardingSettings;
use crate::framework::instance::{EntityInstance, SharedMailbox};
use crate::framework::message::EntityMessage;
use crate::framework::{
    Entity, EntityContext, Envelope, EventSourcedEntity, ShardingError, Termination,
    TerminationReason,
};
use crate::persistence::{EventLog, PersistenceId};
use crate::scheduler::Scheduler;
use crate::sharding::coordinator::ShardCoordinator;
use crate::sharding::resolver::ShardResolver;
use crate::sharding::router::ShardRouter;
use crate::sharding::transport::RegionDirectory;
use crate::sharding::types::{EntityId, NodeId, ShardId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An envelope a region refused, with the reason. `envelope` is `None` when
/// the region already resolved the envelope's ask itself.
pub struct Rejected<E: EventSourcedEntity> {
    pub envelope: Option<Envelope<E>>,
    pub reason: ShardingError,
}

impl<E: EventSourcedEntity> fmt::Debug for Rejected<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("envelope", &self.envelope)
            .field("reason", &self.reason)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionStats {
    pub node_id: NodeId,
    pub hosted_shards: Vec<ShardId>,
    pub active_entities: usize,
    pub buffered_commands: usize,
}

/// Acknowledgement of a released shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffReport {
    pub shard_id: ShardId,
    pub node_id: NodeId,
    pub stopped_entities: usize,
    /// Entities that did not stop within the handoff timeout and were aborted.
    pub aborted_entities: usize,
    pub rerouted_commands: u64,
}

pub(crate) enum RegionRequest<E: EventSourcedEntity> {
    Deliver {
        envelope: Envelope<E>,
        respond_to: oneshot::Sender<Result<(), Rejected<E>>>,
    },
    Passivate {
        entity_id: EntityId,
    },
    PassivateIdle,
    ReleaseShard {
        shard_id: ShardId,
        respond_to: oneshot::Sender<HandoffReport>,
    },
    Stats {
        respond_to: oneshot::Sender<RegionStats>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable address of a region.
pub struct RegionHandle<E: EventSourcedEntity> {
    node_id: NodeId,
    sender: mpsc::Sender<RegionRequest<E>>,
}

impl<E: EventSourcedEntity> Clone for RegionHandle<E> {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<E: EventSourcedEntity> RegionHandle<E> {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Hands `envelope` to the region. `Ok` means the region accepted it, not
    /// that the command was processed.
    pub async fn deliver(&self, envelope: Envelope<E>) -> Result<(), Rejected<E>> {
        let entity_id = envelope.entity_id.clone();
        let (respond_to, response) = oneshot::channel();
        if let Err(SendError(request)) = self
            .sender
            .send(RegionRequest::Deliver {
                envelope,
                respond_to,
            })
            .await
        {
            let envelope = match request {
                RegionRequest::Deliver { envelope, .. } => Some(envelope),
                _ => None,
            };
            return Err(Rejected {
                envelope,
                reason: self.closed(),
            });
        }
        // The region took the envelope and stopped before answering; it may
        // or may not have reached the entity.
        response.await.unwrap_or_else(|_| {
            Err(Rejected {
                envelope: None,
                reason: ShardingError::DeliveryUncertain {
                    entity_id,
                    reason: format!("region on {} stopped during delivery", self.node_id),
                },
            })
        })
    }

    pub async fn passivate(&self, entity_id: EntityId) -> Result<(), ShardingError> {
        self.sender
            .send(RegionRequest::Passivate { entity_id })
            .await
            .map_err(|_| self.closed())
    }

    pub async fn release_shard(&self, shard_id: ShardId) -> Result<HandoffReport, ShardingError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(RegionRequest::ReleaseShard {
                shard_id,
                respond_to,
            })
            .await
            .map_err(|_| self.closed())?;
        response.await.map_err(|_| self.closed())
    }

    pub async fn stats(&self) -> Result<RegionStats, ShardingError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(RegionRequest::Stats { respond_to })
            .await
            .map_err(|_| self.closed())?;
        response.await.map_err(|_| self.closed())
    }

    /// Stops every entity and the region itself. Idempotent.
    pub async fn shutdown(&self) {
        let (respond_to, response) = oneshot::channel();
        if self
            .sender
            .send(RegionRequest::Shutdown { respond_to })
            .await
            .is_ok()
        {
            let _ = response.await;
        }
    }

    fn closed(&self) -> ShardingError {
        ShardingError::RegionClosed(self.node_id.clone())
    }
}

/// Type-erased control surface of a region, used for handoff and shutdown
/// across entity types.
#[async_trait]
pub trait RegionControl: Send + Sync {
    async fn release_shard(&self, shard_id: ShardId) -> Result<HandoffReport, ShardingError>;
    async fn stats(&self) -> Result<RegionStats, ShardingError>;
    async fn shutdown(&self);
}

#[async_trait]
impl<E: EventSourcedEntity> RegionControl for RegionHandle<E> {
    async fn release_shard(&self, shard_id: ShardId) -> Result<HandoffReport, ShardingError> {
        RegionHandle::release_shard(self, shard_id).await
    }

    async fn stats(&self) -> Result<RegionStats, ShardingError> {
        RegionHandle::stats(self).await
    }

    async fn shutdown(&self) {
        RegionHandle::shutdown(self).await
    }
}

/// Collaborators of a region.
pub(crate) struct RegionSetup<E: EventSourcedEntity> {
    pub node_id: NodeId,
    pub entity: Entity<E>,
    pub settings: ShardingSettings,
    pub coordinator: Arc<dyn ShardCoordinator>,
    pub event_log: Arc<dyn EventLog>,
    pub router: Arc<ShardRouter<E>>,
    pub directory: RegionDirectory<E>,
    pub scheduler: Scheduler,
    /// Cancelled when the owning node is dropped.
    pub stop: CancellationToken,
}

struct ActiveEntity<E: EventSourcedEntity> {
    shard_id: ShardId,
    incarnation: u64,
    mailbox: mpsc::UnboundedSender<EntityMessage<E>>,
    /// Receiving side, reachable once the task is aborted.
    inbox: SharedMailbox<E>,
    handle: JoinHandle<()>,
    last_active: Instant,
    passivating: bool,
}

struct Terminated<E: EventSourcedEntity> {
    incarnation: u64,
    termination: Termination<E>,
}

pub(crate) struct EntityRegion<E: EventSourcedEntity> {
    node_id: NodeId,
    type_name: String,
    entity: Entity<E>,
    settings: ShardingSettings,
    resolver: ShardResolver,
    coordinator: Arc<dyn ShardCoordinator>,
    event_log: Arc<dyn EventLog>,
    router: Arc<ShardRouter<E>>,
    directory: RegionDirectory<E>,
    scheduler: Scheduler,
    stop: CancellationToken,
    receiver: mpsc::Receiver<RegionRequest<E>>,
    requests: mpsc::WeakSender<RegionRequest<E>>,
    terminations_tx: mpsc::UnboundedSender<Terminated<E>>,
    terminations: mpsc::UnboundedReceiver<Terminated<E>>,
    hosted: HashSet<ShardId>,
    active: HashMap<EntityId, ActiveEntity<E>>,
    buffers: HashMap<EntityId, VecDeque<Envelope<E>>>,
    next_incarnation: u64,
    rerouted: u64,
    closing: bool,
}

impl<E: EventSourcedEntity> EntityRegion<E> {
    pub(crate) fn new(setup: RegionSetup<E>) -> (Self, RegionHandle<E>) {
        let (sender, receiver) = mpsc::channel(setup.settings.region_mailbox_capacity);
        let (terminations_tx, terminations) = mpsc::unbounded_channel();
        let handle = RegionHandle {
            node_id: setup.node_id.clone(),
            sender: sender.clone(),
        };
        let region = Self {
            type_name: setup.entity.type_key().name().to_string(),
            resolver: *setup.router.resolver(),
            node_id: setup.node_id,
            entity: setup.entity,
            settings: setup.settings,
            coordinator: setup.coordinator,
            event_log: setup.event_log,
            router: setup.router,
            directory: setup.directory,
            scheduler: setup.scheduler,
            stop: setup.stop,
            receiver,
            requests: sender.downgrade(),
            terminations_tx,
            terminations,
            hosted: HashSet::new(),
            active: HashMap::new(),
            buffers: HashMap::new(),
            next_incarnation: 0,
            rerouted: 0,
            closing: false,
        };
        (region, handle)
    }

    /// Runs the region until it is shut down or every handle is dropped.
    pub(crate) async fn run(mut self) {
        info!(entity_type = self.type_name.as_str(), node_id = %self.node_id, "Region started");

        let idle_timer = self.settings.passivate_idle_after.map(|_| {
            let requests = self.requests.clone();
            let interval = self.settings.idle_check_interval;
            self.scheduler
                .schedule_with_fixed_delay(interval, interval, move || {
                    let requests = requests.clone();
                    async move {
                        if let Some(requests) = requests.upgrade() {
                            if let Err(TrySendError::Full(_)) =
                                requests.try_send(RegionRequest::PassivateIdle)
                            {
                                debug!("Region busy, skipping idle check");
                            }
                        }
                    }
                })
        });

        let stop = self.stop.clone();
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!(entity_type = self.type_name.as_str(), node_id = %self.node_id, "Node dropped, stopping region");
                    self.stop_all().await;
                    break;
                }
                Some(terminated) = self.terminations.recv() => self.on_terminated(terminated),
                request = self.receiver.recv() => {
                    let Some(request) = request else {
                        self.stop_all().await;
                        break;
                    };
                    if !self.handle_request(request).await {
                        break;
                    }
                }
            }
        }

        if let Some(timer) = idle_timer {
            timer.cancel();
        }
        self.directory.unregister(&self.node_id);
        self.refuse_pending();
        info!(entity_type = self.type_name.as_str(), node_id = %self.node_id, "Region stopped");
    }

    /// Answers the requests still queued when the region stops. Deliveries
    /// go back to the router untouched.
    fn refuse_pending(&mut self) {
        self.receiver.close();
        while let Ok(request) = self.receiver.try_recv() {
            match request {
                RegionRequest::Deliver {
                    envelope,
                    respond_to,
                } => {
                    let _ = respond_to.send(Err(Rejected {
                        envelope: Some(envelope),
                        reason: ShardingError::RegionClosed(self.node_id.clone()),
                    }));
                }
                RegionRequest::ReleaseShard {
                    shard_id,
                    respond_to,
                } => {
                    let _ = respond_to.send(HandoffReport {
                        shard_id,
                        node_id: self.node_id.clone(),
                        stopped_entities: 0,
                        aborted_entities: 0,
                        rerouted_commands: 0,
                    });
                }
                RegionRequest::Stats { respond_to } => {
                    let _ = respond_to.send(self.stats());
                }
                RegionRequest::Shutdown { respond_to } => {
                    let _ = respond_to.send(());
                }
                RegionRequest::Passivate { .. } | RegionRequest::PassivateIdle => {}
            }
        }
    }

    async fn handle_request(&mut self, request: RegionRequest<E>) -> bool {
        match request {
            RegionRequest::Deliver {
                envelope,
                respond_to,
            } => {
                let shard_id = self.resolver.shard_id_for(&envelope.entity_id);
                match self.ensure_hosted(shard_id).await {
                    Ok(()) => {
                        self.dispatch(envelope);
                        let _ = respond_to.send(Ok(()));
                    }
                    Err(reason) => {
                        debug!(
                            entity_type = self.type_name.as_str(),
                            entity_id = %envelope.entity_id,
                            %shard_id,
                            error = %reason,
                            "Rejected"
                        );
                        let _ = respond_to.send(Err(Rejected {
                            envelope: Some(envelope),
                            reason,
                        }));
                    }
                }
            }
            RegionRequest::Passivate { entity_id } => {
                self.signal_passivate(&entity_id);
            }
            RegionRequest::PassivateIdle => self.passivate_idle(),
            RegionRequest::ReleaseShard {
                shard_id,
                respond_to,
            } => {
                let report = self.release_shard(shard_id).await;
                let _ = respond_to.send(report);
            }
            RegionRequest::Stats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }
            RegionRequest::Shutdown { respond_to } => {
                self.stop_all().await;
                let _ = respond_to.send(());
                return false;
            }
        }
        true
    }

    async fn ensure_hosted(&mut self, shard_id: ShardId) -> Result<(), ShardingError> {
        if self.hosted.contains(&shard_id) {
            return Ok(());
        }
        let owner = self.coordinator.shard_location(shard_id).await?;
        if owner != self.node_id {
            return Err(ShardingError::NotOwner {
                shard_id,
                node_id: self.node_id.clone(),
            });
        }
        self.hosted.insert(shard_id);
        info!(entity_type = self.type_name.as_str(), node_id = %self.node_id, %shard_id, "Hosting shard");
        Ok(())
    }

    fn dispatch(&mut self, envelope: Envelope<E>) {
        if self.closing {
            envelope.fail(ShardingError::DeliveryUncertain {
                entity_id: envelope.entity_id.clone(),
                reason: format!("region on {} is shutting down", self.node_id),
            });
            return;
        }
        let shard_id = self.resolver.shard_id_for(&envelope.entity_id);
        if !self.hosted.contains(&shard_id) {
            self.reroute(envelope);
            return;
        }

        let entity_id = envelope.entity_id.clone();
        let refused = match self.active.get_mut(&entity_id) {
            Some(entity) if entity.passivating => Some(envelope),
            Some(entity) => {
                entity.last_active = Instant::now();
                match entity.mailbox.send(EntityMessage::Command(envelope)) {
                    Ok(()) => None,
                    // The instance already exited; its termination is on the way.
                    Err(SendError(message)) => {
                        entity.passivating = true;
                        match message {
                            EntityMessage::Command(envelope) => Some(envelope),
                            EntityMessage::Passivate => None,
                        }
                    }
                }
            }
            None => {
                self.activate(entity_id, shard_id, envelope);
                None
            }
        };
        if let Some(envelope) = refused {
            self.buffer(envelope);
        }
    }

    fn activate(&mut self, entity_id: EntityId, shard_id: ShardId, first: Envelope<E>) {
        self.next_incarnation += 1;
        let incarnation = self.next_incarnation;
        let context = EntityContext {
            type_name: self.type_name.clone(),
            persistence_id: PersistenceId::of(self.type_name.clone(), entity_id.clone()),
            entity_id: entity_id.clone(),
            shard_id,
            node_id: self.node_id.clone(),
        };
        let behavior = self.entity.create(&context);

        let (mailbox, receiver) = mpsc::unbounded_channel();
        let _ = mailbox.send(EntityMessage::Command(first));
        let instance = EntityInstance::new(
            context,
            behavior,
            self.event_log.clone(),
            self.settings.snapshot_policy,
            receiver,
        );
        let inbox = instance.mailbox();
        let terminations = self.terminations_tx.clone();
        let handle = tokio::spawn(async move {
            let termination = instance.run().await;
            let _ = terminations.send(Terminated {
                incarnation,
                termination,
            });
        });

        debug!(entity_type = self.type_name.as_str(), %entity_id, %shard_id, incarnation, "Activating");
        self.active.insert(
            entity_id,
            ActiveEntity {
                shard_id,
                incarnation,
                mailbox,
                inbox,
                handle,
                last_active: Instant::now(),
                passivating: false,
            },
        );
    }

    fn buffer(&mut self, envelope: Envelope<E>) {
        let capacity = self.settings.entity_buffer_capacity;
        let buffer = self.buffers.entry(envelope.entity_id.clone()).or_default();
        if buffer.len() >= capacity {
            warn!(
                entity_type = self.type_name.as_str(),
                entity_id = %envelope.entity_id,
                capacity,
                "Buffer full, dropping command"
            );
            envelope.fail(ShardingError::DeliveryUncertain {
                entity_id: envelope.entity_id.clone(),
                reason: "entity buffer full".to_string(),
            });
            return;
        }
        buffer.push_back(envelope);
    }

    fn reroute(&mut self, envelope: Envelope<E>) {
        self.rerouted += 1;
        let router = self.router.clone();
        tokio::spawn(async move {
            let entity_id = envelope.entity_id.clone();
            if let Err(e) = router.route(envelope).await {
                debug!(%entity_id, error = %e, "Re-route failed");
            }
        });
    }

    fn signal_passivate(&mut self, entity_id: &EntityId) -> bool {
        match self.active.get_mut(entity_id) {
            Some(entity) if !entity.passivating => {
                entity.passivating = true;
                let _ = entity.mailbox.send(EntityMessage::Passivate);
                debug!(entity_type = self.type_name.as_str(), %entity_id, "Passivating");
                true
            }
            _ => false,
        }
    }

    fn passivate_idle(&mut self) {
        let Some(idle_after) = self.settings.passivate_idle_after else {
            return;
        };
        let now = Instant::now();
        let idle: Vec<EntityId> = self
            .active
            .iter()
            .filter(|(_, entity)| {
                !entity.passivating && now.duration_since(entity.last_active) >= idle_after
            })
            .map(|(entity_id, _)| entity_id.clone())
            .collect();
        for entity_id in idle {
            self.signal_passivate(&entity_id);
        }
    }

    fn on_terminated(&mut self, terminated: Terminated<E>) {
        let Terminated {
            incarnation,
            termination:
                Termination {
                    entity_id,
                    reason,
                    leftovers,
                },
        } = terminated;

        if self
            .active
            .get(&entity_id)
            .is_some_and(|entity| entity.incarnation == incarnation)
        {
            self.active.remove(&entity_id);
        }

        let entity_type = self.type_name.as_str();
        let leftovers = match reason {
            TerminationReason::Passivated => {
                info!(entity_type, %entity_id, "Passivated");
                leftovers
            }
            TerminationReason::Stopped => {
                info!(entity_type, %entity_id, "Stopped");
                leftovers
            }
            TerminationReason::PersistFailed(e) => {
                warn!(entity_type, %entity_id, error = %e, "Instance discarded after persist failure");
                leftovers
            }
            TerminationReason::ActivationFailed(e) | TerminationReason::HandoffViolation(e) => {
                for envelope in leftovers {
                    envelope.fail(e.clone());
                }
                Vec::new()
            }
        };

        let buffered = self.buffers.remove(&entity_id).unwrap_or_default();
        for envelope in leftovers.into_iter().chain(buffered) {
            self.dispatch(envelope);
        }
    }

    /// Signals every entity in `entity_ids` to passivate and waits for their
    /// tasks, aborting those still running at the handoff deadline. Commands
    /// queued behind an aborted entity never started and are dispatched again.
    async fn stop_entities(&mut self, entity_ids: Vec<EntityId>) -> (usize, usize) {
        for entity_id in &entity_ids {
            self.signal_passivate(entity_id);
        }

        let deadline = Instant::now() + self.settings.handoff_timeout;
        let (mut stopped, mut aborted) = (0, 0);
        let mut stranded = Vec::new();
        for entity_id in entity_ids {
            let Some(mut entity) = self.active.remove(&entity_id) else {
                continue;
            };
            match tokio::time::timeout_at(deadline, &mut entity.handle).await {
                Ok(_) => stopped += 1,
                Err(_) => {
                    warn!(
                        entity_type = self.type_name.as_str(),
                        %entity_id,
                        "Entity did not stop in time, aborting"
                    );
                    entity.handle.abort();
                    let _ = (&mut entity.handle).await;
                    aborted += 1;
                    if let Ok(mut inbox) = entity.inbox.try_lock() {
                        inbox.close();
                        while let Ok(message) = inbox.try_recv() {
                            if let EntityMessage::Command(envelope) = message {
                                stranded.push(envelope);
                            }
                        }
                    }
                }
            }
        }

        while let Ok(terminated) = self.terminations.try_recv() {
            self.on_terminated(terminated);
        }
        if !stranded.is_empty() {
            debug!(
                entity_type = self.type_name.as_str(),
                count = stranded.len(),
                "Dispatching commands queued behind aborted entities"
            );
        }
        for envelope in stranded {
            self.dispatch(envelope);
        }
        (stopped, aborted)
    }

    async fn release_shard(&mut self, shard_id: ShardId) -> HandoffReport {
        let rerouted_before = self.rerouted;
        self.hosted.remove(&shard_id);

        let entity_ids: Vec<EntityId> = self
            .active
            .iter()
            .filter(|(_, entity)| entity.shard_id == shard_id)
            .map(|(entity_id, _)| entity_id.clone())
            .collect();
        let (stopped_entities, aborted_entities) = self.stop_entities(entity_ids).await;

        let orphaned: Vec<EntityId> = self
            .buffers
            .keys()
            .filter(|entity_id| {
                self.resolver.shard_id_for(entity_id) == shard_id
                    && !self.active.contains_key(*entity_id)
            })
            .cloned()
            .collect();
        for entity_id in orphaned {
            for envelope in self.buffers.remove(&entity_id).unwrap_or_default() {
                self.reroute(envelope);
            }
        }

        let report = HandoffReport {
            shard_id,
            node_id: self.node_id.clone(),
            stopped_entities,
            aborted_entities,
            rerouted_commands: self.rerouted - rerouted_before,
        };
        info!(
            entity_type = self.type_name.as_str(),
            node_id = %self.node_id,
            %shard_id,
            stopped = report.stopped_entities,
            aborted = report.aborted_entities,
            rerouted = report.rerouted_commands,
            "Shard released"
        );
        report
    }

    async fn stop_all(&mut self) {
        self.closing = true;
        self.hosted.clear();
        let entity_ids: Vec<EntityId> = self.active.keys().cloned().collect();
        let (stopped, aborted) = self.stop_entities(entity_ids).await;

        for (entity_id, buffer) in self.buffers.drain() {
            for envelope in buffer {
                envelope.fail(ShardingError::DeliveryUncertain {
                    entity_id: entity_id.clone(),
                    reason: format!("region on {} stopped", self.node_id),
                });
            }
        }
        debug!(entity_type = self.type_name.as_str(), stopped, aborted, "All entities stopped");
    }

    fn stats(&self) -> RegionStats {
        let mut hosted_shards: Vec<ShardId> = self.hosted.iter().copied().collect();
        hosted_shards.sort();
        RegionStats {
            node_id: self.node_id.clone(),
            hosted_shards,
            active_entities: self.active.len(),
            buffered_commands: self.buffers.values().map(VecDeque::len).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::reply::AnyReply;
    use crate::clients::{AskHandle, PendingReplies, ReplyTo};
    use crate::config::RetrySettings;
    use crate::hello_world::{HelloWorld, HelloWorldCommand};
    use crate::sharding::coordinator::{LocalCoordinator, StaticMembership};

    /// A region that takes one delivery and stops without answering it.
    fn vanishing_region(node_id: &NodeId) -> RegionHandle<HelloWorld> {
        let (sender, mut receiver) = mpsc::channel(1);
        tokio::spawn(async move {
            let _taken = receiver.recv().await;
        });
        RegionHandle {
            node_id: node_id.clone(),
            sender,
        }
    }

    fn greet(
        replies: &Arc<PendingReplies>,
        whom: &str,
    ) -> (
        Envelope<HelloWorld>,
        oneshot::Receiver<Result<AnyReply, ShardingError>>,
    ) {
        let (correlation_id, response) = replies.register();
        let command = HelloWorldCommand::Greet {
            whom: whom.to_string(),
            reply_to: ReplyTo::new(correlation_id, replies.clone()),
        };
        let envelope = Envelope::ask(
            EntityId::new("world-1"),
            command,
            AskHandle::new(correlation_id, replies.clone()),
        );
        (envelope, response)
    }

    #[tokio::test]
    async fn stopping_mid_delivery_is_uncertain() {
        let node_id = NodeId::new("node-0");
        let region = vanishing_region(&node_id);
        let replies = Arc::new(PendingReplies::new());
        let (envelope, _response) = greet(&replies, "Alice");

        let rejected = region.deliver(envelope).await.unwrap_err();
        assert!(rejected.envelope.is_none());
        assert!(matches!(
            rejected.reason,
            ShardingError::DeliveryUncertain { .. }
        ));
    }

    #[tokio::test]
    async fn router_fails_the_ask_when_a_region_vanishes() {
        let node_id = NodeId::new("node-0");
        let membership = Arc::new(StaticMembership::new(vec![node_id.clone()]));
        let coordinator: Arc<dyn ShardCoordinator> = Arc::new(LocalCoordinator::new(membership));
        let directory = RegionDirectory::default();
        directory.register(node_id.clone(), vanishing_region(&node_id));
        let router = ShardRouter::new(
            "HelloWorld",
            ShardResolver::new(10).unwrap(),
            coordinator,
            directory,
            Scheduler::new(),
            RetrySettings::default(),
        );

        let replies = Arc::new(PendingReplies::new());
        let (envelope, response) = greet(&replies, "Alice");
        let error = router.route(envelope).await.unwrap_err();
        assert!(matches!(error, ShardingError::DeliveryUncertain { .. }), "{error}");
        assert!(matches!(
            response.await.unwrap(),
            Err(ShardingError::DeliveryUncertain { .. })
        ));
        assert_eq!(replies.pending_count(), 0);
    }
}
