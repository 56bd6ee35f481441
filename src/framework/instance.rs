//! # Entity Instance
//!
//! The task that owns one active entity: its behavior, its folded state, its
//! last sequence number and its FIFO mailbox.
//!
//! # Lifecycle
//! ```text
//! Recovering ──> Ready <──> Persisting
//!                  │
//!                  └──> Passivating ──> Stopped
//! ```
//!
//! - **Recovering**: load the latest snapshot (if any), then replay every later
//!   event in ascending order. A read error, an undecodable event, or a gap in
//!   the sequence numbers ends the activation with an activation failure.
//! - **Ready**: take exactly one command from the mailbox and run the command
//!   handler against the current state.
//! - **Persisting**: append all events of the effect in one call, starting at
//!   `sequence_nr + 1`. Only after the append succeeded are the events folded
//!   and the post-commit actions (replies) run.
//!
//! Any persist failure discards the instance. The region starts a fresh one,
//! which recovers from the log, so no unconfirmed event ever lingers in memory.
//!
//! The instance does not need a lock for its state: the mailbox has a single
//! consumer and commands are handled one at a time, each to completion.
//!
//! The mailbox receiver sits behind an async mutex that the running instance
//! holds for its whole life. If the region has to abort the task, the lock is
//! released with it and the region drains whatever was still queued.

use crate::framework::effect::EffectParts;
use crate::framework::entity::{EntityContext, EventSourcedEntity};
use crate::framework::error::ShardingError;
use crate::framework::message::{EntityMessage, Envelope};
use crate::persistence::{EventLog, Snapshot, SnapshotPolicy, StoreError};
use crate::sharding::EntityId;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityPhase {
    Recovering,
    Ready,
    Persisting,
    Passivating,
    Stopped,
}

/// Why an instance exited.
#[derive(Debug, Clone)]
pub enum TerminationReason {
    Passivated,
    /// The behavior returned a stop effect.
    Stopped,
    ActivationFailed(ShardingError),
    PersistFailed(ShardingError),
    HandoffViolation(ShardingError),
}

pub(crate) type SharedMailbox<E> = Arc<Mutex<mpsc::UnboundedReceiver<EntityMessage<E>>>>;

/// Handed back to the region when the instance task ends.
pub struct Termination<E: EventSourcedEntity> {
    pub entity_id: EntityId,
    pub reason: TerminationReason,
    /// Commands that were queued but never handled, in arrival order.
    pub leftovers: Vec<Envelope<E>>,
}

pub(crate) struct EntityInstance<E: EventSourcedEntity> {
    context: EntityContext,
    behavior: E,
    event_log: Arc<dyn EventLog>,
    snapshot_policy: SnapshotPolicy,
    mailbox: SharedMailbox<E>,
    state: E::State,
    sequence_nr: u64,
    phase: EntityPhase,
}

impl<E: EventSourcedEntity> EntityInstance<E> {
    pub(crate) fn new(
        context: EntityContext,
        behavior: E,
        event_log: Arc<dyn EventLog>,
        default_snapshot_policy: SnapshotPolicy,
        mailbox: mpsc::UnboundedReceiver<EntityMessage<E>>,
    ) -> Self {
        let state = behavior.empty_state();
        let snapshot_policy = behavior
            .snapshot_policy()
            .unwrap_or(default_snapshot_policy);
        Self {
            context,
            behavior,
            event_log,
            snapshot_policy,
            mailbox: Arc::new(Mutex::new(mailbox)),
            state,
            sequence_nr: 0,
            phase: EntityPhase::Recovering,
        }
    }

    /// The receiving end of this instance's mailbox, for draining after an abort.
    pub(crate) fn mailbox(&self) -> SharedMailbox<E> {
        self.mailbox.clone()
    }

    /// Recovers, then handles commands until passivated, stopped or failed.
    pub(crate) async fn run(mut self) -> Termination<E> {
        let entity_type = self.context.type_name.clone();
        let entity_id = self.context.entity_id.clone();
        let mailbox = self.mailbox.clone();
        let mut mailbox = mailbox.lock_owned().await;

        if let Err(e) = self.recover().await {
            warn!(%entity_type, %entity_id, error = %e, "Activation failed");
            return self.terminate(TerminationReason::ActivationFailed(e), &mut mailbox);
        }
        self.phase = EntityPhase::Ready;
        self.behavior
            .on_recovery_completed(&self.state, self.sequence_nr);
        info!(
            %entity_type,
            %entity_id,
            shard_id = %self.context.shard_id,
            sequence_nr = self.sequence_nr,
            "Recovered"
        );

        let reason = loop {
            match mailbox.recv().await {
                Some(EntityMessage::Command(envelope)) => match self.handle(envelope).await {
                    Ok(false) => continue,
                    Ok(true) => break TerminationReason::Stopped,
                    Err(reason) => break reason,
                },
                Some(EntityMessage::Passivate) | None => break TerminationReason::Passivated,
            }
        };
        self.terminate(reason, &mut mailbox)
    }

    async fn recover(&mut self) -> Result<(), ShardingError> {
        let persistence_id = self.context.persistence_id.clone();
        let activation_failure = |reason: String| ShardingError::ActivationFailure {
            persistence_id: persistence_id.clone(),
            reason,
        };

        let snapshot = self
            .event_log
            .read_snapshot(&persistence_id)
            .await
            .map_err(|e| activation_failure(e.to_string()))?;
        if let Some(snapshot) = snapshot {
            self.state = serde_json::from_value(snapshot.state)
                .map_err(|e| activation_failure(format!("undecodable snapshot: {e}")))?;
            self.sequence_nr = snapshot.sequence_nr;
            debug!(%persistence_id, sequence_nr = self.sequence_nr, "Snapshot loaded");
        }

        let events = self
            .event_log
            .read_events(&persistence_id, self.sequence_nr + 1)
            .await
            .map_err(|e| activation_failure(e.to_string()))?;
        for stored in events {
            let expected = self.sequence_nr + 1;
            if stored.sequence_nr != expected {
                return Err(activation_failure(format!(
                    "gap in event stream: expected {expected}, found {}",
                    stored.sequence_nr
                )));
            }
            let event: E::Event = serde_json::from_value(stored.payload).map_err(|e| {
                activation_failure(format!("undecodable event {}: {e}", stored.sequence_nr))
            })?;
            self.apply(&event);
            self.sequence_nr = stored.sequence_nr;
        }

        let highest = self
            .event_log
            .highest_sequence_nr(&persistence_id)
            .await
            .map_err(|e| activation_failure(e.to_string()))?;
        if highest > self.sequence_nr {
            return Err(activation_failure(format!(
                "replay stopped at {} but the stream ends at {highest}",
                self.sequence_nr
            )));
        }
        Ok(())
    }

    /// Handles one command to completion. `Ok(true)` means the behavior asked to stop.
    async fn handle(&mut self, envelope: Envelope<E>) -> Result<bool, TerminationReason> {
        let entity_type = self.context.type_name.as_str();
        let entity_id = &self.context.entity_id;
        let Envelope { command, ask, .. } = envelope;
        debug!(entity_type, %entity_id, ?command, "Command");

        let EffectParts {
            events,
            actions,
            stop,
            unhandled,
        } = self.behavior.command_handler(&self.state, command).into_parts();
        if unhandled {
            warn!(entity_type, %entity_id, "Unhandled command");
        }

        if !events.is_empty() {
            self.phase = EntityPhase::Persisting;
            if let Err(reason) = self.persist(events).await {
                let failure = match &reason {
                    TerminationReason::PersistFailed(e) | TerminationReason::HandoffViolation(e) => {
                        Some(e.clone())
                    }
                    _ => None,
                };
                if let (Some(ask), Some(e)) = (ask, failure) {
                    ask.fail(e);
                }
                return Err(reason);
            }
            self.phase = EntityPhase::Ready;
        }

        for action in actions {
            action(&self.state);
        }
        if stop {
            self.phase = EntityPhase::Passivating;
        }
        Ok(stop)
    }

    async fn persist(&mut self, events: Vec<E::Event>) -> Result<(), TerminationReason> {
        let persistence_id = self.context.persistence_id.clone();
        let payloads = events
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                TerminationReason::PersistFailed(ShardingError::PersistFailure {
                    persistence_id: persistence_id.clone(),
                    reason: e.to_string(),
                })
            })?;

        let from_sequence_nr = self.sequence_nr + 1;
        match self
            .event_log
            .append(&persistence_id, from_sequence_nr, payloads)
            .await
        {
            Ok(()) => {}
            Err(e @ StoreError::SequenceConflict { .. }) => {
                error!(%persistence_id, from_sequence_nr, error = %e, "Another writer appended to this stream");
                return Err(TerminationReason::HandoffViolation(
                    ShardingError::HandoffViolation {
                        persistence_id: persistence_id.clone(),
                        reason: e.to_string(),
                    },
                ));
            }
            Err(e) => {
                warn!(%persistence_id, from_sequence_nr, error = %e, "Persist failed");
                return Err(TerminationReason::PersistFailed(
                    ShardingError::PersistFailure {
                        persistence_id: persistence_id.clone(),
                        reason: e.to_string(),
                    },
                ));
            }
        }

        let before = self.sequence_nr;
        for event in &events {
            self.apply(event);
        }
        self.sequence_nr += events.len() as u64;
        debug!(
            %persistence_id,
            sequence_nr = self.sequence_nr,
            count = events.len(),
            "Persisted"
        );

        if self.snapshot_policy.should_snapshot(before, self.sequence_nr) {
            self.save_snapshot().await;
        }
        Ok(())
    }

    async fn save_snapshot(&mut self) {
        let persistence_id = &self.context.persistence_id;
        let state = match serde_json::to_value(&self.state) {
            Ok(state) => state,
            Err(e) => {
                warn!(%persistence_id, error = %e, "Snapshot serialization failed");
                return;
            }
        };
        let snapshot = Snapshot {
            persistence_id: persistence_id.clone(),
            sequence_nr: self.sequence_nr,
            state,
            timestamp: Utc::now(),
        };
        // Snapshots are advisory: a failed write only means a longer replay.
        match self.event_log.write_snapshot(snapshot).await {
            Ok(()) => debug!(%persistence_id, sequence_nr = self.sequence_nr, "Snapshot saved"),
            Err(e) => warn!(%persistence_id, error = %e, "Snapshot write failed"),
        }
    }

    fn apply(&mut self, event: &E::Event) {
        let state = std::mem::replace(&mut self.state, self.behavior.empty_state());
        self.state = self.behavior.event_handler(state, event);
    }

    fn terminate(
        mut self,
        reason: TerminationReason,
        mailbox: &mut mpsc::UnboundedReceiver<EntityMessage<E>>,
    ) -> Termination<E> {
        self.phase = EntityPhase::Stopped;
        mailbox.close();
        let mut leftovers = Vec::new();
        while let Ok(message) = mailbox.try_recv() {
            if let EntityMessage::Command(envelope) = message {
                leftovers.push(envelope);
            }
        }
        debug!(
            entity_type = %self.context.type_name,
            entity_id = %self.context.entity_id,
            phase = ?self.phase,
            ?reason,
            leftovers = leftovers.len(),
            "Instance exited"
        );
        Termination {
            entity_id: self.context.entity_id,
            reason,
            leftovers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{AskHandle, PendingReplies, ReplyTo};
    use crate::hello_world::{Greeting, HelloWorld, HelloWorldCommand};
    use crate::persistence::{InMemoryEventLog, PersistenceId};
    use crate::sharding::{NodeId, ShardId};

    fn context(id: &str) -> EntityContext {
        let entity_id = EntityId::new(id);
        EntityContext {
            type_name: "HelloWorld".to_string(),
            persistence_id: PersistenceId::of("HelloWorld", entity_id.clone()),
            entity_id,
            shard_id: ShardId(0),
            node_id: NodeId::new("node-0"),
        }
    }

    fn greet(
        replies: &Arc<PendingReplies>,
        id: &str,
        whom: &str,
    ) -> (
        EntityMessage<HelloWorld>,
        tokio::sync::oneshot::Receiver<Result<crate::clients::reply::AnyReply, ShardingError>>,
    ) {
        let (correlation_id, response) = replies.register();
        let command = HelloWorldCommand::Greet {
            whom: whom.to_string(),
            reply_to: ReplyTo::new(correlation_id, replies.clone()),
        };
        let envelope = Envelope::ask(
            EntityId::new(id),
            command,
            AskHandle::new(correlation_id, replies.clone()),
        );
        (EntityMessage::Command(envelope), response)
    }

    #[tokio::test]
    async fn commands_are_persisted_then_replied() {
        let log = Arc::new(InMemoryEventLog::new());
        let replies = Arc::new(PendingReplies::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let instance = EntityInstance::new(
            context("w"),
            HelloWorld,
            log.clone(),
            SnapshotPolicy::Never,
            rx,
        );
        let task = tokio::spawn(instance.run());

        let (msg, response) = greet(&replies, "w", "Alice");
        assert!(tx.send(msg).is_ok());
        let greeting = response.await.unwrap().unwrap().downcast::<Greeting>().unwrap();
        assert_eq!(greeting.number_of_people, 1);

        assert!(tx.send(EntityMessage::Passivate).is_ok());
        let termination = task.await.unwrap();
        assert!(matches!(termination.reason, TerminationReason::Passivated));
        assert!(termination.leftovers.is_empty());
        assert_eq!(log.events(&context("w").persistence_id).len(), 1);
    }

    #[tokio::test]
    async fn gap_in_stream_fails_activation() {
        let log = Arc::new(InMemoryEventLog::new());
        let pid = context("w").persistence_id;
        log.append(&pid, 1, vec![
            serde_json::json!({"whom": "a"}),
            serde_json::json!({"whom": "b"}),
            serde_json::json!({"whom": "c"}),
        ])
        .await
        .unwrap();
        log.drop_event(&pid, 2);

        let replies = Arc::new(PendingReplies::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let (msg, _response) = greet(&replies, "w", "Alice");
        assert!(tx.send(msg).is_ok());
        let termination = EntityInstance::new(context("w"), HelloWorld, log, SnapshotPolicy::Never, rx)
            .run()
            .await;

        assert!(matches!(
            termination.reason,
            TerminationReason::ActivationFailed(ShardingError::ActivationFailure { .. })
        ));
        assert_eq!(termination.leftovers.len(), 1, "queued command is handed back");
    }

    #[tokio::test]
    async fn missing_first_event_is_detected() {
        let log = Arc::new(InMemoryEventLog::new());
        let pid = context("w").persistence_id;
        log.append(&pid, 1, vec![serde_json::json!({"whom": "a"})])
            .await
            .unwrap();
        log.append(&pid, 2, vec![serde_json::json!({"whom": "b"})])
            .await
            .unwrap();
        log.drop_event(&pid, 1);

        let (_tx, rx) = mpsc::unbounded_channel::<EntityMessage<HelloWorld>>();
        let termination = EntityInstance::new(context("w"), HelloWorld, log, SnapshotPolicy::Never, rx)
            .run()
            .await;
        assert!(matches!(
            termination.reason,
            TerminationReason::ActivationFailed(_)
        ));
    }
}
