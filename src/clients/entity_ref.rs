//! # EntityRef
//!
//! Location-transparent handle to one entity. Callers never learn which node
//! hosts the entity; every message goes through the [`ShardRouter`], which
//! resolves the shard and follows it when it moves.
//!
//! An `EntityRef` owns nothing. It is cheap to clone and any number of tasks
//! may use clones of it concurrently.

use crate::clients::reply::{AskHandle, PendingReplies, ReplyTo};
use crate::framework::{Envelope, EventSourcedEntity, ShardingError};
use crate::sharding::router::ShardRouter;
use crate::sharding::EntityId;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub struct EntityRef<E: EventSourcedEntity> {
    entity_id: EntityId,
    router: Arc<ShardRouter<E>>,
    replies: Arc<PendingReplies>,
}

impl<E: EventSourcedEntity> Clone for EntityRef<E> {
    fn clone(&self) -> Self {
        Self {
            entity_id: self.entity_id.clone(),
            router: self.router.clone(),
            replies: self.replies.clone(),
        }
    }
}

impl<E: EventSourcedEntity> fmt::Debug for EntityRef<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRef")
            .field("entity_id", &self.entity_id)
            .finish()
    }
}

impl<E: EventSourcedEntity> EntityRef<E> {
    pub(crate) fn new(
        entity_id: EntityId,
        router: Arc<ShardRouter<E>>,
        replies: Arc<PendingReplies>,
    ) -> Self {
        Self {
            entity_id,
            router,
            replies,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Sends the command built by `build` and waits for its reply.
    ///
    /// The command is routed on its own task, so routing keeps going when the
    /// caller stops waiting. The result is exactly one of: the reply,
    /// [`ShardingError::AskTimeout`], or the failure that resolved the ask
    /// (delivery uncertain, activation, persist or handoff failure). A timeout
    /// only ends the wait; the command may still be processed and its reply is
    /// then dropped.
    pub async fn ask<R, F>(&self, build: F, timeout: Duration) -> Result<R, ShardingError>
    where
        R: Send + 'static,
        F: FnOnce(ReplyTo<R>) -> E::Command,
    {
        let deadline = Instant::now() + timeout;
        let (correlation_id, response) = self.replies.register();
        let command = build(ReplyTo::new(correlation_id, self.replies.clone()));
        let envelope = Envelope::ask(
            self.entity_id.clone(),
            command,
            AskHandle::new(correlation_id, self.replies.clone()),
        );

        let router = self.router.clone();
        let replies = self.replies.clone();
        tokio::spawn(async move {
            let entity_id = envelope.entity_id.clone();
            if let Err(e) = router.route(envelope).await {
                // No-op when the region already resolved the ask.
                if replies.fail(correlation_id, e.clone()) {
                    debug!(%entity_id, correlation_id, error = %e, "Ask not delivered");
                }
            }
        });

        let outcome = tokio::time::timeout_at(deadline, response).await;
        match outcome {
            Ok(Ok(Ok(reply))) => reply
                .downcast::<R>()
                .map(|reply| *reply)
                .map_err(|_| ShardingError::ReplyTypeMismatch),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(ShardingError::DeliveryUncertain {
                entity_id: self.entity_id.clone(),
                reason: "reply channel dropped".to_string(),
            }),
            Err(_) => {
                self.replies.forget(correlation_id);
                debug!(entity_id = %self.entity_id, correlation_id, ?timeout, "Ask timed out");
                Err(ShardingError::AskTimeout { timeout })
            }
        }
    }

    /// Fire-and-forget. Routing happens in the background; nothing reports
    /// whether the command arrived.
    pub fn tell(&self, command: E::Command) {
        let router = self.router.clone();
        let envelope = Envelope::tell(self.entity_id.clone(), command);
        tokio::spawn(async move {
            let entity_id = envelope.entity_id.clone();
            if let Err(e) = router.route(envelope).await {
                debug!(%entity_id, error = %e, "Tell not delivered");
            }
        });
    }
}
