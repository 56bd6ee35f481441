//! # Reply Correlation
//!
//! Asks are correlated by id. The asking side registers a pending promise in
//! [`PendingReplies`] and embeds a [`ReplyTo`] carrying the id into its command.
//! Whoever handles the command answers through that `ReplyTo`; whatever routes
//! the command can fail the same promise through the [`AskHandle`].
//!
//! A promise is resolved at most once. After a timeout the asking side forgets
//! the id, so a late reply finds nothing to complete and is dropped.

use crate::framework::ShardingError;
use dashmap::DashMap;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

pub(crate) type AnyReply = Box<dyn Any + Send>;
type Promise = oneshot::Sender<Result<AnyReply, ShardingError>>;

/// Registry of in-flight asks.
#[derive(Default)]
pub struct PendingReplies {
    next_id: AtomicU64,
    pending: DashMap<u64, Promise>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a correlation id and registers its promise.
    pub fn register(&self) -> (u64, oneshot::Receiver<Result<AnyReply, ShardingError>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (promise, response) = oneshot::channel();
        self.pending.insert(id, promise);
        (id, response)
    }

    /// Resolves `id` with a reply. Returns `false` when nobody is waiting anymore.
    pub fn complete(&self, id: u64, reply: AnyReply) -> bool {
        match self.pending.remove(&id) {
            Some((_, promise)) => promise.send(Ok(reply)).is_ok(),
            None => {
                debug!(correlation_id = id, "Dropping reply without pending ask");
                false
            }
        }
    }

    /// Resolves `id` with a failure.
    pub fn fail(&self, id: u64, error: ShardingError) -> bool {
        match self.pending.remove(&id) {
            Some((_, promise)) => promise.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Stops waiting for `id`.
    pub fn forget(&self, id: u64) {
        self.pending.remove(&id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl fmt::Debug for PendingReplies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReplies")
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Reply destination embedded in a command.
pub struct ReplyTo<R> {
    correlation_id: u64,
    replies: Option<Arc<PendingReplies>>,
    _reply: PhantomData<fn(R)>,
}

impl<R: Send + 'static> ReplyTo<R> {
    pub fn new(correlation_id: u64, replies: Arc<PendingReplies>) -> Self {
        Self {
            correlation_id,
            replies: Some(replies),
            _reply: PhantomData,
        }
    }

    /// A destination that discards the reply, for commands sent with `tell`.
    pub fn ignore() -> Self {
        Self {
            correlation_id: 0,
            replies: None,
            _reply: PhantomData,
        }
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub fn tell(self, reply: R) {
        if let Some(replies) = self.replies {
            replies.complete(self.correlation_id, Box::new(reply));
        }
    }
}

impl<R> fmt::Debug for ReplyTo<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplyTo({})", self.correlation_id)
    }
}

/// Routing-side view of a pending ask, used to fail it.
#[derive(Clone)]
pub struct AskHandle {
    correlation_id: u64,
    replies: Arc<PendingReplies>,
}

impl AskHandle {
    pub(crate) fn new(correlation_id: u64, replies: Arc<PendingReplies>) -> Self {
        Self {
            correlation_id,
            replies,
        }
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub fn fail(&self, error: ShardingError) {
        if self.replies.fail(self.correlation_id, error) {
            debug!(correlation_id = self.correlation_id, "Ask failed");
        }
    }
}
