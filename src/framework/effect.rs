//! # Effect
//!
//! The declarative result of a command handler: the events to persist, in
//! order, plus the actions to run once they are durably stored.
//!
//! ```rust,ignore
//! Effect::persist(Greeted { whom })
//!     .then_reply(reply_to, |state| Greeting::new(whom, state.len()))
//! ```
//!
//! Nothing inside an effect is executed by the handler itself. The entity
//! instance appends the events, folds them into its state, and only then runs
//! the post-commit actions against the new state.

use crate::clients::ReplyTo;
use crate::framework::entity::EventSourcedEntity;
use std::fmt;

type PostCommit<E> = Box<dyn FnOnce(&<E as EventSourcedEntity>::State) + Send>;

pub struct Effect<E: EventSourcedEntity> {
    events: Vec<E::Event>,
    actions: Vec<PostCommit<E>>,
    stop: bool,
    unhandled: bool,
}

pub(crate) struct EffectParts<E: EventSourcedEntity> {
    pub events: Vec<E::Event>,
    pub actions: Vec<PostCommit<E>>,
    pub stop: bool,
    pub unhandled: bool,
}

impl<E: EventSourcedEntity> Effect<E> {
    fn empty() -> Self {
        Self {
            events: Vec::new(),
            actions: Vec::new(),
            stop: false,
            unhandled: false,
        }
    }

    pub fn persist(event: E::Event) -> Self {
        Self::persist_all([event])
    }

    /// Persists all events atomically, in iteration order.
    pub fn persist_all(events: impl IntoIterator<Item = E::Event>) -> Self {
        Self {
            events: events.into_iter().collect(),
            ..Self::empty()
        }
    }

    pub fn none() -> Self {
        Self::empty()
    }

    /// The command was not meant for the current state. Logged and ignored.
    pub fn unhandled() -> Self {
        Self {
            unhandled: true,
            ..Self::empty()
        }
    }

    /// Stops the entity. Commands queued behind this one go to a fresh instance.
    pub fn stop() -> Self {
        Self::empty().then_stop()
    }

    pub fn reply<R: Send + 'static>(reply_to: ReplyTo<R>, reply: R) -> Self {
        Self::empty().then_run(move |_| reply_to.tell(reply))
    }

    pub fn then_run<F>(mut self, action: F) -> Self
    where
        F: FnOnce(&E::State) + Send + 'static,
    {
        self.actions.push(Box::new(action));
        self
    }

    /// Replies with a value computed from the state after the events were applied.
    pub fn then_reply<R, F>(self, reply_to: ReplyTo<R>, reply: F) -> Self
    where
        R: Send + 'static,
        F: FnOnce(&E::State) -> R + Send + 'static,
    {
        self.then_run(move |state| reply_to.tell(reply(state)))
    }

    pub fn then_stop(mut self) -> Self {
        self.stop = true;
        self
    }

    pub fn events(&self) -> &[E::Event] {
        &self.events
    }

    pub fn is_stop(&self) -> bool {
        self.stop
    }

    pub(crate) fn into_parts(self) -> EffectParts<E> {
        EffectParts {
            events: self.events,
            actions: self.actions,
            stop: self.stop,
            unhandled: self.unhandled,
        }
    }
}

impl<E: EventSourcedEntity> fmt::Debug for Effect<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("events", &self.events)
            .field("actions", &self.actions.len())
            .field("stop", &self.stop)
            .field("unhandled", &self.unhandled)
            .finish()
    }
}
