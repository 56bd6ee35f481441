//! Commands, events, state and replies of the `HelloWorld` entity.

use crate::clients::ReplyTo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug)]
pub enum HelloWorldCommand {
    /// Remember `whom` and reply with the number of people known so far.
    Greet {
        whom: String,
        reply_to: ReplyTo<Greeting>,
    },
    /// Reply with everybody greeted so far. Persists nothing.
    KnownPeople { reply_to: ReplyTo<Vec<String>> },
    /// Reply with the number of people known, then stop the entity.
    Retire { reply_to: ReplyTo<usize> },
}

/// Reply to [`HelloWorldCommand::Greet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    pub whom: String,
    pub number_of_people: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeted {
    pub whom: String,
}

impl Greeted {
    pub fn new(whom: impl Into<String>) -> Self {
        Self { whom: whom.into() }
    }
}

/// Everybody this world has greeted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownPeople {
    names: BTreeSet<String>,
}

impl KnownPeople {
    pub fn with(mut self, name: impl Into<String>) -> Self {
        self.names.insert(name.into());
        self
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.names.iter().cloned().collect()
    }
}
