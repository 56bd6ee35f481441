//! Error types for the HelloWorld entity.

use crate::framework::ShardingError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum HelloWorldError {
    /// The name to greet was empty.
    #[error("Nobody to greet")]
    NobodyToGreet,

    /// The request did not complete; see the inner error for whether it may
    /// still have been processed.
    #[error("Sharding error: {0}")]
    Sharding(#[from] ShardingError),
}
