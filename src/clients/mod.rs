//! Client-side handles: location-transparent entity references, ask/reply
//! correlation, and domain-specific wrappers built on top of them.

pub mod entity_client;
pub mod entity_ref;
pub mod hello_world_client;
pub mod reply;

pub use entity_client::*;
pub use entity_ref::*;
pub use hello_world_client::*;
pub use reply::{AskHandle, PendingReplies, ReplyTo};
