//! The `HelloWorld` persistent entity: greets people and remembers them.

pub mod entity;
pub mod error;
pub mod model;

pub use entity::*;
pub use error::*;
pub use model::*;
