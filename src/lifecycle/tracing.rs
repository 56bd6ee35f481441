//! # Observability & Tracing
//!
//! [`setup_tracing`] installs a compact `tracing-subscriber` formatter filtered
//! by `RUST_LOG`. Module paths are hidden (`with_target(false)`); every log line
//! carries structured fields such as `entity_type`, `entity_id`, `shard_id`,
//! `node_id` and `sequence_nr` instead.
//!
//! ## What Gets Traced
//!
//! - **Region lifecycle** (`info`): region started/stopped, shard hosted, shard released
//! - **Entity lifecycle** (`info`): recovered (with its sequence number), passivated, stopped
//! - **Handoffs** (`info`): handoff started/completed on the coordinator
//! - **Command traffic** (`debug`): routed, command, persisted, retrying route
//! - **Recoverable failures** (`warn`): activation failed, persist failed, routing exhausted
//! - **Invariant breaches** (`error`): another writer appended to an owned stream
//!
//! ## Usage Examples
//!
//! ```bash
//! # Lifecycle only
//! RUST_LOG=info cargo run
//!
//! # Every command, append and routing retry
//! RUST_LOG=debug cargo run
//!
//! # Only the sharding machinery
//! RUST_LOG=sharded_entities::sharding=debug cargo run
//! ```
//!
//! With `RUST_LOG=info` a greeting on a fresh world looks like:
//!
//! ```text
//! INFO Region started entity_type="HelloWorld" node_id=node-0
//! INFO Hosting shard entity_type="HelloWorld" node_id=node-1 shard_id=shard-42
//! INFO Starting HelloWorld entity_id=world-1 persistence_id=HelloWorld|world-1
//! INFO Recovered entity_type=HelloWorld entity_id=world-1 shard_id=shard-42 sequence_nr=0
//! ```
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false) // entity_type and node_id identify the source instead
        .compact()
        .init();
}
