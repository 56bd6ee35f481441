//! # Sharded Entities Demo
//!
//! Starts a three-node cluster in one process and greets people in a
//! `HelloWorld` entity:
//! 1.  Greets Alice and Bob through different nodes.
//! 2.  Moves the entity's shard to another node.
//! 3.  Greets Carol; the entity recovers on its new node from the event log.

use sharded_entities::clients::HelloWorldClient;
use sharded_entities::config::ShardingSettings;
use sharded_entities::hello_world::HelloWorld;
use sharded_entities::lifecycle::{setup_tracing, LocalCluster};
use sharded_entities::persistence::InMemoryEventLog;
use sharded_entities::sharding::EntityId;
use std::sync::Arc;
use tracing::{error, info, Instrument};

#[tokio::main]
async fn main() -> Result<(), String> {
    // Setup tracing once for the entire application
    setup_tracing();

    let settings = ShardingSettings::from_env().map_err(|e| e.to_string())?;
    let event_log = Arc::new(InMemoryEventLog::new());
    let cluster = LocalCluster::start(3, settings, event_log).map_err(|e| e.to_string())?;
    cluster
        .init_all(HelloWorld::entity())
        .map_err(|e| e.to_string())?;

    let nodes = cluster.nodes();
    let first = HelloWorldClient::new(nodes[0].clone());
    let last = HelloWorldClient::new(nodes[nodes.len() - 1].clone());

    let world_id = "world-1";
    let span = tracing::info_span!("greetings", world_id);
    async {
        let count = first.say_hello(world_id, "Alice").await?;
        info!(whom = "Alice", count, "Greeted");
        let count = last.say_hello(world_id, "Bob").await?;
        info!(whom = "Bob", count, "Greeted");
        Ok::<_, sharded_entities::hello_world::HelloWorldError>(())
    }
    .instrument(span)
    .await
    .map_err(|e| e.to_string())?;

    let entity_id = EntityId::new(world_id);
    let shard_id = cluster.shard_id_for(&entity_id);
    let owner = cluster.owner_of(&entity_id).await.map_err(|e| e.to_string())?;
    let target = nodes
        .iter()
        .position(|node| node.node_id() != &owner)
        .unwrap_or_default();
    info!(%shard_id, from = %owner, to = %nodes[target].node_id(), "Moving shard");
    cluster
        .handoff(shard_id, target)
        .await
        .map_err(|e| e.to_string())?;

    match first.say_hello(world_id, "Carol").await {
        Ok(count) => info!(whom = "Carol", count, "Greeted after handoff"),
        Err(e) => error!(error = %e, "Greeting after handoff failed"),
    }
    match last.known_people(world_id).await {
        Ok(people) => info!(?people, "Known people"),
        Err(e) => error!(error = %e, "Listing people failed"),
    }

    // Shutdown cluster gracefully
    cluster.shutdown().await;

    info!("Application completed successfully");
    Ok(())
}
