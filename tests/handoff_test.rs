use sharded_entities::clients::HelloWorldClient;
use sharded_entities::config::ShardingSettings;
use sharded_entities::framework::ShardingError;
use sharded_entities::hello_world::{HelloWorld, HelloWorldError};
use sharded_entities::lifecycle::{ClusterSharding, LocalCluster};
use sharded_entities::persistence::{InMemoryEventLog, PersistenceId};
use sharded_entities::sharding::{
    Allocation, EntityId, LocalCoordinator, LocalTransport, NodeId, ShardCoordinator, ShardEvent,
    StaticMembership,
};
use std::sync::Arc;
use std::time::Duration;

fn persistence_id(world_id: &str) -> PersistenceId {
    PersistenceId::of(HelloWorld::TYPE_NAME, EntityId::new(world_id))
}

fn start(nodes: usize, settings: ShardingSettings, log: &Arc<InMemoryEventLog>) -> LocalCluster {
    let cluster = LocalCluster::start(nodes, settings, log.clone()).expect("Failed to start cluster");
    cluster
        .init_all(HelloWorld::entity())
        .expect("Failed to register HelloWorld");
    cluster
}

/// Index of a node other than the current owner of `world_id`'s shard.
async fn other_node(cluster: &LocalCluster, world_id: &str) -> usize {
    let owner = cluster
        .owner_of(&EntityId::new(world_id))
        .await
        .expect("Failed to locate shard");
    cluster
        .nodes()
        .iter()
        .position(|node| node.node_id() != &owner)
        .expect("A second node")
}

/// A shard moved while a command is being persisted: the old instance
/// finishes and stops before the new owner appends anything.
#[tokio::test(start_paused = true)]
async fn test_handoff_mid_command_never_overlaps_appends() {
    let log = Arc::new(InMemoryEventLog::new().with_append_delay(Duration::from_millis(100)));
    let cluster = Arc::new(start(2, ShardingSettings::default(), &log));
    let entity_id = EntityId::new("world-1");
    let shard_id = cluster.shard_id_for(&entity_id);
    let target = other_node(&cluster, "world-1").await;
    let mut events = cluster.coordinator().subscribe();

    let alice = {
        let client = HelloWorldClient::new(cluster.node(0).expect("node-0").clone());
        tokio::spawn(async move { client.say_hello("world-1", "Alice").await })
    };
    // Alice's append is now in flight.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let handoff = {
        let cluster = cluster.clone();
        tokio::spawn(async move { cluster.handoff(shard_id, target).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    let bob = {
        let client = HelloWorldClient::new(cluster.node(1).expect("node-1").clone());
        tokio::spawn(async move { client.say_hello("world-1", "Bob").await })
    };

    assert_eq!(alice.await.expect("task").expect("Alice"), 1);
    handoff.await.expect("task").expect("Handoff failed");
    assert_eq!(bob.await.expect("task").expect("Bob"), 2);

    let sequence_nrs: Vec<u64> = log
        .events(&persistence_id("world-1"))
        .iter()
        .map(|event| event.sequence_nr)
        .collect();
    assert_eq!(sequence_nrs, vec![1, 2]);
    assert_eq!(log.overlapping_appends(), 0);

    let new_owner = cluster.nodes()[target].node_id().clone();
    assert_eq!(
        cluster.coordinator().allocation(shard_id),
        Some(Allocation::Allocated(new_owner.clone()))
    );
    let mut completed = false;
    while let Ok(event) = events.try_recv() {
        if let ShardEvent::HandoffCompleted { to, .. } = event {
            assert_eq!(to, new_owner);
            completed = true;
        }
    }
    assert!(completed);

    cluster.shutdown().await;
}

fn greeted(log: &InMemoryEventLog, world_id: &str) -> Vec<String> {
    log.events(&persistence_id(world_id))
        .iter()
        .map(|event| event.payload["whom"].as_str().unwrap_or_default().to_string())
        .collect()
}

/// An ask that gives up while its command waits out a handoff does not take
/// the command with it.
#[tokio::test(start_paused = true)]
async fn test_ask_timeout_does_not_cancel_delivery() {
    let log = Arc::new(InMemoryEventLog::new().with_append_delay(Duration::from_millis(300)));
    let cluster = Arc::new(start(2, ShardingSettings::default(), &log));
    let shard_id = cluster.shard_id_for(&EntityId::new("world-1"));
    let target = other_node(&cluster, "world-1").await;

    let alice = {
        let client = HelloWorldClient::new(cluster.node(0).expect("node-0").clone());
        tokio::spawn(async move { client.say_hello("world-1", "Alice").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let handoff = {
        let cluster = cluster.clone();
        tokio::spawn(async move { cluster.handoff(shard_id, target).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;

    let impatient = HelloWorldClient::new(cluster.node(1).expect("node-1").clone())
        .with_ask_timeout(Duration::from_millis(100));
    assert!(matches!(
        impatient.say_hello("world-1", "Bob").await,
        Err(HelloWorldError::Sharding(ShardingError::AskTimeout { .. }))
    ));

    assert_eq!(alice.await.expect("task").expect("Alice"), 1);
    handoff.await.expect("task").expect("Handoff failed");
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(greeted(&log, "world-1"), vec!["Alice", "Bob"]);
    assert_eq!(log.overlapping_appends(), 0);
    assert_eq!(cluster.node(1).expect("node-1").pending_asks(), 0);

    cluster.shutdown().await;
}

/// Dropping the owning node stops its region. A handoff away from it waits for
/// that, so the old region can never serve the entity next to the new one.
#[tokio::test(start_paused = true)]
async fn test_dropped_owner_never_serves_after_handoff() {
    let log = Arc::new(InMemoryEventLog::new());
    let node_ids: Vec<NodeId> = (0..3).map(|i| NodeId::new(format!("node-{i}"))).collect();
    let membership = Arc::new(StaticMembership::new(node_ids.clone()));
    let coordinator = Arc::new(LocalCoordinator::new(membership));
    let transport = Arc::new(LocalTransport::new());
    let mut nodes: Vec<Option<Arc<ClusterSharding>>> = Vec::new();
    for node_id in &node_ids {
        let node = ClusterSharding::new(
            node_id.clone(),
            ShardingSettings::default(),
            coordinator.clone(),
            log.clone(),
            transport.clone(),
        )
        .expect("Failed to start node");
        node.init(HelloWorld::entity()).expect("Failed to register HelloWorld");
        nodes.push(Some(node));
    }

    let entity_id = EntityId::new("world-1");
    let shard_id = nodes[0]
        .as_ref()
        .expect("node-0")
        .shard_id_for(&entity_id);
    let owner = coordinator
        .shard_location(shard_id)
        .await
        .expect("Failed to locate shard");
    let owner_index = node_ids
        .iter()
        .position(|node_id| *node_id == owner)
        .expect("Owner is a member");
    let others: Vec<usize> = (0..node_ids.len()).filter(|i| *i != owner_index).collect();
    let via_first = HelloWorldClient::new(nodes[others[0]].clone().expect("node"));
    let via_second = HelloWorldClient::new(nodes[others[1]].clone().expect("node"));

    assert_eq!(via_first.say_hello("world-1", "Alice").await.expect("greet"), 1);
    drop(nodes[owner_index].take());

    let target = node_ids[others[1]].clone();
    coordinator
        .handoff(shard_id, target.clone())
        .await
        .expect("Handoff failed");
    let directory = transport
        .directory::<HelloWorld>(HelloWorld::TYPE_NAME)
        .expect("Directory");
    assert!(!directory.nodes().contains(&owner));

    assert_eq!(via_second.say_hello("world-1", "Bob").await.expect("greet"), 2);
    // This node still has the dropped owner in its routing table.
    assert_eq!(via_first.say_hello("world-1", "Carol").await.expect("greet"), 3);
    assert_eq!(greeted(&log, "world-1"), vec!["Alice", "Bob", "Carol"]);
    assert_eq!(log.overlapping_appends(), 0);

    let mut hosting = Vec::new();
    for node in nodes.iter().flatten() {
        let stats = node
            .region(&HelloWorld::type_key())
            .expect("Region registered")
            .stats()
            .await
            .expect("Failed to get stats");
        if stats.hosted_shards.contains(&shard_id) {
            hosting.push(stats.node_id);
        }
    }
    assert_eq!(hosting, vec![target]);

    for node in nodes.iter().flatten() {
        node.shutdown().await;
    }
}

/// The old owner stops hosting the shard, the new owner recovers the entity.
#[tokio::test]
async fn test_handoff_moves_entity() {
    let log = Arc::new(InMemoryEventLog::new());
    let cluster = start(3, ShardingSettings::default(), &log);
    let client = HelloWorldClient::new(cluster.node(0).expect("node-0").clone());
    let entity_id = EntityId::new("world-1");
    let shard_id = cluster.shard_id_for(&entity_id);

    client.say_hello("world-1", "Alice").await.expect("greet");
    let owner = cluster.owner_of(&entity_id).await.expect("owner");
    let target = other_node(&cluster, "world-1").await;
    cluster.handoff(shard_id, target).await.expect("Handoff failed");

    for node in cluster.nodes() {
        let stats = node
            .region(&HelloWorld::type_key())
            .expect("Region registered")
            .stats()
            .await
            .expect("Failed to get stats");
        if node.node_id() == &owner {
            assert!(!stats.hosted_shards.contains(&shard_id));
            assert_eq!(stats.active_entities, 0);
        }
    }

    assert_eq!(client.say_hello("world-1", "Bob").await.expect("greet"), 2);
    let new_stats = cluster.nodes()[target]
        .region(&HelloWorld::type_key())
        .expect("Region registered")
        .stats()
        .await
        .expect("Failed to get stats");
    assert!(new_stats.hosted_shards.contains(&shard_id));
    assert_eq!(new_stats.active_entities, 1);

    cluster.shutdown().await;
}

/// Removing a node and rebalancing moves its shards to the remaining nodes.
#[tokio::test]
async fn test_rebalance_after_membership_change() {
    let log = Arc::new(InMemoryEventLog::new());
    let cluster = start(2, ShardingSettings::default(), &log);
    let client = HelloWorldClient::new(cluster.node(0).expect("node-0").clone());

    let worlds: Vec<String> = (0..10).map(|i| format!("world-{i}")).collect();
    for world in &worlds {
        client.say_hello(world, "Alice").await.expect("greet");
    }

    let leaving = cluster.node(1).expect("node-1").node_id().clone();
    cluster.membership().remove(&leaving);
    cluster.coordinator().rebalance().await.expect("Rebalance failed");

    for world in &worlds {
        let owner = cluster.owner_of(&EntityId::new(world.as_str())).await.expect("owner");
        assert_ne!(owner, leaving);
        assert_eq!(client.say_hello(world, "Bob").await.expect("greet"), 2);
    }
    assert_eq!(log.overlapping_appends(), 0);

    cluster.shutdown().await;
}

/// Idle entities are passivated by the region's timer.
#[tokio::test(start_paused = true)]
async fn test_idle_passivation() {
    let log = Arc::new(InMemoryEventLog::new());
    let settings = ShardingSettings::default()
        .with_passivate_idle_after(Some(Duration::from_secs(1)))
        .with_idle_check_interval(Duration::from_millis(100));
    let cluster = start(1, settings, &log);
    let node = cluster.node(0).expect("node-0").clone();
    let client = HelloWorldClient::new(node.clone());
    let region = node.region(&HelloWorld::type_key()).expect("Region registered");

    client.say_hello("world-1", "Alice").await.expect("greet");
    assert_eq!(region.stats().await.expect("stats").active_entities, 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(region.stats().await.expect("stats").active_entities, 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(region.stats().await.expect("stats").active_entities, 0);

    assert_eq!(client.say_hello("world-1", "Bob").await.expect("greet"), 2);

    cluster.shutdown().await;
}

/// Shutdown stops every region; later asks fail instead of hanging.
#[tokio::test(start_paused = true)]
async fn test_shutdown_fails_later_asks() {
    let log = Arc::new(InMemoryEventLog::new());
    let cluster = start(1, ShardingSettings::default(), &log);
    let client = HelloWorldClient::new(cluster.node(0).expect("node-0").clone());

    client.say_hello("world-1", "Alice").await.expect("greet");
    cluster.shutdown().await;

    assert!(client.say_hello("world-1", "Bob").await.is_err());
}
