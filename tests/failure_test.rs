use serde_json::json;
use sharded_entities::clients::{EntityClient, HelloWorldClient};
use sharded_entities::config::{RetrySettings, ShardingSettings};
use sharded_entities::framework::ShardingError;
use sharded_entities::hello_world::{HelloWorld, HelloWorldError};
use sharded_entities::lifecycle::LocalCluster;
use sharded_entities::persistence::{EventLog, InMemoryEventLog, PersistenceId};
use sharded_entities::sharding::EntityId;
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

fn sharding_error(result: Result<usize, HelloWorldError>) -> ShardingError {
    match result {
        Err(HelloWorldError::Sharding(e)) => e,
        other => panic!("expected a sharding error, got {other:?}"),
    }
}

/// A failed append aborts the command, fails the ask and discards the
/// instance. Nothing of the failed command survives.
#[tokio::test]
async fn test_persist_failure_discards_instance() {
    let log = Arc::new(InMemoryEventLog::new());
    let cluster = start(1, ShardingSettings::default(), &log);
    let client = HelloWorldClient::new(cluster.node(0).expect("node-0").clone());

    assert_eq!(client.say_hello("world-1", "Alice").await.expect("greet"), 1);

    log.fail_next_appends(1);
    let error = sharding_error(client.say_hello("world-1", "Bob").await);
    assert!(matches!(error, ShardingError::PersistFailure { .. }), "{error}");

    let people = client.known_people("world-1").await.expect("Failed to list");
    assert_eq!(people, vec!["Alice"]);
    assert_eq!(client.say_hello("world-1", "Carol").await.expect("greet"), 2);
    let sequence_nrs: Vec<u64> = log
        .events(&persistence_id("world-1"))
        .iter()
        .map(|event| event.sequence_nr)
        .collect();
    assert_eq!(sequence_nrs, vec![1, 2]);

    cluster.shutdown().await;
}

/// An unreadable log fails the activation and the ask that triggered it; the
/// next message tries again from scratch.
#[tokio::test]
async fn test_activation_failure_on_read_error() {
    let log = Arc::new(InMemoryEventLog::new());
    let cluster = start(1, ShardingSettings::default(), &log);
    let client = HelloWorldClient::new(cluster.node(0).expect("node-0").clone());

    log.fail_next_reads(1);
    let error = sharding_error(client.say_hello("world-1", "Alice").await);
    assert!(matches!(error, ShardingError::ActivationFailure { .. }), "{error}");
    assert_eq!(log.append_count(), 0);

    assert_eq!(client.say_hello("world-1", "Alice").await.expect("greet"), 1);

    cluster.shutdown().await;
}

/// A gap in the event stream is fatal to the activation, never skipped.
#[tokio::test]
async fn test_activation_failure_on_gap() {
    let log = Arc::new(InMemoryEventLog::new());
    let cluster = start(1, ShardingSettings::default(), &log);
    let client = HelloWorldClient::new(cluster.node(0).expect("node-0").clone());

    client.say_hello("world-1", "Alice").await.expect("greet");
    client.say_hello("world-1", "Bob").await.expect("greet");
    client.retire("world-1").await.expect("Failed to retire");

    assert!(log.drop_event(&persistence_id("world-1"), 1));
    let error = sharding_error(client.say_hello("world-1", "Carol").await);
    match error {
        ShardingError::ActivationFailure { reason, .. } => {
            assert!(reason.contains("gap"), "{reason}")
        }
        other => panic!("expected an activation failure, got {other}"),
    }
    assert_eq!(log.events(&persistence_id("world-1")).len(), 1);

    cluster.shutdown().await;
}

/// Another writer appending to an owned stream is reported as a handoff
/// violation; the instance is dropped and the next activation replays
/// everything that was stored.
#[tokio::test]
async fn test_foreign_append_is_a_handoff_violation() {
    let log = Arc::new(InMemoryEventLog::new());
    let cluster = start(1, ShardingSettings::default(), &log);
    let client = HelloWorldClient::new(cluster.node(0).expect("node-0").clone());

    assert_eq!(client.say_hello("world-1", "Alice").await.expect("greet"), 1);
    log.append(&persistence_id("world-1"), 2, vec![json!({ "whom": "Mallory" })])
        .await
        .expect("Foreign append");

    let error = sharding_error(client.say_hello("world-1", "Bob").await);
    assert!(matches!(error, ShardingError::HandoffViolation { .. }), "{error}");

    assert_eq!(client.say_hello("world-1", "Carol").await.expect("greet"), 3);
    let people = client.known_people("world-1").await.expect("Failed to list");
    assert_eq!(people, vec!["Alice", "Carol", "Mallory"]);

    cluster.shutdown().await;
}

/// When no node can take the shard, routing retries with backoff and then
/// reports the delivery as uncertain.
#[tokio::test(start_paused = true)]
async fn test_routing_exhaustion_is_delivery_uncertain() {
    let log = Arc::new(InMemoryEventLog::new());
    let settings = ShardingSettings::default().with_routing_retry(RetrySettings {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(100),
    });
    let cluster = start(1, settings, &log);
    let node = cluster.node(0).expect("node-0").clone();
    let client = HelloWorldClient::new(node.clone());

    cluster.membership().remove(node.node_id());
    let error = sharding_error(client.say_hello("world-1", "Alice").await);
    assert!(matches!(error, ShardingError::DeliveryUncertain { .. }), "{error}");
    assert_eq!(node.pending_asks(), 0);
    assert_eq!(log.append_count(), 0);

    cluster.shutdown().await;
}

/// Registration errors.
#[tokio::test]
async fn test_registration_errors() {
    let log = Arc::new(InMemoryEventLog::new());
    let cluster = LocalCluster::start(1, ShardingSettings::default(), log.clone())
        .expect("Failed to start cluster");
    let node = cluster.node(0).expect("node-0").clone();

    let client = HelloWorldClient::new(node.clone());
    assert!(matches!(
        client.entity_ref("world-1"),
        Err(HelloWorldError::Sharding(ShardingError::NotRegistered(_)))
    ));

    node.init(HelloWorld::entity()).expect("First registration");
    assert!(matches!(
        node.init(HelloWorld::entity()),
        Err(ShardingError::AlreadyRegistered(_))
    ));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_invalid_settings_are_rejected() {
    let log = Arc::new(InMemoryEventLog::new());
    let settings = ShardingSettings::default().with_number_of_shards(0);
    assert!(matches!(
        LocalCluster::start(2, settings, log.clone()),
        Err(ShardingError::InvalidConfig { .. })
    ));
    assert!(matches!(
        LocalCluster::start(0, ShardingSettings::default(), log),
        Err(ShardingError::InvalidConfig { .. })
    ));
}
