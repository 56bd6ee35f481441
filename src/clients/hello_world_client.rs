use crate::clients::entity_client::EntityClient;
use crate::hello_world::{Greeting, HelloWorld, HelloWorldCommand, HelloWorldError};
use crate::lifecycle::ClusterSharding;
use crate::sharding::EntityTypeKey;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Client for greeting people in `HelloWorld` entities.
#[derive(Clone)]
pub struct HelloWorldClient {
    sharding: Arc<ClusterSharding>,
    type_key: EntityTypeKey<HelloWorld>,
    ask_timeout: Duration,
}

impl HelloWorldClient {
    pub fn new(sharding: Arc<ClusterSharding>) -> Self {
        Self {
            sharding,
            type_key: HelloWorld::type_key(),
            ask_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_ask_timeout(mut self, ask_timeout: Duration) -> Self {
        self.ask_timeout = ask_timeout;
        self
    }

    /// Greets `whom` in world `world_id`, returning how many people that world knows.
    #[instrument(skip(self))]
    pub async fn say_hello(&self, world_id: &str, whom: &str) -> Result<usize, HelloWorldError> {
        if whom.trim().is_empty() {
            return Err(HelloWorldError::NobodyToGreet);
        }
        debug!("Sending request");
        let whom = whom.to_string();
        let greeting: Greeting = self
            .entity_ref(world_id)?
            .ask(
                |reply_to| HelloWorldCommand::Greet { whom, reply_to },
                self.ask_timeout(),
            )
            .await?;
        Ok(greeting.number_of_people)
    }

    #[instrument(skip(self))]
    pub async fn known_people(&self, world_id: &str) -> Result<Vec<String>, HelloWorldError> {
        debug!("Sending request");
        Ok(self
            .entity_ref(world_id)?
            .ask(
                |reply_to| HelloWorldCommand::KnownPeople { reply_to },
                self.ask_timeout(),
            )
            .await?)
    }

    /// Stops the world's entity. The next greeting recovers it from its events.
    #[instrument(skip(self))]
    pub async fn retire(&self, world_id: &str) -> Result<usize, HelloWorldError> {
        debug!("Sending request");
        Ok(self
            .entity_ref(world_id)?
            .ask(
                |reply_to| HelloWorldCommand::Retire { reply_to },
                self.ask_timeout(),
            )
            .await?)
    }
}

impl EntityClient<HelloWorld> for HelloWorldClient {
    type Error = HelloWorldError;

    fn sharding(&self) -> &ClusterSharding {
        &self.sharding
    }

    fn type_key(&self) -> &EntityTypeKey<HelloWorld> {
        &self.type_key
    }

    fn ask_timeout(&self) -> Duration {
        self.ask_timeout
    }
}
