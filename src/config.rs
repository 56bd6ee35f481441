use crate::framework::ShardingError;
use crate::persistence::SnapshotPolicy;
use std::time::Duration;

/// Backoff policy for re-routing a message whose shard location was stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    /// Total delivery attempts, including the first one. Default: 5.
    pub max_attempts: u32,
    /// Delay before the second attempt. Default: 50ms.
    pub initial_backoff: Duration,
    /// Upper bound for a single backoff. Default: 1s.
    pub max_backoff: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetrySettings {
    /// Backoff after the given failed attempt (1-based), doubling each time.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Configuration for cluster sharding on one node.
#[derive(Debug, Clone)]
pub struct ShardingSettings {
    /// Number of shards. Must be identical on every node. Default: 100.
    pub number_of_shards: u32,
    /// Idle time after which an entity is passivated. `None` disables idle
    /// passivation. Default: 120s.
    pub passivate_idle_after: Option<Duration>,
    /// How often the region looks for idle entities. Default: 5s.
    pub idle_check_interval: Duration,
    /// Capacity of the region request channel. Default: 1024.
    pub region_mailbox_capacity: usize,
    /// Commands buffered per entity while it is passivating. Default: 1000.
    pub entity_buffer_capacity: usize,
    /// How long a region waits for the entities of a released shard to stop.
    /// Default: 10s.
    pub handoff_timeout: Duration,
    pub routing_retry: RetrySettings,
    /// Default snapshot policy for entities that do not override it.
    pub snapshot_policy: SnapshotPolicy,
}

impl Default for ShardingSettings {
    fn default() -> Self {
        Self {
            number_of_shards: 100,
            passivate_idle_after: Some(Duration::from_secs(120)),
            idle_check_interval: Duration::from_secs(5),
            region_mailbox_capacity: 1024,
            entity_buffer_capacity: 1000,
            handoff_timeout: Duration::from_secs(10),
            routing_retry: RetrySettings::default(),
            snapshot_policy: SnapshotPolicy::Never,
        }
    }
}

impl ShardingSettings {
    pub fn with_number_of_shards(mut self, number_of_shards: u32) -> Self {
        self.number_of_shards = number_of_shards;
        self
    }

    pub fn with_passivate_idle_after(mut self, idle: Option<Duration>) -> Self {
        self.passivate_idle_after = idle;
        self
    }

    pub fn with_idle_check_interval(mut self, interval: Duration) -> Self {
        self.idle_check_interval = interval;
        self
    }

    pub fn with_handoff_timeout(mut self, timeout: Duration) -> Self {
        self.handoff_timeout = timeout;
        self
    }

    pub fn with_entity_buffer_capacity(mut self, capacity: usize) -> Self {
        self.entity_buffer_capacity = capacity;
        self
    }

    pub fn with_routing_retry(mut self, retry: RetrySettings) -> Self {
        self.routing_retry = retry;
        self
    }

    pub fn with_snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshot_policy = policy;
        self
    }

    /// Validates the configuration, returning an error if any values are invalid.
    pub fn validate(&self) -> Result<(), ShardingError> {
        if self.number_of_shards == 0 {
            return Err(ShardingError::InvalidConfig {
                reason: "number_of_shards must be >= 1".to_string(),
            });
        }
        if self.passivate_idle_after.is_some_and(|idle| idle.is_zero()) {
            return Err(ShardingError::InvalidConfig {
                reason: "passivate_idle_after must be > 0 when set".to_string(),
            });
        }
        if self.idle_check_interval.is_zero() {
            return Err(ShardingError::InvalidConfig {
                reason: "idle_check_interval must be > 0".to_string(),
            });
        }
        if self.region_mailbox_capacity == 0 {
            return Err(ShardingError::InvalidConfig {
                reason: "region_mailbox_capacity must be >= 1".to_string(),
            });
        }
        if self.entity_buffer_capacity == 0 {
            return Err(ShardingError::InvalidConfig {
                reason: "entity_buffer_capacity must be >= 1".to_string(),
            });
        }
        if self.handoff_timeout.is_zero() {
            return Err(ShardingError::InvalidConfig {
                reason: "handoff_timeout must be > 0".to_string(),
            });
        }
        if self.routing_retry.max_attempts == 0 {
            return Err(ShardingError::InvalidConfig {
                reason: "routing_retry.max_attempts must be >= 1".to_string(),
            });
        }
        if self.routing_retry.initial_backoff > self.routing_retry.max_backoff {
            return Err(ShardingError::InvalidConfig {
                reason: "routing_retry.initial_backoff must not exceed max_backoff".to_string(),
            });
        }
        Ok(())
    }

    /// Defaults overlaid with `SHARDING_*` environment variables:
    ///
    /// | variable | field |
    /// |---|---|
    /// | `SHARDING_NUMBER_OF_SHARDS` | `number_of_shards` |
    /// | `SHARDING_PASSIVATE_IDLE_AFTER_MS` | `passivate_idle_after` (`0` disables) |
    /// | `SHARDING_HANDOFF_TIMEOUT_MS` | `handoff_timeout` |
    /// | `SHARDING_ROUTING_MAX_ATTEMPTS` | `routing_retry.max_attempts` |
    pub fn from_env() -> Result<Self, ShardingError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ShardingError> {
        let mut settings = Self::default();
        if let Some(n) = parse::<u32>(&lookup, "SHARDING_NUMBER_OF_SHARDS")? {
            settings.number_of_shards = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, "SHARDING_PASSIVATE_IDLE_AFTER_MS")? {
            settings.passivate_idle_after = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = parse::<u64>(&lookup, "SHARDING_HANDOFF_TIMEOUT_MS")? {
            settings.handoff_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse::<u32>(&lookup, "SHARDING_ROUTING_MAX_ATTEMPTS")? {
            settings.routing_retry.max_attempts = n;
        }
        settings.validate()?;
        Ok(settings)
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ShardingError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ShardingError::InvalidConfig {
                reason: format!("{key} is not a valid number: {raw:?}"),
            }),
    }
}
