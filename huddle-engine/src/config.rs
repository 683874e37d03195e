//! Engine configuration

use std::time::Duration;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(6);
pub const DEFAULT_TOPIC_PREFIX: &str = "huddle";
pub const DEFAULT_IDEMPOTENCY_CAPACITY: usize = 256;

/// Tunables shared by every component of a session.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Quiet period after the last relevant change before a recompute runs.
    pub debounce: Duration,
    /// Deadline for an RPC round trip to the authority.
    pub rpc_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Peers not heard from within this window drop out of presence.
    pub presence_ttl: Duration,
    /// Namespace for every pub/sub topic.
    pub topic_prefix: String,
    /// Number of idempotency keys the authority remembers.
    pub idempotency_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            presence_ttl: DEFAULT_PRESENCE_TTL,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            idempotency_capacity: DEFAULT_IDEMPOTENCY_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, ttl: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.presence_ttl = ttl;
        self
    }

    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    pub fn with_idempotency_capacity(mut self, capacity: usize) -> Self {
        self.idempotency_capacity = capacity;
        self
    }

    /// Fully qualified topic name, e.g. `huddle.rpc.request`.
    pub fn topic(&self, name: &str) -> String {
        format!("{}.{}", self.topic_prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.rpc_timeout, Duration::from_secs(10));
        assert_eq!(config.topic("presence"), "huddle.presence");
    }

    #[test]
    fn test_builder_chain() {
        let config = EngineConfig::new()
            .with_topic_prefix("table-7")
            .with_debounce(Duration::from_millis(5));
        assert_eq!(config.topic("rpc.request"), "table-7.rpc.request");
        assert_eq!(config.debounce, Duration::from_millis(5));
    }
}
