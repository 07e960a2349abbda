//! Client configuration
//!
//! [`ClientConfig`] is a plain, validated value supplied by the embedding
//! application; the client never reads files or the environment. At runtime
//! it lives inside an immutable, versioned [`ConfigSnapshot`] held by a
//! [`ConfigStore`], which swaps snapshots atomically for hot reconfiguration.

use crate::backoff::BackoffConfig;
use crate::error::{ClientError, Result};
use crate::routing::RoutingPolicy;
use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-node connection pool limits
    pub pool: PoolConfig,

    /// Health probing and quarantine
    pub health: HealthConfig,

    /// Circuit breaker thresholds
    pub breaker: BreakerConfig,

    /// Retry policy for data operations
    pub retry: RetryConfig,

    /// Topology discovery (tend loop)
    pub discovery: DiscoveryConfig,

    /// Replica selection policy
    pub routing: RoutingPolicy,
}

impl ClientConfig {
    /// Create a configuration builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Check every limit and threshold for consistency
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.health.validate()?;
        self.breaker.validate()?;
        self.retry.validate()?;
        self.discovery.validate()?;
        self.routing.validate()?;
        Ok(())
    }
}

/// Per-node connection pool configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections kept open per node
    pub min_idle: usize,

    /// Maximum connections (leased + idle) per node
    pub max_connections: usize,

    /// Connections older than this are closed instead of recycled
    pub max_idle_age: Duration,

    /// Waiter queue depth at which `acquire` fails fast
    pub max_waiters: usize,

    /// Longest time a caller may wait in the queue before `PoolExhausted`
    pub fast_fail_after: Duration,

    /// Handshake timeout for new connections
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 1,
            max_connections: 16,
            max_idle_age: Duration::from_secs(300),
            max_waiters: 64,
            fast_fail_after: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(invalid("pool.max_connections must be > 0"));
        }
        if self.min_idle > self.max_connections {
            return Err(invalid("pool.min_idle must be <= pool.max_connections"));
        }
        if self.max_idle_age.is_zero() {
            return Err(invalid("pool.max_idle_age must be > 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid("pool.connect_timeout must be > 0"));
        }
        Ok(())
    }
}

/// Health monitor configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between probe rounds
    pub probe_interval: Duration,

    /// Timeout for a single probe
    pub probe_timeout: Duration,

    /// Consecutive failures before a node is quarantined
    pub quarantine_threshold: u32,

    /// Quarantine backoff
    pub backoff: BackoffConfig,

    /// Weight of the newest latency sample in the moving average
    pub ewma_alpha: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            quarantine_threshold: 3,
            backoff: BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(60)),
            ewma_alpha: 0.3,
        }
    }
}

impl HealthConfig {
    fn validate(&self) -> Result<()> {
        if self.probe_interval.is_zero() || self.probe_timeout.is_zero() {
            return Err(invalid("health.probe_interval and probe_timeout must be > 0"));
        }
        if self.quarantine_threshold == 0 {
            return Err(invalid("health.quarantine_threshold must be >= 1"));
        }
        if !(self.ewma_alpha > 0.0 && self.ewma_alpha <= 1.0) {
            return Err(invalid("health.ewma_alpha must be in (0.0, 1.0]"));
        }
        self.backoff.validate("health.backoff").map_err(invalid)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,

    /// Open-state backoff
    pub backoff: BackoffConfig,

    /// Keep one breaker per (node, operation class) instead of per node
    pub per_operation_class: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            backoff: BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(30)),
            per_operation_class: false,
        }
    }
}

impl BreakerConfig {
    fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold must be >= 1"));
        }
        self.backoff.validate("breaker.backoff").map_err(invalid)
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay between attempts
    pub backoff: BackoffConfig,

    /// Deadline for a whole operation when the caller supplies none
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::new(Duration::from_millis(50), Duration::from_secs(2)),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be >= 1"));
        }
        if self.request_timeout.is_zero() {
            return Err(invalid("retry.request_timeout must be > 0"));
        }
        self.backoff.validate("retry.backoff").map_err(invalid)
    }
}

/// Topology discovery configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Interval between tend cycles
    pub tend_interval: Duration,

    /// Timeout for one node's topology query
    pub query_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            tend_interval: Duration::from_secs(1),
            query_timeout: Duration::from_millis(750),
        }
    }
}

impl DiscoveryConfig {
    fn validate(&self) -> Result<()> {
        if self.tend_interval.is_zero() || self.query_timeout.is_zero() {
            return Err(invalid("discovery.tend_interval and query_timeout must be > 0"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ClientError {
    ClientError::InvalidConfig(msg.into())
}

/// Builder for [`ClientConfig`]
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.pool.max_connections = max;
        self
    }

    pub fn min_idle(mut self, min_idle: usize) -> Self {
        self.config.pool.min_idle = min_idle;
        self
    }

    pub fn max_waiters(mut self, max_waiters: usize) -> Self {
        self.config.pool.max_waiters = max_waiters;
        self
    }

    pub fn fast_fail_after(mut self, after: Duration) -> Self {
        self.config.pool.fast_fail_after = after;
        self
    }

    pub fn health(mut self, health: HealthConfig) -> Self {
        self.config.health = health;
        self
    }

    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.config.health.probe_interval = interval;
        self
    }

    pub fn quarantine_threshold(mut self, threshold: u32) -> Self {
        self.config.health.quarantine_threshold = threshold;
        self
    }

    pub fn breaker(mut self, breaker: BreakerConfig) -> Self {
        self.config.breaker = breaker;
        self
    }

    pub fn breaker_threshold(mut self, threshold: u32) -> Self {
        self.config.breaker.failure_threshold = threshold;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.retry.request_timeout = timeout;
        self
    }

    pub fn discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.config.discovery = discovery;
        self
    }

    pub fn tend_interval(mut self, interval: Duration) -> Self {
        self.config.discovery.tend_interval = interval;
        self
    }

    pub fn routing(mut self, policy: RoutingPolicy) -> Self {
        self.config.routing = policy;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Immutable, versioned configuration captured by each operation
#[derive(Debug)]
pub struct ConfigSnapshot {
    /// Monotonic version, starting at 1
    pub version: u64,
    pub config: ClientConfig,
}

impl std::ops::Deref for ConfigSnapshot {
    type Target = ClientConfig;

    fn deref(&self) -> &ClientConfig {
        &self.config
    }
}

/// Holder of the active configuration snapshot
///
/// Readers `load()` the current snapshot without locking and keep the `Arc`
/// for the lifetime of their operation. Writers are serialised so the
/// current/previous pair is always updated together.
#[derive(Debug)]
pub struct ConfigStore {
    current: ArcSwap<ConfigSnapshot>,
    previous: ArcSwapOption<ConfigSnapshot>,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            current: ArcSwap::from_pointee(ConfigSnapshot { version: 1, config }),
            previous: ArcSwapOption::empty(),
            write_lock: Mutex::new(()),
        })
    }

    /// Current snapshot
    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Validate `config` and make it current; returns the new version
    pub fn swap(&self, config: ClientConfig) -> Result<u64> {
        config.validate()?;
        let _guard = self.write_lock.lock();
        let old = self.current.load_full();
        let version = old.version + 1;
        self.current
            .store(Arc::new(ConfigSnapshot { version, config }));
        self.previous.store(Some(old));
        Ok(version)
    }

    /// Restore the snapshot that was current before the last swap
    ///
    /// The restored snapshot keeps its original version number.
    pub fn rollback(&self) -> Result<u64> {
        let _guard = self.write_lock.lock();
        let previous = self.previous.swap(None).ok_or(ClientError::NothingToRollBack)?;
        let version = previous.version;
        self.current.store(previous);
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::builder()
            .max_connections(10)
            .min_idle(2)
            .quarantine_threshold(5)
            .breaker_threshold(4)
            .max_attempts(2)
            .routing(RoutingPolicy::LeastConnections)
            .build()
            .unwrap();

        assert_eq!(config.pool.max_connections, 10);
        assert_eq!(config.pool.min_idle, 2);
        assert_eq!(config.health.quarantine_threshold, 5);
        assert_eq!(config.breaker.failure_threshold, 4);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.routing, RoutingPolicy::LeastConnections);
    }

    #[test]
    fn test_builder_rejects_invalid_limits() {
        let err = ClientConfig::builder()
            .max_connections(2)
            .min_idle(3)
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfig(_)));

        assert!(ClientConfig::builder().quarantine_threshold(0).build().is_err());
        assert!(ClientConfig::builder().max_attempts(0).build().is_err());
    }

    #[test]
    fn test_config_serde_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"pool": {"max_connections": 4}}"#).unwrap();
        assert_eq!(config.pool.max_connections, 4);
        assert_eq!(config.pool.min_idle, PoolConfig::default().min_idle);
        assert_eq!(config.breaker, BreakerConfig::default());
    }

    #[test]
    fn test_store_swap_and_rollback() {
        let store = ConfigStore::new(ClientConfig::default()).unwrap();
        let first = store.load();
        assert_eq!(first.version, 1);

        let next = ClientConfig::builder().max_connections(3).build().unwrap();
        assert_eq!(store.swap(next).unwrap(), 2);

        // Captured snapshots never change underneath their holder
        assert_eq!(first.pool.max_connections, PoolConfig::default().max_connections);
        assert_eq!(store.load().pool.max_connections, 3);

        assert_eq!(store.rollback().unwrap(), 1);
        assert_eq!(store.load().pool.max_connections, 16);
        assert!(matches!(
            store.rollback(),
            Err(ClientError::NothingToRollBack)
        ));
    }

    #[test]
    fn test_store_rejects_invalid_swap() {
        let store = ConfigStore::new(ClientConfig::default()).unwrap();
        let mut bad = ClientConfig::default();
        bad.pool.max_connections = 0;
        assert!(store.swap(bad).is_err());
        assert_eq!(store.load().version, 1);
    }
}
