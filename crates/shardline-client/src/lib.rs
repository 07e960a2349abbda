//! # Shardline Client
//!
//! Cluster-aware client runtime for a partitioned key-value store:
//! - **Discovery**: Seed bootstrap and periodic topology refresh into immutable views
//! - **Health**: Active probes, passive failure signals and quarantine with backoff
//! - **Pooling**: Bounded per-node connection pools with FIFO waiters
//! - **Routing**: Partition-aware replica selection under pluggable policies
//! - **Failover**: Circuit breakers and deadline-bounded retries
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ClusterManager                         │
//! ├──────────────┬──────────────┬──────────────┬────────────────┤
//! │  Discovery   │    Health    │   Routing    │    Failover    │
//! │  ViewStore   │   Monitor    │   Router     │   Breakers     │
//! ├──────────────┼──────────────┼──────────────┼────────────────┤
//! │ • Seeds      │ • Probes     │ • Partitions │ • Admission    │
//! │ • Topology   │ • EWMA       │ • Policies   │ • Retry budget │
//! │ • Generation │ • Quarantine │ • Degraded   │ • Deadlines    │
//! └──────────────┴──────┬───────┴──────┬───────┴────────────────┘
//!                       │              │
//!                 ┌─────▼──────────────▼─────┐
//!                 │  NodePool (per node)     │
//!                 └────────────┬─────────────┘
//!                              │
//!                        dyn Transport
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use shardline_client::prelude::*;
//!
//! let config = ClientConfig::builder()
//!     .routing(RoutingPolicy::LeastConnections)
//!     .build()?;
//! let bootstrap = Bootstrap::new(["10.0.0.1:7000", "10.0.0.2:7000"]);
//!
//! let client = ClusterManager::new(config, bootstrap, Arc::new(MyTransport::default()))?;
//! client.start().await?;
//!
//! let value = client
//!     .execute(b"user:42", Operation::new("get", Bytes::new()).idempotent())
//!     .await?;
//!
//! client.shutdown().await;
//! ```

pub mod backoff;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod failover;
pub mod health;
pub mod manager;
pub mod node;
pub mod observability;
pub mod partitioner;
pub mod pool;
pub mod routing;
pub mod transport;
pub mod view;

// Re-export main types
pub use backoff::BackoffConfig;
pub use breaker::{BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    BreakerConfig, ClientConfig, ClientConfigBuilder, ConfigSnapshot, ConfigStore,
    DiscoveryConfig, HealthConfig, PoolConfig, RetryConfig,
};
pub use discovery::{merge_reports, PollingDiscovery, ViewSource};
pub use error::{ClassifiedError, ClientError, DiscoveryError, ErrorClass, FailureClass, Result};
pub use events::{
    ClientEvent, EventSink, NoopEventSink, RefreshOutcome, SharedEventSink, TracingEventSink,
};
pub use failover::FailoverController;
pub use health::{HealthMonitor, HealthSnapshot, HealthState, ProbeOutcome};
pub use manager::{
    Bootstrap, ClientStats, ClusterHealth, ClusterManager, ClusterManagerBuilder, NodeStats,
};
pub use node::{Node, NodeId, NodeInfo, NodeStatus, TlsHandle};
pub use observability::{DiscoveryMetrics, HealthMetrics, PoolMetrics, RoutingMetrics};
pub use partitioner::{Murmur2Partitioner, Partitioner};
pub use pool::{AcquireError, ConnectionHandle, NodePool, PoolStats, ReleaseOutcome};
pub use routing::{RouteDecision, Router, RoutingPolicy};
pub use transport::{Operation, PartitionOwnership, TopologyReport, Transport};
pub use view::{ClusterView, PartitionEntry, PartitionId, PartitionMap, ViewStore};

/// Re-export common types
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::manager::{Bootstrap, ClusterManager};
    pub use crate::node::*;
    pub use crate::routing::RoutingPolicy;
    pub use crate::transport::*;
    pub use bytes::Bytes;
    pub use std::sync::Arc;
}
