//! Client events
//!
//! Everything the embedding application may want to observe is emitted as a
//! [`ClientEvent`] into an [`EventSink`]. The default sink logs through
//! `tracing` and updates the metric facades; applications can forward events
//! to their own telemetry by implementing the trait.

use crate::health::HealthState;
use crate::node::NodeId;
use crate::observability::{DiscoveryMetrics, HealthMetrics, PoolMetrics, RoutingMetrics};
use crate::view::PartitionId;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Observable client event
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Health state transition
    NodeStateChanged {
        node: NodeId,
        from: HealthState,
        to: HealthState,
    },
    /// A breaker tripped (or re-opened after a failed trial)
    CircuitOpened {
        node: NodeId,
        class: Option<String>,
        retry_in: Duration,
    },
    /// A half-open trial succeeded
    CircuitClosed { node: NodeId, class: Option<String> },
    /// An acquisition was rejected by pool backpressure
    PoolExhausted { node: NodeId, waiters: usize },
    /// A replica was selected for a request
    RoutingDecision {
        partition: PartitionId,
        node: NodeId,
        policy: &'static str,
        degraded: bool,
    },
    /// Result of one discovery round
    DiscoveryRefresh {
        generation: u64,
        nodes: usize,
        partitions: usize,
        outcome: RefreshOutcome,
    },
}

/// Outcome of a discovery round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new view was published
    Published,
    /// A newer view was already published by a concurrent refresh
    Coalesced,
    /// No node answered; the previous view stays current
    Failed(String),
}

/// Receiver of client events
///
/// Called inline on the emitting task; implementations must not block.
pub trait EventSink: Send + Sync + fmt::Debug {
    fn emit(&self, event: ClientEvent);
}

pub type SharedEventSink = Arc<dyn EventSink>;

/// Default sink: structured logs plus metrics
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: ClientEvent) {
        match event {
            ClientEvent::NodeStateChanged { node, from, to } => {
                HealthMetrics::increment_state_changes(to.as_str());
                if to == HealthState::Quarantined {
                    warn!(node_id = %node, from = %from, to = %to, "Node quarantined");
                } else {
                    info!(node_id = %node, from = %from, to = %to, "Node state changed");
                }
            }
            ClientEvent::CircuitOpened {
                node,
                class,
                retry_in,
            } => {
                RoutingMetrics::increment_circuit_opened(node);
                warn!(
                    node_id = %node,
                    class = class.as_deref().unwrap_or("*"),
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Circuit opened"
                );
            }
            ClientEvent::CircuitClosed { node, class } => {
                info!(node_id = %node, class = class.as_deref().unwrap_or("*"), "Circuit closed");
            }
            ClientEvent::PoolExhausted { node, waiters } => {
                PoolMetrics::increment_exhausted(node);
                debug!(node_id = %node, waiters, "Connection pool exhausted");
            }
            ClientEvent::RoutingDecision {
                partition,
                node,
                policy,
                degraded,
            } => {
                if degraded {
                    RoutingMetrics::increment_degraded_routes();
                    debug!(partition, node_id = %node, policy, "Degraded routing");
                } else {
                    trace!(partition, node_id = %node, policy, "Routed request");
                }
            }
            ClientEvent::DiscoveryRefresh {
                generation,
                nodes,
                partitions,
                outcome,
            } => match outcome {
                RefreshOutcome::Published => {
                    DiscoveryMetrics::set_view_generation(generation);
                    DiscoveryMetrics::set_node_count(nodes);
                    debug!(generation, nodes, partitions, "Published cluster view");
                }
                RefreshOutcome::Coalesced => {
                    trace!(generation, "Refresh coalesced with a newer view");
                }
                RefreshOutcome::Failed(reason) => {
                    DiscoveryMetrics::increment_refresh_failures();
                    warn!(generation, error = %reason, "Discovery refresh failed");
                }
            },
        }
    }
}

/// Sink that discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: ClientEvent) {}
}
