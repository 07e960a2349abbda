//! Client metrics
//!
//! Thin facades over the `metrics` crate macros. With the `metrics` feature
//! disabled every call compiles to nothing; with it enabled the embedding
//! application decides where the values go by installing a recorder.
//!
//! ```rust,ignore
//! use shardline_client::observability::PoolMetrics;
//!
//! PoolMetrics::increment_exhausted(node_id);
//! PoolMetrics::record_acquire_wait(Duration::from_micros(150));
//! ```

use crate::node::NodeId;
use std::time::Duration;

// ============================================================================
// Pool Metrics
// ============================================================================

/// Connection pool metrics
pub struct PoolMetrics;

impl PoolMetrics {
    /// Connections opened (handshake completed)
    pub fn increment_connections_opened(node: NodeId) {
        #[cfg(feature = "metrics")]
        metrics::counter!("shardline_pool_connections_opened_total", "node" => node.to_string())
            .increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = node;
    }

    /// Connections closed instead of recycled
    pub fn increment_connections_closed(node: NodeId, reason: &'static str) {
        #[cfg(feature = "metrics")]
        metrics::counter!(
            "shardline_pool_connections_closed_total",
            "node" => node.to_string(),
            "reason" => reason
        )
        .increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = (node, reason);
    }

    /// Acquisitions rejected with `PoolExhausted`
    pub fn increment_exhausted(node: NodeId) {
        #[cfg(feature = "metrics")]
        metrics::counter!("shardline_pool_exhausted_total", "node" => node.to_string())
            .increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = node;
    }

    /// Time spent in `acquire`
    pub fn record_acquire_wait(duration: Duration) {
        #[cfg(feature = "metrics")]
        metrics::histogram!("shardline_pool_acquire_wait_seconds").record(duration.as_secs_f64());
        #[cfg(not(feature = "metrics"))]
        let _ = duration;
    }
}

// ============================================================================
// Routing / Failover Metrics
// ============================================================================

/// Request dispatch metrics
pub struct RoutingMetrics;

impl RoutingMetrics {
    pub fn increment_requests() {
        #[cfg(feature = "metrics")]
        metrics::counter!("shardline_requests_total").increment(1);
    }

    pub fn increment_failures(class: &'static str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("shardline_request_failures_total", "class" => class).increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = class;
    }

    pub fn increment_retries() {
        #[cfg(feature = "metrics")]
        metrics::counter!("shardline_request_retries_total").increment(1);
    }

    pub fn increment_degraded_routes() {
        #[cfg(feature = "metrics")]
        metrics::counter!("shardline_routing_degraded_total").increment(1);
    }

    pub fn increment_circuit_opened(node: NodeId) {
        #[cfg(feature = "metrics")]
        metrics::counter!("shardline_circuit_opened_total", "node" => node.to_string())
            .increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = node;
    }

    pub fn record_latency(duration: Duration) {
        #[cfg(feature = "metrics")]
        metrics::histogram!("shardline_request_latency_seconds").record(duration.as_secs_f64());
        #[cfg(not(feature = "metrics"))]
        let _ = duration;
    }
}

// ============================================================================
// Health Metrics
// ============================================================================

pub struct HealthMetrics;

impl HealthMetrics {
    pub fn increment_state_changes(state: &'static str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("shardline_node_state_changes_total", "state" => state).increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = state;
    }

    pub fn record_probe_latency(duration: Duration) {
        #[cfg(feature = "metrics")]
        metrics::histogram!("shardline_probe_latency_seconds").record(duration.as_secs_f64());
        #[cfg(not(feature = "metrics"))]
        let _ = duration;
    }

    pub fn increment_probe_failures(node: NodeId) {
        #[cfg(feature = "metrics")]
        metrics::counter!("shardline_probe_failures_total", "node" => node.to_string())
            .increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = node;
    }
}

// ============================================================================
// Discovery Metrics
// ============================================================================

pub struct DiscoveryMetrics;

impl DiscoveryMetrics {
    pub fn set_view_generation(generation: u64) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("shardline_view_generation").set(generation as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = generation;
    }

    pub fn set_node_count(count: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("shardline_view_node_count").set(count as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = count;
    }

    pub fn increment_refresh_failures() {
        #[cfg(feature = "metrics")]
        metrics::counter!("shardline_discovery_failures_total").increment(1);
    }

    pub fn record_refresh_duration(duration: Duration) {
        #[cfg(feature = "metrics")]
        metrics::histogram!("shardline_discovery_refresh_seconds").record(duration.as_secs_f64());
        #[cfg(not(feature = "metrics"))]
        let _ = duration;
    }
}
