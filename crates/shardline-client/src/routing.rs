//! Replica selection
//!
//! [`RoutingPolicy`] picks one node out of a candidate list; [`Router`] builds
//! that list for a partition from the current view, health state and breaker
//! state, and falls back to cluster-wide degraded routing when every replica
//! of the partition is quarantined.

use crate::error::{ClientError, Result};
use crate::health::HealthState;
use crate::node::NodeId;
use crate::view::{ClusterView, PartitionId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Node selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Rotate through eligible replicas
    #[default]
    RoundRobin,
    /// Fewest active leases plus queued waiters
    LeastConnections,
    /// Lowest latency estimate; candidates within `epsilon` of the best are
    /// treated as equal and compared by load
    LatencyAware { epsilon: Duration },
}

impl RoutingPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            RoutingPolicy::RoundRobin => "round_robin",
            RoutingPolicy::LeastConnections => "least_connections",
            RoutingPolicy::LatencyAware { .. } => "latency_aware",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            RoutingPolicy::LatencyAware { epsilon } if *epsilon > Duration::from_secs(60) => Err(
                ClientError::InvalidConfig("routing.epsilon must be <= 60s".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Pick a node; quarantined candidates are never returned
    pub fn select(&self, cursor: &AtomicUsize, candidates: &[Candidate]) -> Option<NodeId> {
        let eligible: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.state != HealthState::Quarantined)
            .collect();
        if eligible.is_empty() {
            return None;
        }

        match self {
            RoutingPolicy::RoundRobin => {
                let start = cursor.fetch_add(1, Ordering::Relaxed);
                Some(eligible[start % eligible.len()].node)
            }
            RoutingPolicy::LeastConnections => least_loaded(cursor, &eligible),
            RoutingPolicy::LatencyAware { epsilon } => {
                let measured: Vec<(&Candidate, Duration)> = eligible
                    .iter()
                    .filter(|c| c.state == HealthState::Healthy)
                    .filter_map(|c| c.latency.map(|l| (*c, l)))
                    .collect();
                let Some(best) = measured.iter().map(|(_, l)| *l).min() else {
                    return least_loaded(cursor, &eligible);
                };
                let close: Vec<&Candidate> = measured
                    .iter()
                    .filter(|(_, l)| *l <= best + *epsilon)
                    .map(|(c, _)| *c)
                    .collect();
                least_loaded(cursor, &close)
            }
        }
    }
}

/// Lowest load wins; equal loads rotate with the cursor
fn least_loaded(cursor: &AtomicUsize, candidates: &[&Candidate]) -> Option<NodeId> {
    let min = candidates.iter().map(|c| c.load).min()?;
    let tied: Vec<&&Candidate> = candidates.iter().filter(|c| c.load == min).collect();
    let pick = cursor.fetch_add(1, Ordering::Relaxed) % tied.len();
    Some(tied[pick].node)
}

/// Routing inputs for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub node: NodeId,
    pub state: HealthState,
    /// EWMA probe latency, if known
    pub latency: Option<Duration>,
    /// Active leases plus queued waiters
    pub load: usize,
}

/// Per-node signals the router reads when building candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSignals {
    pub state: HealthState,
    pub latency: Option<Duration>,
    pub load: usize,
    /// The node's circuit breaker would reject a call right now
    pub breaker_rejects: bool,
}

/// Outcome of a routing decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDecision {
    pub partition: PartitionId,
    pub node: NodeId,
    /// Chosen outside the partition's replica set
    pub degraded: bool,
}

/// Partition-aware router
#[derive(Debug, Default)]
pub struct Router {
    cursors: DashMap<PartitionId, AtomicUsize>,
    degraded_cursor: AtomicUsize,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a node for `partition` in `view`
    pub fn route(
        &self,
        view: &ClusterView,
        partition: PartitionId,
        policy: &RoutingPolicy,
        signals: impl Fn(NodeId) -> NodeSignals,
    ) -> Result<RouteDecision> {
        let entry = view
            .partitions()
            .get(partition)
            .ok_or_else(|| ClientError::StaleRouting {
                partition,
                generation: view.generation(),
            })?;

        let replicas = entry
            .replicas
            .iter()
            .copied()
            .filter(|id| view.contains(*id));
        if let Some(node) = self.select_tiered(policy, partition, replicas, &signals) {
            return Ok(RouteDecision {
                partition,
                node,
                degraded: false,
            });
        }

        self.select_degraded(policy, view.node_ids(), &signals)
            .map(|node| RouteDecision {
                partition,
                node,
                degraded: true,
            })
            .ok_or(ClientError::NoAvailableNode { partition })
    }

    fn select_tiered(
        &self,
        policy: &RoutingPolicy,
        partition: PartitionId,
        nodes: impl Iterator<Item = NodeId>,
        signals: &impl Fn(NodeId) -> NodeSignals,
    ) -> Option<NodeId> {
        let (preferred, fallback) = tiers(nodes, signals);
        let cursor = self
            .cursors
            .entry(partition)
            .or_insert_with(|| AtomicUsize::new(0));
        policy
            .select(&cursor, &preferred)
            .or_else(|| policy.select(&cursor, &fallback))
    }

    fn select_degraded(
        &self,
        policy: &RoutingPolicy,
        nodes: impl Iterator<Item = NodeId>,
        signals: &impl Fn(NodeId) -> NodeSignals,
    ) -> Option<NodeId> {
        let (preferred, fallback) = tiers(nodes, signals);
        policy
            .select(&self.degraded_cursor, &preferred)
            .or_else(|| policy.select(&self.degraded_cursor, &fallback))
    }
}

/// Split non-quarantined nodes by whether their breaker admits calls
fn tiers(
    nodes: impl Iterator<Item = NodeId>,
    signals: &impl Fn(NodeId) -> NodeSignals,
) -> (Vec<Candidate>, Vec<Candidate>) {
    let mut preferred = Vec::new();
    let mut fallback = Vec::new();
    for node in nodes {
        let s = signals(node);
        if s.state == HealthState::Quarantined {
            continue;
        }
        let candidate = Candidate {
            node,
            state: s.state,
            latency: s.latency,
            load: s.load,
        };
        if s.breaker_rejects {
            fallback.push(candidate);
        } else {
            preferred.push(candidate);
        }
    }
    (preferred, fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, NodeInfo};
    use crate::view::{PartitionEntry, PartitionMap, ViewStore};
    use rand::Rng;
    use std::collections::HashMap;

    fn candidate(id: u64, state: HealthState, latency_ms: Option<u64>, load: usize) -> Candidate {
        Candidate {
            node: NodeId(id),
            state,
            latency: latency_ms.map(Duration::from_millis),
            load,
        }
    }

    fn healthy(id: u64) -> Candidate {
        candidate(id, HealthState::Healthy, None, 0)
    }

    fn view(nodes: &[u64], partitions: &[(PartitionId, &[u64])]) -> std::sync::Arc<ClusterView> {
        let mut map = PartitionMap::new(partitions.len() as u32);
        for (p, replicas) in partitions {
            map.insert(
                *p,
                PartitionEntry {
                    replicas: replicas.iter().copied().map(NodeId).collect(),
                    generation: 1,
                    source: NodeId(replicas[0]),
                },
            );
        }
        let nodes = nodes
            .iter()
            .map(|id| Node::new(NodeInfo::new(*id, format!("10.0.0.{id}:7000")), None));
        ViewStore::new().publish(ClusterView::new(nodes, map))
    }

    fn signals_from(
        states: HashMap<u64, HealthState>,
    ) -> impl Fn(NodeId) -> NodeSignals {
        move |id| NodeSignals {
            state: states.get(&id.0).copied().unwrap_or_default(),
            latency: None,
            load: 0,
            breaker_rejects: false,
        }
    }

    #[test]
    fn test_round_robin_skips_quarantined() {
        let cursor = AtomicUsize::new(0);
        let candidates = [
            healthy(1),
            candidate(2, HealthState::Quarantined, None, 0),
            healthy(3),
        ];
        let picks: Vec<_> = (0..4)
            .map(|_| RoutingPolicy::RoundRobin.select(&cursor, &candidates).unwrap())
            .collect();
        assert_eq!(picks, vec![NodeId(1), NodeId(3), NodeId(1), NodeId(3)]);
    }

    #[test]
    fn test_least_connections_prefers_low_load_and_rotates_ties() {
        let cursor = AtomicUsize::new(0);
        let candidates = [
            candidate(1, HealthState::Healthy, None, 4),
            candidate(2, HealthState::Healthy, None, 1),
            candidate(3, HealthState::Suspect, None, 1),
        ];
        let first = RoutingPolicy::LeastConnections
            .select(&cursor, &candidates)
            .unwrap();
        let second = RoutingPolicy::LeastConnections
            .select(&cursor, &candidates)
            .unwrap();
        assert_ne!(first, NodeId(1));
        assert_ne!(second, NodeId(1));
        assert_ne!(first, second);
    }

    #[test]
    fn test_latency_aware_epsilon_and_fallback() {
        let cursor = AtomicUsize::new(0);
        let policy = RoutingPolicy::LatencyAware {
            epsilon: Duration::from_millis(2),
        };

        let candidates = [
            candidate(1, HealthState::Healthy, Some(10), 0),
            candidate(2, HealthState::Healthy, Some(3), 5),
            candidate(3, HealthState::Healthy, Some(4), 1),
            candidate(4, HealthState::Suspect, Some(1), 0),
        ];
        // 2 and 3 are within epsilon; 3 carries less load; 4 is not Healthy
        assert_eq!(policy.select(&cursor, &candidates), Some(NodeId(3)));

        // No latency estimates: least connections over everyone eligible
        let unknown = [
            candidate(1, HealthState::Healthy, None, 3),
            candidate(2, HealthState::Suspect, None, 0),
        ];
        assert_eq!(policy.select(&cursor, &unknown), Some(NodeId(2)));
    }

    #[test]
    fn test_select_never_returns_quarantined() {
        let mut rng = rand::thread_rng();
        let policies = [
            RoutingPolicy::RoundRobin,
            RoutingPolicy::LeastConnections,
            RoutingPolicy::LatencyAware {
                epsilon: Duration::from_millis(1),
            },
        ];
        let cursor = AtomicUsize::new(0);
        for _ in 0..500 {
            let candidates: Vec<_> = (0..rng.gen_range(0..6u64))
                .map(|id| {
                    let state = match rng.gen_range(0..3) {
                        0 => HealthState::Healthy,
                        1 => HealthState::Suspect,
                        _ => HealthState::Quarantined,
                    };
                    let latency = rng.gen_bool(0.5).then(|| rng.gen_range(1..20));
                    candidate(id, state, latency, rng.gen_range(0..4))
                })
                .collect();
            for policy in &policies {
                match policy.select(&cursor, &candidates) {
                    Some(id) => {
                        let c = candidates.iter().find(|c| c.node == id).unwrap();
                        assert_ne!(c.state, HealthState::Quarantined);
                    }
                    None => assert!(candidates
                        .iter()
                        .all(|c| c.state == HealthState::Quarantined)),
                }
            }
        }
    }

    #[test]
    fn test_route_missing_partition_is_stale() {
        let view = view(&[1, 2], &[(0, &[1, 2])]);
        let err = Router::new()
            .route(&view, 5, &RoutingPolicy::RoundRobin, signals_from(HashMap::new()))
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::StaleRouting {
                partition: 5,
                generation: 1
            }
        ));
    }

    #[test]
    fn test_route_degrades_then_fails() {
        let view = view(&[1, 2, 3], &[(0, &[1, 2])]);
        let router = Router::new();

        let states = HashMap::from([
            (1, HealthState::Quarantined),
            (2, HealthState::Quarantined),
        ]);
        let decision = router
            .route(&view, 0, &RoutingPolicy::RoundRobin, signals_from(states))
            .unwrap();
        assert_eq!(decision.node, NodeId(3));
        assert!(decision.degraded);

        let all = HashMap::from([
            (1, HealthState::Quarantined),
            (2, HealthState::Quarantined),
            (3, HealthState::Quarantined),
        ]);
        let err = router
            .route(&view, 0, &RoutingPolicy::RoundRobin, signals_from(all))
            .unwrap_err();
        assert!(matches!(err, ClientError::NoAvailableNode { partition: 0 }));
    }

    #[test]
    fn test_route_ignores_replicas_missing_from_view() {
        let view = view(&[2, 3], &[(0, &[1, 2])]);
        let router = Router::new();
        for _ in 0..4 {
            let d = router
                .route(&view, 0, &RoutingPolicy::RoundRobin, signals_from(HashMap::new()))
                .unwrap();
            assert_eq!(d.node, NodeId(2));
            assert!(!d.degraded);
        }
    }

    #[test]
    fn test_route_deprioritises_open_breakers() {
        let view = view(&[1, 2], &[(0, &[1, 2])]);
        let router = Router::new();
        let open_on_1 = |id: NodeId| NodeSignals {
            state: HealthState::Healthy,
            latency: None,
            load: 0,
            breaker_rejects: id == NodeId(1),
        };
        for _ in 0..4 {
            let d = router
                .route(&view, 0, &RoutingPolicy::RoundRobin, open_on_1)
                .unwrap();
            assert_eq!(d.node, NodeId(2));
        }

        let all_open = |_| NodeSignals {
            state: HealthState::Healthy,
            latency: None,
            load: 0,
            breaker_rejects: true,
        };
        let d = router
            .route(&view, 0, &RoutingPolicy::RoundRobin, all_open)
            .unwrap();
        assert!(!d.degraded);
    }

    #[test]
    fn test_policy_serde() {
        let json = r#"{"policy":"latency_aware","epsilon":{"secs":0,"nanos":2000000}}"#;
        let policy: RoutingPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(
            policy,
            RoutingPolicy::LatencyAware {
                epsilon: Duration::from_millis(2)
            }
        );
        assert_eq!(policy.name(), "latency_aware");
        assert!(RoutingPolicy::LatencyAware {
            epsilon: Duration::from_secs(120)
        }
        .validate()
        .is_err());
    }
}
