//! Node health tracking
//!
//! The monitor keeps one [`HealthRecord`] per node and drives the
//! `Healthy -> Suspect -> Quarantined -> Healthy` state machine from probe
//! results. It does not probe by itself: the manager's probe loop calls
//! [`HealthMonitor::due_for_probe`], runs the probe through the transport and
//! feeds the result back with [`HealthMonitor::record_probe`].
//!
//! ```text
//!  Healthy ──probe fails──▶ Suspect ──N consecutive failures──▶ Quarantined
//!     ▲                        │                                   │
//!     └──── probe succeeds ────┘◀── backoff expired, probe ok ─────┘
//! ```

use crate::clock::SharedClock;
use crate::config::HealthConfig;
use crate::node::NodeId;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Health state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Healthy,
    Suspect,
    Quarantined,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Suspect => "suspect",
            HealthState::Quarantined => "quarantined",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Probe answered with the observed round-trip latency
    Success(Duration),
    /// Probe failed or timed out
    Failure,
}

/// A state change produced by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub node: NodeId,
    pub from: HealthState,
    pub to: HealthState,
}

/// Per-node health record
#[derive(Debug, Clone, Default)]
pub struct HealthRecord {
    pub state: HealthState,
    pub consecutive_failures: u32,
    /// EWMA of successful probe latencies
    pub latency: Option<Duration>,
    /// Quarantine ends (probing resumes) at this instant
    pub backoff_until: Option<Instant>,
    /// Step used the next time quarantine is armed
    pub backoff_step: u32,
}

impl HealthRecord {
    fn arm_backoff(&mut self, now: Instant, config: &HealthConfig) {
        let delay = config.backoff.delay(self.backoff_step);
        self.backoff_until = Some(now + delay);
        self.backoff_step = self.backoff_step.saturating_add(1);
    }

    fn update_latency(&mut self, sample: Duration, alpha: f64) {
        self.latency = Some(match self.latency {
            None => sample,
            Some(prev) => {
                let ewma =
                    alpha * sample.as_nanos() as f64 + (1.0 - alpha) * prev.as_nanos() as f64;
                Duration::from_nanos(ewma.max(0.0).round() as u64)
            }
        });
    }

    fn score(&self) -> f64 {
        let base = match self.state {
            HealthState::Healthy => 1.0,
            HealthState::Suspect => 0.5,
            HealthState::Quarantined => return 0.0,
        };
        base / (1.0 + self.consecutive_failures as f64)
    }
}

/// Point-in-time view of one node's health
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub state: HealthState,
    pub latency: Option<Duration>,
    pub consecutive_failures: u32,
    /// 1.0 for a healthy node, 0.0 for a quarantined one
    pub score: f64,
}

/// Health monitor
#[derive(Debug)]
pub struct HealthMonitor {
    records: DashMap<NodeId, Arc<Mutex<HealthRecord>>>,
    clock: SharedClock,
}

impl HealthMonitor {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    fn record(&self, node: NodeId) -> Arc<Mutex<HealthRecord>> {
        self.records
            .entry(node)
            .or_insert_with(|| Arc::new(Mutex::new(HealthRecord::default())))
            .clone()
    }

    /// Start tracking `node` (new nodes start Healthy)
    pub fn track(&self, node: NodeId) {
        self.record(node);
    }

    /// Current state; untracked nodes are reported Healthy
    pub fn state(&self, node: NodeId) -> HealthState {
        self.records
            .get(&node)
            .map(|r| r.lock().state)
            .unwrap_or_default()
    }

    pub fn is_quarantined(&self, node: NodeId) -> bool {
        self.state(node) == HealthState::Quarantined
    }

    /// EWMA latency, if at least one probe succeeded
    pub fn latency(&self, node: NodeId) -> Option<Duration> {
        self.records.get(&node).and_then(|r| r.lock().latency)
    }

    pub fn snapshot(&self, node: NodeId) -> Option<HealthSnapshot> {
        self.records.get(&node).map(|r| {
            let r = r.lock();
            HealthSnapshot {
                state: r.state,
                latency: r.latency,
                consecutive_failures: r.consecutive_failures,
                score: r.score(),
            }
        })
    }

    /// Whether a probe should be sent now
    ///
    /// Quarantined nodes are left alone until their backoff expires.
    pub fn due_for_probe(&self, node: NodeId) -> bool {
        let Some(record) = self.records.get(&node).map(|r| Arc::clone(r.value())) else {
            return true;
        };
        let r = record.lock();
        match (r.state, r.backoff_until) {
            (HealthState::Quarantined, Some(until)) => self.clock.now() >= until,
            _ => true,
        }
    }

    /// Apply a probe result; returns the state transition, if any
    pub fn record_probe(
        &self,
        node: NodeId,
        outcome: ProbeOutcome,
        config: &HealthConfig,
    ) -> Option<Transition> {
        let record = self.record(node);
        let now = self.clock.now();
        let mut r = record.lock();
        let from = r.state;

        if from == HealthState::Quarantined && r.backoff_until.is_some_and(|until| now < until) {
            trace!(node_id = %node, "Ignoring probe result during quarantine backoff");
            return None;
        }

        match outcome {
            ProbeOutcome::Success(latency) => {
                r.update_latency(latency, config.ewma_alpha);
                r.consecutive_failures = 0;
                if from != HealthState::Healthy {
                    r.state = HealthState::Healthy;
                    r.backoff_until = None;
                    r.backoff_step = 0;
                }
            }
            ProbeOutcome::Failure => {
                r.consecutive_failures = r.consecutive_failures.saturating_add(1);
                match from {
                    HealthState::Quarantined => {
                        r.arm_backoff(now, config);
                        debug!(
                            node_id = %node,
                            step = r.backoff_step,
                            "Probe failed after quarantine backoff, extending"
                        );
                    }
                    _ if r.consecutive_failures >= config.quarantine_threshold => {
                        r.state = HealthState::Quarantined;
                        r.arm_backoff(now, config);
                    }
                    _ => r.state = HealthState::Suspect,
                }
            }
        }

        (r.state != from).then_some(Transition {
            node,
            from,
            to: r.state,
        })
    }

    /// Passive failure signal from a data operation
    ///
    /// Only moves a Healthy node to Suspect; quarantine is left to probes.
    pub fn report_request_failure(&self, node: NodeId) -> Option<Transition> {
        self.demote(node)
    }

    /// Discovery signal: the node was listed by peers but did not answer
    /// its own topology query
    pub fn report_unresponsive(&self, node: NodeId) -> Option<Transition> {
        let t = self.demote(node);
        if t.is_some() {
            debug!(node_id = %node, "Node missed a discovery round, marking suspect");
        }
        t
    }

    fn demote(&self, node: NodeId) -> Option<Transition> {
        let record = self.records.get(&node).map(|r| Arc::clone(r.value()))?;
        let mut r = record.lock();
        if r.state != HealthState::Healthy {
            return None;
        }
        r.state = HealthState::Suspect;
        Some(Transition {
            node,
            from: HealthState::Healthy,
            to: HealthState::Suspect,
        })
    }

    /// Drop records of nodes for which `keep` returns false
    pub fn retain(&self, mut keep: impl FnMut(NodeId) -> bool) {
        self.records.retain(|id, _| keep(*id));
    }

    pub fn tracked(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.records.iter().map(|r| *r.key()).collect();
        ids.sort_unstable();
        ids
    }
}
