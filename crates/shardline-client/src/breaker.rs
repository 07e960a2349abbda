//! Circuit breakers
//!
//! One breaker per node, or per (node, operation class) when
//! `breaker.per_operation_class` is set. Breakers are evaluated lazily: the
//! open backoff is a timestamp compared on every admission, no timer task
//! is involved.
//!
//! Admission returns a [`BreakerPermit`] that must be resolved with the
//! outcome of the call. A half-open breaker hands out exactly one trial
//! permit; dropping that permit without an outcome frees the trial slot.

use crate::config::BreakerConfig;
use crate::node::NodeId;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation
    Closed,
    /// Calls are rejected until the backoff expires
    Open,
    /// A single trial call decides between Closed and Open
    HalfOpen,
}

/// Breaker state change caused by a call outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    Opened { retry_in: Duration },
    Closed,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
    open_until: Option<Instant>,
    backoff: Duration,
    step: u32,
    trial_in_flight: bool,
}

impl BreakerInner {
    fn open(&mut self, now: Instant, config: &BreakerConfig) -> Duration {
        let backoff = config.backoff.delay(self.step);
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.open_until = Some(now + backoff);
        self.backoff = backoff;
        self.step = self.step.saturating_add(1);
        self.trial_in_flight = false;
        backoff
    }
}

/// Circuit breaker for one node (and optionally one operation class)
#[derive(Debug)]
pub struct CircuitBreaker {
    node: NodeId,
    class: Option<String>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(node: NodeId, class: Option<String>) -> Self {
        Self {
            node,
            class,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                opened_at: None,
                open_until: None,
                backoff: Duration::ZERO,
                step: 0,
                trial_in_flight: false,
            }),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn class(&self) -> Option<&str> {
        self.class.as_deref()
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }

    /// When the breaker last opened
    pub fn opened_at(&self) -> Option<Instant> {
        self.inner.lock().opened_at
    }

    /// Whether a call made at `now` would be rejected
    pub fn rejects(&self, now: Instant) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => inner.open_until.is_some_and(|until| now < until),
            BreakerState::HalfOpen => inner.trial_in_flight,
        }
    }

    /// Admit a call or reject it with the time left until the next trial
    pub fn try_acquire(self: &Arc<Self>, now: Instant) -> Result<BreakerPermit, Duration> {
        let mut inner = self.inner.lock();
        let trial = match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let until = inner.open_until.unwrap_or(now);
                if now < until {
                    return Err(until - now);
                }
                debug!(node_id = %self.node, "Circuit half-open, admitting trial call");
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = true;
                true
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(inner.backoff);
                }
                inner.trial_in_flight = true;
                true
            }
        };
        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            trial,
            resolved: false,
        })
    }

    fn on_success(&self, trial: bool) -> Option<BreakerTransition> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failures = 0;
                None
            }
            BreakerState::HalfOpen if trial => {
                inner.state = BreakerState::Closed;
                inner.failures = 0;
                inner.step = 0;
                inner.opened_at = None;
                inner.open_until = None;
                inner.trial_in_flight = false;
                Some(BreakerTransition::Closed)
            }
            // Late outcome of a call admitted before the breaker opened
            _ => None,
        }
    }

    fn on_failure(
        &self,
        trial: bool,
        now: Instant,
        config: &BreakerConfig,
    ) -> Option<BreakerTransition> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failures = inner.failures.saturating_add(1);
                (inner.failures >= config.failure_threshold).then(|| BreakerTransition::Opened {
                    retry_in: inner.open(now, config),
                })
            }
            BreakerState::HalfOpen if trial => Some(BreakerTransition::Opened {
                retry_in: inner.open(now, config),
            }),
            _ => None,
        }
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }
}

/// Admission ticket for one call
#[derive(Debug)]
#[must_use = "a permit must be resolved with the call outcome"]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    resolved: bool,
}

impl BreakerPermit {
    /// Whether this permit is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn success(mut self) -> Option<BreakerTransition> {
        self.resolved = true;
        self.breaker.on_success(self.trial)
    }

    /// Record a transient failure
    pub fn failure(mut self, now: Instant, config: &BreakerConfig) -> Option<BreakerTransition> {
        self.resolved = true;
        self.breaker.on_failure(self.trial, now, config)
    }

    /// Resolve without counting (permanent or pool errors)
    pub fn neutral(self) {}
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial();
        }
    }
}

/// Breaker summary for introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub class: Option<String>,
    pub state: BreakerState,
    pub failures: u32,
}

type BreakerKey = (NodeId, Option<String>);

/// All breakers of one client, keyed by node and optional operation class
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: DashMap<BreakerKey, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(node: NodeId, class: &str, config: &BreakerConfig) -> BreakerKey {
        (node, config.per_operation_class.then(|| class.to_string()))
    }

    /// Breaker guarding calls of `class` to `node`
    pub fn get(&self, node: NodeId, class: &str, config: &BreakerConfig) -> Arc<CircuitBreaker> {
        let key = Self::key(node, class, config);
        let scope = key.1.clone();
        self.breakers
            .entry(key)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(node, scope)))
            .clone()
    }

    /// Whether a call of `class` to `node` would currently be rejected
    pub fn rejects(&self, node: NodeId, class: &str, config: &BreakerConfig, now: Instant) -> bool {
        self.breakers
            .get(&Self::key(node, class, config))
            .is_some_and(|b| b.rejects(now))
    }

    pub fn snapshot(&self, node: NodeId) -> Vec<BreakerSnapshot> {
        let mut out: Vec<_> = self
            .breakers
            .iter()
            .filter(|e| e.key().0 == node)
            .map(|e| BreakerSnapshot {
                class: e.key().1.clone(),
                state: e.value().state(),
                failures: e.value().failures(),
            })
            .collect();
        out.sort_by(|a, b| a.class.cmp(&b.class));
        out
    }

    /// Drop breakers of nodes for which `keep` returns false
    pub fn retain(&self, mut keep: impl FnMut(NodeId) -> bool) {
        self.breakers.retain(|(node, _), _| keep(*node));
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
