//! Failure containment around routed calls
//!
//! [`FailoverController`] combines breaker admission with the retry policy.
//! The dispatch path calls [`FailoverController::admit`] before touching the
//! network, resolves the permit with [`FailoverController::settle`] once the
//! attempt finishes, and wraps the whole sequence of attempts in
//! [`FailoverController::run`], which decides whether and when to retry.

use crate::breaker::{BreakerPermit, BreakerRegistry, BreakerTransition};
use crate::clock::SharedClock;
use crate::config::{BreakerConfig, RetryConfig};
use crate::error::{ClientError, ErrorClass, Result};
use crate::events::{ClientEvent, SharedEventSink};
use crate::node::NodeId;
use crate::observability::RoutingMetrics;
use crate::transport::Operation;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Breaker admission plus retry policy
#[derive(Debug)]
pub struct FailoverController {
    breakers: BreakerRegistry,
    clock: SharedClock,
    events: SharedEventSink,
}

impl FailoverController {
    pub fn new(clock: SharedClock, events: SharedEventSink) -> Self {
        Self {
            breakers: BreakerRegistry::new(),
            clock,
            events,
        }
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Whether a call of `class` to `node` would be rejected right now
    pub fn rejects(&self, node: NodeId, class: &str, config: &BreakerConfig) -> bool {
        self.breakers.rejects(node, class, config, self.clock.now())
    }

    /// Ask the node's breaker for permission to make a call
    pub fn admit(
        &self,
        node: NodeId,
        op: &Operation,
        config: &BreakerConfig,
    ) -> Result<BreakerPermit> {
        let breaker = self.breakers.get(node, &op.class, config);
        breaker
            .try_acquire(self.clock.now())
            .map_err(|retry_in| ClientError::CircuitOpen { node, retry_in })
    }

    /// Resolve a permit with the attempt outcome
    ///
    /// Only transient failures count against the breaker.
    pub fn settle<T>(&self, permit: BreakerPermit, outcome: &Result<T>, config: &BreakerConfig) {
        let breaker = Arc::clone(permit.breaker());
        let transition = match outcome {
            Ok(_) => permit.success(),
            Err(err) if err.class() == ErrorClass::Transient => {
                permit.failure(self.clock.now(), config)
            }
            Err(_) => {
                permit.neutral();
                None
            }
        };

        let node = breaker.node();
        let class = breaker.class().map(str::to_string);
        match transition {
            Some(BreakerTransition::Opened { retry_in }) => {
                self.events.emit(ClientEvent::CircuitOpened {
                    node,
                    class,
                    retry_in,
                });
            }
            Some(BreakerTransition::Closed) => {
                self.events.emit(ClientEvent::CircuitClosed { node, class });
            }
            None => {}
        }
    }

    /// Delay before the next attempt, or `None` if the error must surface
    pub fn next_delay(
        &self,
        err: &ClientError,
        op: &Operation,
        config: &RetryConfig,
        attempt: u32,
        deadline: Instant,
    ) -> Option<Duration> {
        if !err.is_retriable() || !op.is_retryable() || attempt >= config.max_attempts {
            return None;
        }
        let delay = config.backoff.delay(attempt.saturating_sub(1));
        (self.clock.now() + delay < deadline).then_some(delay)
    }

    /// Run `attempt` until it succeeds or the retry policy gives up
    ///
    /// `attempt` receives the 1-based attempt number and must route afresh
    /// on every call.
    pub async fn run<T, F, Fut>(
        &self,
        op: &Operation,
        config: &RetryConfig,
        deadline: Instant,
        mut attempt: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut n = 0;
        loop {
            n += 1;
            let err = match attempt(n).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            RoutingMetrics::increment_failures(class_label(err.class()));

            let Some(delay) = self.next_delay(&err, op, config, n, deadline) else {
                return Err(err);
            };
            RoutingMetrics::increment_retries();
            debug!(
                attempt = n,
                class = %op.class,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying operation"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Drop breakers of nodes for which `keep` returns false
    pub fn retain(&self, keep: impl FnMut(NodeId) -> bool) {
        self.breakers.retain(keep);
    }
}

fn class_label(class: ErrorClass) -> &'static str {
    match class {
        ErrorClass::Transient => "transient",
        ErrorClass::Permanent => "permanent",
        ErrorClass::PoolExhausted => "pool_exhausted",
        ErrorClass::CircuitOpen => "circuit_open",
        ErrorClass::NoAvailableNode => "no_available_node",
        ErrorClass::StaleRouting => "stale_routing",
        ErrorClass::Discovery => "discovery",
        ErrorClass::Usage => "usage",
    }
}
