//! Client error types

use crate::node::NodeId;
use std::time::Duration;
use thiserror::Error;

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Error classification used for propagation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Timeouts, resets: retryable per policy
    Transient,
    /// Authentication failures, malformed requests: never retried
    Permanent,
    /// A pool limit was reached
    PoolExhausted,
    /// The node is currently excluded by its circuit breaker
    CircuitOpen,
    /// Routing found no eligible replica
    NoAvailableNode,
    /// The partition map lacks the needed entry
    StaleRouting,
    /// Topology discovery failed
    Discovery,
    /// Invalid configuration or client lifecycle misuse
    Usage,
}

/// Failure class reported by a [`Transport`](crate::transport::Transport)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

/// Classified error returned by transport implementations
#[derive(Debug, Clone, Error)]
#[error("{class:?} failure: {message}")]
pub struct ClassifiedError {
    pub class: FailureClass,
    pub message: String,
}

impl ClassifiedError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class == FailureClass::Transient
    }
}

/// Discovery errors
#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    #[error("no node answered the topology query ({queried} queried)")]
    NoResponders { queried: usize },

    #[error("no seed or known node to query")]
    NothingToQuery,
}

/// Client errors
///
/// Every variant is safe to log: none carries credential or certificate
/// material.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    // ==================== Operation Errors ====================
    #[error("transient failure on {node}: {reason}")]
    Transient { node: NodeId, reason: String },

    #[error("permanent failure on {node}: {reason}")]
    Permanent { node: NodeId, reason: String },

    #[error("timed out after {waited:?} waiting on {node}")]
    Timeout { node: NodeId, waited: Duration },

    // ==================== Resource Errors ====================
    #[error("connection pool for {node} exhausted ({waiters} waiters queued)")]
    PoolExhausted { node: NodeId, waiters: usize },

    #[error("circuit open for {node}, retry in {retry_in:?}")]
    CircuitOpen { node: NodeId, retry_in: Duration },

    // ==================== Routing Errors ====================
    #[error("no available node for partition {partition}")]
    NoAvailableNode { partition: u32 },

    #[error("partition {partition} missing from partition map (generation {generation})")]
    StaleRouting { partition: u32, generation: u64 },

    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    // ==================== Usage Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no previous configuration to roll back to")]
    NothingToRollBack,

    #[error("client is shutting down")]
    ShuttingDown,
}

impl ClientError {
    /// Wrap a transport failure observed on `node`
    pub fn from_transport(node: NodeId, err: ClassifiedError) -> Self {
        match err.class {
            FailureClass::Transient => ClientError::Transient {
                node,
                reason: err.message,
            },
            FailureClass::Permanent => ClientError::Permanent {
                node,
                reason: err.message,
            },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ClientError::Transient { .. } | ClientError::Timeout { .. } => ErrorClass::Transient,
            ClientError::Permanent { .. } => ErrorClass::Permanent,
            ClientError::PoolExhausted { .. } => ErrorClass::PoolExhausted,
            ClientError::CircuitOpen { .. } => ErrorClass::CircuitOpen,
            ClientError::NoAvailableNode { .. } => ErrorClass::NoAvailableNode,
            ClientError::StaleRouting { .. } => ErrorClass::StaleRouting,
            ClientError::Discovery(_) => ErrorClass::Discovery,
            ClientError::InvalidConfig(_)
            | ClientError::NothingToRollBack
            | ClientError::ShuttingDown => ErrorClass::Usage,
        }
    }

    /// Node the error was observed on, if any
    pub fn node(&self) -> Option<NodeId> {
        match self {
            ClientError::Transient { node, .. }
            | ClientError::Permanent { node, .. }
            | ClientError::Timeout { node, .. }
            | ClientError::PoolExhausted { node, .. }
            | ClientError::CircuitOpen { node, .. } => Some(*node),
            _ => None,
        }
    }

    /// Check if this error may be retried by the retry policy
    pub fn is_retriable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Operator-facing hint for resource and availability errors
    pub fn remediation(&self) -> Option<&'static str> {
        match self.class() {
            ErrorClass::PoolExhausted => {
                Some("increase pool size or waiter limit, or reduce request concurrency")
            }
            ErrorClass::CircuitOpen => {
                Some("check node health; calls resume after the breaker backoff")
            }
            ErrorClass::NoAvailableNode => Some("check node health; all replicas are quarantined"),
            ErrorClass::StaleRouting => {
                Some("partition map is outdated; a refresh has been requested")
            }
            ErrorClass::Discovery => Some("check seed addresses and network reachability"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_errors() {
        let node = NodeId(1);
        assert!(ClientError::Transient {
            node,
            reason: "reset".into()
        }
        .is_retriable());
        assert!(ClientError::Timeout {
            node,
            waited: Duration::from_millis(5)
        }
        .is_retriable());
        assert!(!ClientError::Permanent {
            node,
            reason: "auth".into()
        }
        .is_retriable());
        assert!(!ClientError::PoolExhausted { node, waiters: 3 }.is_retriable());
        assert!(!ClientError::CircuitOpen {
            node,
            retry_in: Duration::ZERO
        }
        .is_retriable());
    }

    #[test]
    fn test_transport_classification() {
        let err = ClientError::from_transport(NodeId(4), ClassifiedError::transient("reset"));
        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(err.node(), Some(NodeId(4)));

        let err = ClientError::from_transport(NodeId(4), ClassifiedError::permanent("bad auth"));
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert!(err.remediation().is_none());
    }

    #[test]
    fn test_remediation_hints() {
        let err = ClientError::PoolExhausted {
            node: NodeId(2),
            waiters: 8,
        };
        assert!(err.remediation().unwrap().contains("pool size"));

        let err = ClientError::NoAvailableNode { partition: 3 };
        assert!(err.remediation().unwrap().contains("node health"));
        assert_eq!(err.node(), None);
    }
}
