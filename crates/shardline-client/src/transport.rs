//! Transport contract
//!
//! The client does not speak any wire protocol itself. An implementation of
//! [`Transport`] supplied by the protocol layer opens connections (including
//! the TLS handshake), probes nodes, executes opaque operations and answers
//! topology queries.

use crate::error::ClassifiedError;
use crate::node::{NodeId, NodeInfo, TlsHandle};
use crate::view::PartitionId;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;

/// Network transport used by the client
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Established connection to one node
    type Connection: Send + 'static;

    /// Open a connection and perform the handshake
    async fn connect(
        &self,
        node: &NodeInfo,
        tls: Option<&TlsHandle>,
    ) -> Result<Self::Connection, ClassifiedError>;

    /// Health probe; returns the observed round-trip latency
    async fn probe(&self, node: &NodeInfo) -> Result<Duration, ClassifiedError>;

    /// Execute a data operation on a leased connection
    async fn execute(
        &self,
        conn: &mut Self::Connection,
        node: &NodeInfo,
        op: &Operation,
    ) -> Result<Bytes, ClassifiedError>;

    /// Ask the node at `addr` for its peer list and partition ownership
    async fn fetch_topology(
        &self,
        addr: &str,
        tls: Option<&TlsHandle>,
    ) -> Result<TopologyReport, ClassifiedError>;
}

/// A data operation routed by key
#[derive(Debug, Clone)]
pub struct Operation {
    /// Operation class (e.g. "get", "put"); scopes circuit breakers when enabled
    pub class: Cow<'static, str>,
    /// Opaque request body, encoded by the protocol layer
    pub payload: Bytes,
    /// Safe to repeat: retried on transient failures
    pub idempotent: bool,
    /// Non-idempotent but explicitly allowed to be retried by the caller
    pub retry_safe: bool,
    /// Overall deadline; defaults to `retry.request_timeout`
    pub timeout: Option<Duration>,
}

impl Operation {
    pub fn new(class: impl Into<Cow<'static, str>>, payload: impl Into<Bytes>) -> Self {
        Self {
            class: class.into(),
            payload: payload.into(),
            idempotent: false,
            retry_safe: false,
            timeout: None,
        }
    }

    /// Mark the operation idempotent
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    /// Allow retries of a non-idempotent operation
    pub fn retry_safe(mut self) -> Self {
        self.retry_safe = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether transient failures may be retried
    pub fn is_retryable(&self) -> bool {
        self.idempotent || self.retry_safe
    }
}

/// One partition's ownership as reported by a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOwnership {
    pub partition: PartitionId,
    /// Replicas, primary first
    pub replicas: Vec<NodeId>,
    pub generation: u64,
}

/// Answer to a topology query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyReport {
    /// The answering node
    pub reporter: NodeInfo,
    /// Peers the reporter knows about (may include itself)
    pub peers: Vec<NodeInfo>,
    /// Number of partitions in the keyspace
    pub partition_count: u32,
    pub partitions: Vec<PartitionOwnership>,
}
