//! Node types

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Stable node identifier assigned by the cluster
///
/// Ids are totally ordered; the ordering is used wherever a deterministic
/// tie-break between nodes is required.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Opaque TLS / credential reference resolved by the embedding application.
///
/// The client never inspects the material behind the handle; it only passes
/// it to [`Transport::connect`](crate::transport::Transport::connect). Debug
/// output is redacted so handles can never leak through logs or errors.
#[derive(Clone)]
pub struct TlsHandle {
    label: String,
    inner: Arc<dyn Any + Send + Sync>,
}

impl TlsHandle {
    /// Wrap an application-defined TLS configuration
    pub fn new<T: Any + Send + Sync>(label: impl Into<String>, material: T) -> Self {
        Self {
            label: label.into(),
            inner: Arc::new(material),
        }
    }

    /// Human readable label (safe to log)
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Downcast to the concrete configuration type the transport expects
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for TlsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsHandle")
            .field("label", &self.label)
            .field("material", &"<redacted>")
            .finish()
    }
}

/// Node state as observed by the last discovery round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Node answered the last topology query (or was reported by a peer that did)
    #[default]
    Active,
    /// Node did not answer the last topology query in time
    Suspect,
}

/// Static node information as reported by the cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    /// Stable node identifier
    pub id: NodeId,

    /// Client-facing address (`host:port`)
    pub addr: String,

    /// Rack identifier, if the cluster reports one
    pub rack: Option<String>,
}

impl NodeInfo {
    pub fn new(id: impl Into<NodeId>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            rack: None,
        }
    }

    /// Set rack identifier
    pub fn with_rack(mut self, rack: impl Into<String>) -> Self {
        self.rack = Some(rack.into());
        self
    }
}

/// A cluster member inside a [`ClusterView`](crate::view::ClusterView)
#[derive(Debug, Clone)]
pub struct Node {
    /// Static node information
    pub info: NodeInfo,

    /// Discovery-observed status
    pub status: NodeStatus,

    /// TLS reference used when opening connections to this node
    pub tls: Option<TlsHandle>,
}

impl Node {
    pub fn new(info: NodeInfo, tls: Option<TlsHandle>) -> Self {
        Self {
            info,
            status: NodeStatus::Active,
            tls,
        }
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn id(&self) -> NodeId {
        self.info.id
    }

    pub fn addr(&self) -> &str {
        &self.info.addr
    }

    pub fn is_suspect(&self) -> bool {
        self.status == NodeStatus::Suspect
    }
}
