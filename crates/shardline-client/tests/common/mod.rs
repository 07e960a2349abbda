//! Shared test infrastructure: an in-memory cluster behind the `Transport`
//! trait and an event sink that records everything it sees.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use shardline_client::{
    ClassifiedError, ClientConfig, ClientEvent, EventSink, HealthState, Murmur2Partitioner, NodeId,
    NodeInfo, Operation, PartitionOwnership, Partitioner, TlsHandle, TopologyReport, Transport,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Install a test subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small intervals so background loops make progress under paused time
pub fn test_config() -> ClientConfig {
    ClientConfig::builder()
        .probe_interval(Duration::from_millis(100))
        .tend_interval(Duration::from_millis(500))
        .build()
        .unwrap()
}

// ============================================================================
// Simulated cluster
// ============================================================================

#[derive(Debug)]
pub struct SimConnection {
    pub node: NodeId,
}

#[derive(Debug, Clone)]
struct SimNode {
    info: NodeInfo,
    up: bool,
    latency: Duration,
    failing_requests: u32,
    answers_topology: bool,
}

#[derive(Debug, Default)]
struct SimState {
    nodes: BTreeMap<NodeId, SimNode>,
    partition_count: u32,
    partitions: Vec<PartitionOwnership>,
    execute_delay: Duration,
    served: Vec<NodeId>,
}

/// In-memory cluster: nodes can be stopped, slowed down or scripted to fail
#[derive(Debug, Default)]
pub struct SimTransport {
    state: Mutex<SimState>,
    connects: AtomicUsize,
    topology_queries: AtomicUsize,
}

pub fn addr_of(id: u64) -> String {
    format!("10.0.0.{}:7000", id)
}

impl SimTransport {
    /// `nodes` nodes with ids `1..=nodes`; partition `p` is owned by
    /// `replication` consecutive nodes starting at `p % nodes + 1`
    pub fn cluster(nodes: u64, partition_count: u32, replication: usize) -> Arc<Self> {
        let sim = Self::default();
        {
            let mut st = sim.state.lock();
            for id in 1..=nodes {
                st.nodes.insert(
                    NodeId(id),
                    SimNode {
                        info: NodeInfo::new(id, addr_of(id)),
                        up: true,
                        latency: Duration::from_millis(2),
                        failing_requests: 0,
                        answers_topology: true,
                    },
                );
            }
            st.partition_count = partition_count;
            st.partitions = (0..partition_count)
                .map(|p| PartitionOwnership {
                    partition: p,
                    replicas: (0..replication as u64)
                        .map(|r| NodeId((p as u64 + r) % nodes + 1))
                        .collect(),
                    generation: 1,
                })
                .collect();
        }
        Arc::new(sim)
    }

    pub fn seeds(&self) -> Vec<String> {
        self.state
            .lock()
            .nodes
            .values()
            .map(|n| n.info.addr.clone())
            .collect()
    }

    pub fn set_up(&self, node: NodeId, up: bool) {
        if let Some(n) = self.state.lock().nodes.get_mut(&node) {
            n.up = up;
        }
    }

    pub fn set_latency(&self, node: NodeId, latency: Duration) {
        if let Some(n) = self.state.lock().nodes.get_mut(&node) {
            n.latency = latency;
        }
    }

    /// The next `count` data operations on `node` fail transiently
    pub fn fail_next_requests(&self, node: NodeId, count: u32) {
        if let Some(n) = self.state.lock().nodes.get_mut(&node) {
            n.failing_requests = count;
        }
    }

    /// Stop (or resume) answering topology queries while serving data
    pub fn set_answers_topology(&self, node: NodeId, answers: bool) {
        if let Some(n) = self.state.lock().nodes.get_mut(&node) {
            n.answers_topology = answers;
        }
    }

    pub fn set_execute_delay(&self, delay: Duration) {
        self.state.lock().execute_delay = delay;
    }

    /// Remove a node from membership and from every replica set
    pub fn decommission(&self, node: NodeId) {
        let mut st = self.state.lock();
        st.nodes.remove(&node);
        for p in st.partitions.iter_mut() {
            p.replicas.retain(|id| *id != node);
            p.generation += 1;
        }
    }

    /// Nodes that served data operations, in order
    pub fn served(&self) -> Vec<NodeId> {
        self.state.lock().served.clone()
    }

    pub fn clear_served(&self) {
        self.state.lock().served.clear();
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn topology_queries(&self) -> usize {
        self.topology_queries.load(Ordering::SeqCst)
    }

    /// Primary replica of the partition `key` maps to
    pub fn primary_for(&self, key: &[u8]) -> NodeId {
        let st = self.state.lock();
        let partition = Murmur2Partitioner.partition(key, st.partition_count);
        st.partitions[partition as usize].replicas[0]
    }

    /// First key of the form `key-N` whose partition's primary is `node`
    pub fn key_owned_by(&self, node: NodeId) -> Vec<u8> {
        (0..10_000)
            .map(|i| format!("key-{}", i).into_bytes())
            .find(|key| self.primary_for(key) == node)
            .unwrap()
    }

    fn live_node(&self, id: NodeId) -> Result<SimNode, ClassifiedError> {
        match self.state.lock().nodes.get(&id) {
            Some(n) if n.up => Ok(n.clone()),
            Some(_) => Err(ClassifiedError::transient("connection refused")),
            None => Err(ClassifiedError::transient("no route to host")),
        }
    }
}

#[async_trait]
impl Transport for SimTransport {
    type Connection = SimConnection;

    async fn connect(
        &self,
        node: &NodeInfo,
        _tls: Option<&TlsHandle>,
    ) -> Result<SimConnection, ClassifiedError> {
        self.live_node(node.id)?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(SimConnection { node: node.id })
    }

    async fn probe(&self, node: &NodeInfo) -> Result<Duration, ClassifiedError> {
        let n = self.live_node(node.id)?;
        tokio::time::sleep(n.latency).await;
        Ok(n.latency)
    }

    async fn execute(
        &self,
        conn: &mut SimConnection,
        _node: &NodeInfo,
        _op: &Operation,
    ) -> Result<Bytes, ClassifiedError> {
        let delay = {
            let mut st = self.state.lock();
            let delay = st.execute_delay;
            match st.nodes.get_mut(&conn.node) {
                Some(n) if n.up && n.failing_requests > 0 => {
                    n.failing_requests -= 1;
                    return Err(ClassifiedError::transient("injected failure"));
                }
                Some(n) if n.up => delay,
                _ => return Err(ClassifiedError::transient("connection reset")),
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().served.push(conn.node);
        Ok(Bytes::from(conn.node.to_string()))
    }

    async fn fetch_topology(
        &self,
        addr: &str,
        _tls: Option<&TlsHandle>,
    ) -> Result<TopologyReport, ClassifiedError> {
        self.topology_queries.fetch_add(1, Ordering::SeqCst);
        let st = self.state.lock();
        let reporter = st
            .nodes
            .values()
            .find(|n| n.info.addr == addr)
            .ok_or_else(|| ClassifiedError::transient("no route to host"))?;
        if !reporter.up {
            return Err(ClassifiedError::transient("connection refused"));
        }
        if !reporter.answers_topology {
            return Err(ClassifiedError::transient("topology query timed out"));
        }
        Ok(TopologyReport {
            reporter: reporter.info.clone(),
            peers: st.nodes.values().map(|n| n.info.clone()).collect(),
            partition_count: st.partition_count,
            partitions: st.partitions.clone(),
        })
    }
}

// ============================================================================
// Event recording
// ============================================================================

#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ClientEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().clone()
    }

    /// Health transitions of `node`, oldest first
    pub fn transitions(&self, node: NodeId) -> Vec<(HealthState, HealthState)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ClientEvent::NodeStateChanged { node: n, from, to } if *n == node => {
                    Some((*from, *to))
                }
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&ClientEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ClientEvent) {
        self.events.lock().push(event);
    }
}
