//! Topology discovery
//!
//! Discovery is pull-based: every known node and every seed is asked for
//! its view of the cluster, and the answers are merged into a candidate
//! [`ClusterView`]. The merge is deterministic:
//!
//! - the node set is the union of responders and the peers they report
//! - for each partition the highest ownership generation wins, exact ties go
//!   to the lowest reporting node id
//! - the previous view's entry competes for every partition that is still
//!   reported, so a lagging responder can never roll an entry back
//! - a known node that does not answer is kept as [`NodeStatus::Suspect`]
//!   unless the responders' peer lists show the cluster has dropped it

use crate::config::ConfigStore;
use crate::error::DiscoveryError;
use crate::node::{Node, NodeId, NodeInfo, NodeStatus, TlsHandle};
use crate::transport::{TopologyReport, Transport};
use crate::view::{ClusterView, PartitionEntry, PartitionId, PartitionMap};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Source of candidate cluster views
#[async_trait]
pub trait ViewSource: Send + Sync + 'static {
    /// Build a new candidate view; the caller publishes it
    async fn refresh(
        &self,
        known: &[Node],
        seeds: &[String],
        previous: &ClusterView,
    ) -> Result<ClusterView, DiscoveryError>;
}

/// Pull/merge discovery over a [`Transport`]
pub struct PollingDiscovery<T: Transport> {
    transport: Arc<T>,
    tls: Option<TlsHandle>,
    config: Arc<ConfigStore>,
}

impl<T: Transport> std::fmt::Debug for PollingDiscovery<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingDiscovery")
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> PollingDiscovery<T> {
    pub fn new(transport: Arc<T>, tls: Option<TlsHandle>, config: Arc<ConfigStore>) -> Self {
        Self {
            transport,
            tls,
            config,
        }
    }
}

#[async_trait]
impl<T: Transport> ViewSource for PollingDiscovery<T> {
    async fn refresh(
        &self,
        known: &[Node],
        seeds: &[String],
        previous: &ClusterView,
    ) -> Result<ClusterView, DiscoveryError> {
        let query_timeout = self.config.load().discovery.query_timeout;

        // Known nodes first, then seeds not already covered by a known address
        let known_addrs: HashSet<&str> = known.iter().map(|n| n.addr()).collect();
        let targets: Vec<&str> = known
            .iter()
            .map(|n| n.addr())
            .chain(
                seeds
                    .iter()
                    .map(String::as_str)
                    .filter(|addr| !known_addrs.contains(addr)),
            )
            .collect();
        if targets.is_empty() {
            return Err(DiscoveryError::NothingToQuery);
        }

        let queries = targets.iter().map(|addr| async move {
            match timeout(
                query_timeout,
                self.transport.fetch_topology(addr, self.tls.as_ref()),
            )
            .await
            {
                Ok(Ok(report)) => Some(report),
                Ok(Err(err)) => {
                    debug!(addr = %addr, error = %err, "Topology query failed");
                    None
                }
                Err(_) => {
                    debug!(addr = %addr, "Topology query timed out");
                    None
                }
            }
        });
        let reports: Vec<TopologyReport> = futures::future::join_all(queries)
            .await
            .into_iter()
            .flatten()
            .collect();

        if reports.is_empty() {
            return Err(DiscoveryError::NoResponders {
                queried: targets.len(),
            });
        }
        trace!(queried = targets.len(), answered = reports.len(), "Merging topology reports");
        Ok(merge_reports(previous, known, &reports, self.tls.as_ref()))
    }
}

/// Merge topology reports into a candidate view
pub fn merge_reports(
    previous: &ClusterView,
    known: &[Node],
    reports: &[TopologyReport],
    tls: Option<&TlsHandle>,
) -> ClusterView {
    let responders: BTreeSet<NodeId> = reports.iter().map(|r| r.reporter.id).collect();

    // Peers first, then each reporter's own description, which wins
    let mut infos: BTreeMap<NodeId, NodeInfo> = BTreeMap::new();
    for report in reports {
        for peer in &report.peers {
            infos.entry(peer.id).or_insert_with(|| peer.clone());
        }
    }
    for report in reports {
        infos.insert(report.reporter.id, report.reporter.clone());
    }

    let any_peer_list = reports.iter().any(|r| !r.peers.is_empty());
    let mut nodes: BTreeMap<NodeId, Node> = infos
        .into_iter()
        .map(|(id, info)| {
            let status = if responders.contains(&id) {
                NodeStatus::Active
            } else if known.iter().any(|k| k.id() == id) {
                // Listed by a peer but did not answer itself
                NodeStatus::Suspect
            } else {
                NodeStatus::Active
            };
            (id, Node::new(info, tls.cloned()).with_status(status))
        })
        .collect();

    for node in known {
        if nodes.contains_key(&node.id()) || any_peer_list {
            continue;
        }
        nodes.insert(
            node.id(),
            node.clone().with_status(NodeStatus::Suspect),
        );
    }

    ClusterView::new(nodes.into_values(), merge_partitions(previous, reports))
}

fn merge_partitions(previous: &ClusterView, reports: &[TopologyReport]) -> PartitionMap {
    let partition_count = reports
        .iter()
        .map(|r| r.partition_count)
        .max()
        .filter(|c| *c > 0)
        .unwrap_or_else(|| previous.partitions().partition_count());

    let reported: BTreeSet<PartitionId> = reports
        .iter()
        .flat_map(|r| r.partitions.iter().map(|p| p.partition))
        .collect();

    let mut best: BTreeMap<PartitionId, PartitionEntry> = BTreeMap::new();
    let mut offer = |partition: PartitionId, entry: PartitionEntry| {
        if partition_count > 0 && partition >= partition_count {
            return;
        }
        match best.get(&partition) {
            Some(current)
                if (current.generation, std::cmp::Reverse(current.source))
                    >= (entry.generation, std::cmp::Reverse(entry.source)) => {}
            _ => {
                best.insert(partition, entry);
            }
        }
    };

    for report in reports {
        for owned in &report.partitions {
            offer(
                owned.partition,
                PartitionEntry {
                    replicas: owned.replicas.clone(),
                    generation: owned.generation,
                    source: report.reporter.id,
                },
            );
        }
    }
    for partition in reported {
        if let Some(prev) = previous.partitions().get(partition) {
            offer(partition, prev.clone());
        }
    }

    let mut map = PartitionMap::new(partition_count);
    for (partition, entry) in best {
        map.insert(partition, entry);
    }
    map.bump_generation(previous.partitions().generation());
    map
}
