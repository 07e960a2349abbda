//! Immutable cluster view snapshots
//!
//! A [`ClusterView`] pairs the node set with the partition map it was built
//! alongside. Views are never mutated after publication: discovery builds a
//! new one and [`ViewStore::publish`] swaps it in with a single atomic pointer
//! store, so a reader holding an `Arc<ClusterView>` always sees one
//! consistent generation.

use crate::node::{Node, NodeId};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;

/// Partition identifier
pub type PartitionId = u32;

/// Replica assignment for one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    /// Replicas, primary first
    pub replicas: Vec<NodeId>,
    /// Ownership generation reported by the cluster
    pub generation: u64,
    /// Node whose report this entry came from
    pub source: NodeId,
}

impl PartitionEntry {
    pub fn primary(&self) -> Option<NodeId> {
        self.replicas.first().copied()
    }
}

/// Partition ownership map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionMap {
    entries: BTreeMap<PartitionId, PartitionEntry>,
    partition_count: u32,
    generation: u64,
}

impl PartitionMap {
    pub fn new(partition_count: u32) -> Self {
        Self {
            entries: BTreeMap::new(),
            partition_count,
            generation: 0,
        }
    }

    /// Insert or replace an entry; the map generation follows the highest
    /// entry generation.
    pub fn insert(&mut self, partition: PartitionId, entry: PartitionEntry) {
        self.generation = self.generation.max(entry.generation);
        self.entries.insert(partition, entry);
    }

    /// Raise the map generation floor (never lowers it)
    pub(crate) fn bump_generation(&mut self, floor: u64) {
        self.generation = self.generation.max(floor);
    }

    pub fn get(&self, partition: PartitionId) -> Option<&PartitionEntry> {
        self.entries.get(&partition)
    }

    pub fn replicas(&self, partition: PartitionId) -> Option<&[NodeId]> {
        self.entries.get(&partition).map(|e| e.replicas.as_slice())
    }

    /// Number of partitions the keyspace is divided into
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PartitionId, &PartitionEntry)> {
        self.entries.iter().map(|(p, e)| (*p, e))
    }
}

/// Immutable snapshot of cluster topology
#[derive(Debug, Clone)]
pub struct ClusterView {
    generation: u64,
    nodes: BTreeMap<NodeId, Node>,
    partitions: PartitionMap,
    built_at: Instant,
}

impl ClusterView {
    /// Empty view used before the first successful discovery
    pub fn empty() -> Self {
        Self {
            generation: 0,
            nodes: BTreeMap::new(),
            partitions: PartitionMap::default(),
            built_at: Instant::now(),
        }
    }

    /// Build a candidate view; the generation is assigned on publish
    pub fn new(nodes: impl IntoIterator<Item = Node>, partitions: PartitionMap) -> Self {
        Self {
            generation: 0,
            nodes: nodes.into_iter().map(|n| (n.id(), n)).collect(),
            partitions,
            built_at: Instant::now(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Nodes ordered by id
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn partitions(&self) -> &PartitionMap {
        &self.partitions
    }

    pub fn built_at(&self) -> Instant {
        self.built_at
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Publication point for cluster views
#[derive(Debug)]
pub struct ViewStore {
    current: ArcSwap<ClusterView>,
    publish_lock: Mutex<()>,
}

impl ViewStore {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(ClusterView::empty()),
            publish_lock: Mutex::new(()),
        }
    }

    /// Lock-free load of the current view
    pub fn load(&self) -> Arc<ClusterView> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }

    /// Stamp `view` with the next generation and make it current
    pub fn publish(&self, mut view: ClusterView) -> Arc<ClusterView> {
        let _guard = self.publish_lock.lock();
        view.generation = self.current.load().generation + 1;
        let view = Arc::new(view);
        self.current.store(Arc::clone(&view));
        view
    }
}

impl Default for ViewStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeInfo;

    fn node(id: u64) -> Node {
        Node::new(NodeInfo::new(id, format!("10.0.0.{id}:7000")), None)
    }

    fn entry(replicas: &[u64], generation: u64) -> PartitionEntry {
        PartitionEntry {
            replicas: replicas.iter().copied().map(NodeId).collect(),
            generation,
            source: NodeId(replicas[0]),
        }
    }

    #[test]
    fn test_partition_map_generation_follows_entries() {
        let mut map = PartitionMap::new(4);
        map.insert(0, entry(&[1, 2], 3));
        map.insert(1, entry(&[2, 3], 7));
        map.insert(2, entry(&[3, 1], 5));

        assert_eq!(map.generation(), 7);
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(1).unwrap().primary(), Some(NodeId(2)));
        assert!(map.replicas(3).is_none());
    }

    #[test]
    fn test_publish_assigns_increasing_generations() {
        let store = ViewStore::new();
        assert_eq!(store.generation(), 0);

        let first = store.publish(ClusterView::new(vec![node(1)], PartitionMap::new(1)));
        assert_eq!(first.generation(), 1);

        let second = store.publish(ClusterView::new(
            vec![node(1), node(2)],
            PartitionMap::new(1),
        ));
        assert_eq!(second.generation(), 2);

        // A reader holding the old snapshot still sees the old node set
        assert_eq!(first.node_count(), 1);
        assert_eq!(store.load().node_count(), 2);
    }

    #[test]
    fn test_concurrent_publish_is_strictly_increasing() {
        let store = Arc::new(ViewStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| store.publish(ClusterView::empty()).generation())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400);
        assert_eq!(store.generation(), 400);
    }
}
