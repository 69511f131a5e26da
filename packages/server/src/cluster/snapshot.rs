//! Immutable cluster placement view.
//!
//! A `ClusterSnapshot` freezes (node list, hasher, replica count, partition
//! count) so that concurrent readers resolve placement against a consistent
//! membership even while the live cluster mutates. All operations are pure:
//! for a fixed snapshot, identical inputs yield identical ordered node lists
//! on every peer, which is what lets routing agree without consensus.

use std::fmt;
use std::sync::Arc;

use tessera_core::{
    id_to_shard_partition, key_to_key_partition, shard_to_shard_partition, sort_by_id, Hasher,
    Node, Noder,
};

/// Immutable view over (nodes, hasher, `replica_n`, `partition_n`).
#[derive(Clone)]
pub struct ClusterSnapshot {
    nodes: Vec<Node>,
    hasher: Arc<dyn Hasher>,
    replica_n: usize,
    partition_n: usize,
}

impl fmt::Debug for ClusterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterSnapshot")
            .field("nodes", &self.nodes.len())
            .field("replica_n", &self.replica_n)
            .field("partition_n", &self.partition_n)
            .finish_non_exhaustive()
    }
}

impl ClusterSnapshot {
    /// Builds a snapshot from a node list. The list is sorted by ID;
    /// `replica_n` and `partition_n` are clamped to at least 1.
    #[must_use]
    pub fn new(
        mut nodes: Vec<Node>,
        hasher: Arc<dyn Hasher>,
        replica_n: usize,
        partition_n: usize,
    ) -> Self {
        sort_by_id(&mut nodes);
        Self {
            nodes,
            hasher,
            replica_n: replica_n.max(1),
            partition_n: partition_n.max(1),
        }
    }

    /// Builds a snapshot from any node-list supplier.
    #[must_use]
    pub fn from_noder(
        noder: &dyn Noder,
        hasher: Arc<dyn Hasher>,
        replica_n: usize,
        partition_n: usize,
    ) -> Self {
        Self::new(noder.nodes(), hasher, replica_n, partition_n)
    }

    // -- Accessors ----------------------------------------------------------

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn partition_n(&self) -> usize {
        self.partition_n
    }

    #[must_use]
    pub fn replica_n(&self) -> usize {
        self.replica_n
    }

    #[must_use]
    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == node_id)
    }

    // -- Placement ----------------------------------------------------------

    /// Returns the owner of non-partitioned (field) translation. This node
    /// is also the cluster coordinator.
    #[must_use]
    pub fn primary_field_translation_node(&self) -> Option<&Node> {
        if self.nodes.is_empty() {
            return None;
        }
        Some(&self.nodes[self.hasher.hash(0, self.nodes.len())])
    }

    /// Returns `true` if `node_id` owns non-partitioned translation.
    #[must_use]
    pub fn is_primary_field_translation_node(&self, node_id: &str) -> bool {
        self.primary_field_translation_node()
            .is_some_and(|n| n.id == node_id)
    }

    /// Returns the `min(replica_n, len)` owners of a partition in ring
    /// order. The first element is the primary.
    #[must_use]
    pub fn partition_nodes(&self, partition_id: usize) -> Vec<Node> {
        let n = self.nodes.len();
        if n == 0 {
            return Vec::new();
        }
        let primary = self.hasher.hash(partition_id as u64, n);
        (0..self.replica_n.min(n))
            .map(|i| self.nodes[(primary + i) % n].clone())
            .collect()
    }

    /// Maps `(index, shard)` to its shard-partition.
    #[must_use]
    pub fn shard_to_shard_partition(&self, index: &str, shard: u64) -> usize {
        shard_to_shard_partition(index, shard, self.partition_n)
    }

    /// Maps `(index, key)` to its key-partition.
    #[must_use]
    pub fn key_to_key_partition(&self, index: &str, key: &str) -> usize {
        key_to_key_partition(index, key, self.partition_n)
    }

    /// Maps a column ID to the shard-partition of its containing shard.
    #[must_use]
    pub fn id_to_shard_partition(&self, index: &str, id: u64) -> usize {
        id_to_shard_partition(index, id, self.partition_n)
    }

    /// Returns the owners of `(index, shard)`; primary first.
    #[must_use]
    pub fn shard_nodes(&self, index: &str, shard: u64) -> Vec<Node> {
        self.partition_nodes(self.shard_to_shard_partition(index, shard))
    }

    /// Returns the owners of `(index, key)`; primary first.
    #[must_use]
    pub fn key_nodes(&self, index: &str, key: &str) -> Vec<Node> {
        self.partition_nodes(self.key_to_key_partition(index, key))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
