//! Persisted cluster topology: the sorted node-ID set and readiness map.
//!
//! The topology is the durable record of cluster membership. It survives
//! restarts so a STARTING cluster knows which peers it is waiting for, and
//! it gates joins: during startup only IDs already in the topology may
//! join. Every mutation is persisted atomically (write-then-rename) before
//! the mutating call returns.
//!
//! On-disk format (`<dataDir>/.topology`): a length-prefixed binary record
//! with two fields -- `clusterID` and the node ID list. Decoders sort the
//! IDs regardless of input order and ignore unknown trailing bytes so the
//! record can grow fields later.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;
use tracing::debug;

use tessera_core::{Hasher, NodeState};

use super::error::ClusterError;

/// File name of the persisted topology under the data directory.
pub const TOPOLOGY_FILE: &str = ".topology";

struct TopologyInner {
    cluster_id: String,
    /// Sorted ascending, unique.
    ids: Vec<String>,
    states: HashMap<String, NodeState>,
}

/// Persistable, sorted set of node IDs plus per-node readiness state.
///
/// Carries its own reader-writer lock; `partition_n`, `replica_n`, and the
/// hasher are immutable so partition->primary math needs no coordination
/// with the live cluster.
pub struct Topology {
    path: PathBuf,
    hasher: Arc<dyn Hasher>,
    partition_n: usize,
    replica_n: usize,
    inner: RwLock<TopologyInner>,
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Topology")
            .field("cluster_id", &inner.cluster_id)
            .field("ids", &inner.ids)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Topology {
    /// Creates an empty topology persisted under `data_dir`.
    #[must_use]
    pub fn new(
        data_dir: &Path,
        hasher: Arc<dyn Hasher>,
        partition_n: usize,
        replica_n: usize,
    ) -> Self {
        Self {
            path: data_dir.join(TOPOLOGY_FILE),
            hasher,
            partition_n: partition_n.max(1),
            replica_n: replica_n.max(1),
            inner: RwLock::new(TopologyInner {
                cluster_id: String::new(),
                ids: Vec::new(),
                states: HashMap::new(),
            }),
        }
    }

    /// Loads the persisted record if one exists. Returns `true` when a file
    /// was found and decoded.
    ///
    /// # Errors
    ///
    /// Fails on unreadable or corrupt files; a missing file is not an error.
    pub fn load(&self) -> Result<bool, ClusterError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let (cluster_id, ids) = decode(&bytes)?;
        debug!(path = %self.path.display(), nodes = ids.len(), "loaded topology");
        let mut inner = self.inner.write();
        inner.cluster_id = cluster_id;
        inner.ids = ids;
        Ok(true)
    }

    // -- Membership ---------------------------------------------------------

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().ids.iter().any(|i| i == id)
    }

    /// Adds an ID, keeping the list sorted, and persists. Returns `true`
    /// when the set changed.
    ///
    /// # Errors
    ///
    /// Persistence failure is fatal to the mutation; the in-memory set is
    /// left unchanged.
    pub fn add_id(&self, id: &str) -> Result<bool, ClusterError> {
        let mut inner = self.inner.write();
        if inner.ids.iter().any(|i| i == id) {
            return Ok(false);
        }
        inner.ids.push(id.to_string());
        inner.ids.sort_unstable();
        if let Err(err) = self.save(&inner) {
            inner.ids.retain(|i| i != id);
            return Err(err);
        }
        Ok(true)
    }

    /// Removes an ID and persists. Returns `true` when the set changed.
    ///
    /// # Errors
    ///
    /// Persistence failure is fatal to the mutation; the in-memory set is
    /// restored.
    pub fn remove_id(&self, id: &str) -> Result<bool, ClusterError> {
        let mut inner = self.inner.write();
        let Some(pos) = inner.ids.iter().position(|i| i == id) else {
            return Ok(false);
        };
        let removed = inner.ids.remove(pos);
        if let Err(err) = self.save(&inner) {
            inner.ids.insert(pos, removed);
            return Err(err);
        }
        inner.states.remove(id);
        Ok(true)
    }

    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.inner.read().ids.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().ids.is_empty()
    }

    // -- Cluster ID ---------------------------------------------------------

    #[must_use]
    pub fn cluster_id(&self) -> String {
        self.inner.read().cluster_id.clone()
    }

    /// Sets the cluster UUID and persists.
    ///
    /// # Errors
    ///
    /// Persistence failure is fatal; the previous ID is restored.
    pub fn set_cluster_id(&self, id: &str) -> Result<(), ClusterError> {
        let mut inner = self.inner.write();
        let previous = std::mem::replace(&mut inner.cluster_id, id.to_string());
        if let Err(err) = self.save(&inner) {
            inner.cluster_id = previous;
            return Err(err);
        }
        Ok(())
    }

    // -- Readiness ----------------------------------------------------------

    pub fn set_node_state(&self, id: &str, state: NodeState) {
        self.inner.write().states.insert(id.to_string(), state);
    }

    #[must_use]
    pub fn node_state(&self, id: &str) -> Option<NodeState> {
        self.inner.read().states.get(id).copied()
    }

    // -- Partition math -----------------------------------------------------

    /// Index of the primary owner of a partition within the sorted ID list.
    #[must_use]
    pub fn primary_node_index(&self, partition_id: usize) -> Option<usize> {
        let inner = self.inner.read();
        if inner.ids.is_empty() {
            return None;
        }
        Some(self.hasher.hash(partition_id as u64, inner.ids.len()))
    }

    /// Non-primary owners of a partition, in ring order.
    #[must_use]
    pub fn get_non_primary_replicas(&self, partition_id: usize) -> Vec<String> {
        match self.primary_node_index(partition_id) {
            Some(primary) => self.get_replicas_for_primary(primary),
            None => Vec::new(),
        }
    }

    /// Non-primary owners for a given primary index, in ring order.
    #[must_use]
    pub fn get_replicas_for_primary(&self, primary_idx: usize) -> Vec<String> {
        let inner = self.inner.read();
        let n = inner.ids.len();
        if n == 0 {
            return Vec::new();
        }
        (1..self.replica_n.min(n))
            .map(|i| inner.ids[(primary_idx + i) % n].clone())
            .collect()
    }

    #[must_use]
    pub fn partition_n(&self) -> usize {
        self.partition_n
    }

    // -- Persistence --------------------------------------------------------

    /// Encodes the current record to its on-disk form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let inner = self.inner.read();
        encode(&inner.cluster_id, &inner.ids)
    }

    fn save(&self, inner: &TopologyInner) -> Result<(), ClusterError> {
        let bytes = encode(&inner.cluster_id, &inner.ids);
        // Write-then-rename so readers never observe a truncated record.
        let tmp = self.path.with_file_name(".topology.tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Binary codec
// ---------------------------------------------------------------------------

/// Encodes `{clusterID, nodeIDs}` as a length-prefixed binary record.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // IDs are far below u32::MAX bytes
pub fn encode(cluster_id: &str, ids: &[String]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u32(cluster_id.len() as u32);
    buf.put_slice(cluster_id.as_bytes());
    buf.put_u32(ids.len() as u32);
    for id in ids {
        buf.put_u32(id.len() as u32);
        buf.put_slice(id.as_bytes());
    }
    buf.to_vec()
}

/// Decodes a topology record. IDs are sorted and deduplicated regardless of
/// input order; unknown trailing bytes are ignored.
///
/// # Errors
///
/// Fails on truncated records or invalid UTF-8.
pub fn decode(mut bytes: &[u8]) -> Result<(String, Vec<String>), ClusterError> {
    let cluster_id = read_string(&mut bytes, "clusterID")?;
    if bytes.remaining() < 4 {
        return Err(ClusterError::CorruptTopology {
            reason: "missing node ID count".to_string(),
        });
    }
    let count = bytes.get_u32() as usize;
    let mut ids = Vec::with_capacity(count.min(1024));
    for i in 0..count {
        ids.push(read_string(&mut bytes, &format!("nodeID[{i}]"))?);
    }
    ids.sort_unstable();
    ids.dedup();
    Ok((cluster_id, ids))
}

fn read_string(bytes: &mut &[u8], what: &str) -> Result<String, ClusterError> {
    if bytes.remaining() < 4 {
        return Err(ClusterError::CorruptTopology {
            reason: format!("missing length prefix for {what}"),
        });
    }
    let len = bytes.get_u32() as usize;
    if bytes.remaining() < len {
        return Err(ClusterError::CorruptTopology {
            reason: format!("{what} truncated: want {len} bytes, have {}", bytes.remaining()),
        });
    }
    let rest: &[u8] = bytes;
    let (head, tail) = rest.split_at(len);
    let s = std::str::from_utf8(head)
        .map_err(|_| ClusterError::CorruptTopology {
            reason: format!("{what} is not valid UTF-8"),
        })?
        .to_string();
    *bytes = tail;
    Ok(s)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
