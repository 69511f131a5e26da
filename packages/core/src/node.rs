//! Cluster node domain types.
//!
//! A node is identified by an opaque, stable string ID; two `Node` values
//! with equal IDs denote the same peer. Node lists are always kept sorted
//! ascending by ID so that every peer computes the same bucket positions
//! from the same membership.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Readiness state of a single node. Wire values are `READY` and `DOWN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeState {
    Ready,
    Down,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Ready => write!(f, "READY"),
            NodeState::Down => write!(f, "DOWN"),
        }
    }
}

/// Cluster-wide state. Wire values are `STARTING`, `DEGRADED`, `NORMAL`,
/// and `RESIZING`.
///
/// RESIZING is only ever set by the coordinator while a resize job exists;
/// NORMAL requires topology agreement with every node READY; DEGRADED is a
/// started cluster missing fewer than `replica_n` members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClusterState {
    Starting,
    Degraded,
    Normal,
    Resizing,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterState::Starting => write!(f, "STARTING"),
            ClusterState::Degraded => write!(f, "DEGRADED"),
            ClusterState::Normal => write!(f, "NORMAL"),
            ClusterState::Resizing => write!(f, "RESIZING"),
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A single cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Opaque, stable identifier. Node identity.
    pub id: String,
    /// Primary transport address.
    pub uri: String,
    /// Optional secondary (gRPC) transport address.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub grpc_uri: Option<String>,
    /// Readiness state, mutated as the node reports in.
    pub state: NodeState,
    /// Derived: whether this node is the current coordinator.
    #[serde(default)]
    pub is_coordinator: bool,
}

impl Node {
    /// Creates a node in the `Down` state with no secondary address.
    #[must_use]
    pub fn new(id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uri: uri.into(),
            grpc_uri: None,
            state: NodeState::Down,
            is_coordinator: false,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.id, self.uri)
    }
}

// ---------------------------------------------------------------------------
// Node list helpers
// ---------------------------------------------------------------------------

/// Sorts a node list ascending by ID.
pub fn sort_by_id(nodes: &mut [Node]) {
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
}

/// Returns the IDs of the given nodes, in list order.
#[must_use]
pub fn node_ids(nodes: &[Node]) -> Vec<String> {
    nodes.iter().map(|n| n.id.clone()).collect()
}

/// Finds a node by ID.
#[must_use]
pub fn node_by_id<'a>(nodes: &'a [Node], id: &str) -> Option<&'a Node> {
    nodes.iter().find(|n| n.id == id)
}

// ---------------------------------------------------------------------------
// Noder
// ---------------------------------------------------------------------------

/// Supplier of the current node list.
///
/// Both a static list and a live cluster can act as a `Noder`; placement
/// code takes the role rather than a concrete type.
pub trait Noder {
    /// Returns the current node list, sorted ascending by ID.
    fn nodes(&self) -> Vec<Node>;
}

/// A `Noder` over a fixed list of nodes.
#[derive(Debug, Clone, Default)]
pub struct LocalNoder {
    nodes: Vec<Node>,
}

impl LocalNoder {
    /// Wraps the given nodes, sorting them by ID.
    #[must_use]
    pub fn new(mut nodes: Vec<Node>) -> Self {
        sort_by_id(&mut nodes);
        Self { nodes }
    }
}

impl Noder for LocalNoder {
    fn nodes(&self) -> Vec<Node> {
        self.nodes.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
