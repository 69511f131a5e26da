//! Cluster error taxonomy.
//!
//! Each variant is a distinct failure mode a caller can branch on. External
//! collaborators (`Holder`, `Broadcaster`, `InternalClient`) surface opaque
//! `anyhow` errors which fold into `Internal`.

/// Errors returned by cluster coordination operations.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// A node tried to join during STARTING without being in the persisted
    /// topology.
    #[error("node {id} is not in the persisted topology")]
    NodeNotInTopology { id: String },

    /// An operation reserved for the coordinator was invoked elsewhere.
    #[error("operation requires the coordinator")]
    CoordinatorOnly,

    /// A second resize was attempted while one is active.
    #[error("a resize job is already running")]
    ResizeInProgress,

    /// A resize plan could not find a valid source for some fragment or
    /// translation partition.
    #[error("not enough replicas to source all data for the resize")]
    NotEnoughReplicas,

    /// The diff between the current and target cluster is more than one node.
    #[error("cluster resize supports one node change, got {added} added and {removed} removed")]
    TooManyChanges { added: usize, removed: usize },

    /// A read-only translation could not locate a key.
    #[error("translating key {key:?} on index {index}: key not found")]
    TranslationKeyNotFound { index: String, key: String },

    /// The cluster began shutting down while an operation was waiting.
    #[error("cluster is shutting down")]
    ClusterShuttingDown,

    /// The operation is not valid in the current cluster state.
    #[error("cluster state is {actual}, expected {expected}")]
    InvalidState { expected: String, actual: String },

    /// The named node is not known to the cluster.
    #[error("node {id} is not a cluster member")]
    NodeNotFound { id: String },

    /// The persisted topology file could not be decoded.
    #[error("corrupt topology file: {reason}")]
    CorruptTopology { reason: String },

    /// Topology persistence or other file I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Opaque failure from an external collaborator.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
