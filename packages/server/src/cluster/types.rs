//! Cluster domain types: configuration, membership events, resize enums.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tessera_core::{Node, DEFAULT_PARTITION_N};

/// Capacity of the resize action queue feeding the resize worker.
pub(crate) const RESIZE_QUEUE_DEPTH: usize = 10;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// What a resize job does with its affected node. Wire values `ADD`/`REMOVE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResizeActionKind {
    Add,
    Remove,
}

impl std::fmt::Display for ResizeActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResizeActionKind::Add => write!(f, "ADD"),
            ResizeActionKind::Remove => write!(f, "REMOVE"),
        }
    }
}

/// Lifecycle state of a resize job. Wire values `RUNNING`/`DONE`/`ABORTED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResizeJobState {
    Running,
    Done,
    Aborted,
}

/// Kind of membership event produced by the gossip transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEventKind {
    Join,
    Leave,
    Update,
}

// ---------------------------------------------------------------------------
// Structs
// ---------------------------------------------------------------------------

/// A membership event delivered by the underlying membership transport.
#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub kind: NodeEventKind,
    pub node: Node,
}

/// One queued membership change for the resize worker.
#[derive(Debug, Clone)]
pub struct ResizeAction {
    pub node: Node,
    pub kind: ResizeActionKind,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for cluster coordination behavior.
///
/// All knobs are passed at construction; there is no process-wide state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    /// Directory holding the persisted `.topology` file.
    pub data_dir: PathBuf,
    /// Number of partitions. Fixed at cluster creation; all peers must agree.
    pub partition_n: usize,
    /// Number of replicas per partition, primary included. Must be >= 1.
    pub replica_n: usize,
    /// Liveness probes before a Leave event is believed.
    pub confirm_down_retries: usize,
    /// Spacing between liveness probes, in milliseconds. The probe timeout
    /// is twice this value.
    pub confirm_down_sleep_ms: u64,
}

impl ClusterConfig {
    /// Spacing between liveness probes.
    #[must_use]
    pub fn confirm_down_sleep(&self) -> Duration {
        Duration::from_millis(self.confirm_down_sleep_ms)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            partition_n: DEFAULT_PARTITION_N,
            replica_n: 1,
            confirm_down_retries: 10,
            confirm_down_sleep_ms: 1000,
        }
    }
}
