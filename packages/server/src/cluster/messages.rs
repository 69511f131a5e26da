//! Inter-node cluster wire messages.
//!
//! These messages flow over the broadcaster between peers. They use MsgPack
//! serialization (`rmp_serde::to_vec_named()`) with an internally tagged
//! top-level enum; message names and payload field names are part of the
//! protocol.
//!
//! Schema mutation broadcasts (`CREATE_INDEX`, `TRANSACTION`, ...) are
//! opaque to the coordination core: they are defined here because they share
//! the broadcaster, and the cluster dispatch hands them to the holder
//! untouched.

use serde::{Deserialize, Serialize};

use tessera_core::{ClusterState, Node, NodeState, Schema};

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// One fragment to stream during a resize: where it lives and which cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentSource {
    pub node: Node,
    pub index: String,
    pub field: String,
    pub view: String,
    pub shard: u64,
}

/// One key-translation partition to stream during a resize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationPartitionSource {
    pub node: Node,
    pub index: String,
    pub partition_id: usize,
}

/// The union of shards a field holds, attached to a `NodeStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableShardSet {
    pub index: String,
    pub field: String,
    pub shards: std::collections::BTreeSet<u64>,
}

/// A node's expected status: its identity, the schema it should carry, and
/// the per-field shard unions to merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatusPayload {
    pub node: Node,
    pub schema: Schema,
    pub available_shards: Vec<AvailableShardSet>,
}

// ---------------------------------------------------------------------------
// ClusterMessage enum
// ---------------------------------------------------------------------------

/// Top-level cluster protocol message.
///
/// Internally tagged on `"type"` with `SCREAMING_SNAKE_CASE` variant names.
/// Covers membership/state (4), resize (2), and the opaque schema mutation
/// broadcasts that share the broadcaster (10).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterMessage {
    // -- Membership and state --------------------------------------------
    ClusterStatus(ClusterStatusPayload),
    NodeState(NodeStateMessage),
    UpdateCoordinator(UpdateCoordinatorMessage),
    SetCoordinator(SetCoordinatorMessage),

    // -- Resize ----------------------------------------------------------
    ResizeInstruction(Box<ResizeInstructionPayload>),
    ResizeInstructionComplete(ResizeInstructionCompletePayload),

    // -- Schema mutations (opaque to the core) ---------------------------
    CreateIndex(IndexMessage),
    DeleteIndex(IndexMessage),
    CreateField(FieldMessage),
    DeleteField(FieldMessage),
    CreateView(ViewMessage),
    DeleteView(ViewMessage),
    CreateShard(ShardMessage),
    DeleteAvailableShard(ShardMessage),
    RecalculateCaches,
    Transaction(TransactionMessage),
}

// ---------------------------------------------------------------------------
// Membership and state payloads
// ---------------------------------------------------------------------------

/// The coordinator's authoritative view, broadcast to all peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatusPayload {
    pub cluster_id: String,
    pub state: ClusterState,
    pub nodes: Vec<Node>,
    pub schema: Schema,
}

/// A node reporting its readiness to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStateMessage {
    pub node_id: String,
    pub state: NodeState,
}

/// Broadcast when the computed coordinator changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCoordinatorMessage {
    pub new_node: Node,
}

/// Operator-initiated coordinator designation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetCoordinatorMessage {
    pub new_node: Node,
}

// ---------------------------------------------------------------------------
// Resize payloads
// ---------------------------------------------------------------------------

/// Everything one recipient needs to do its part of a resize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeInstructionPayload {
    pub job_id: u64,
    /// The recipient.
    pub node: Node,
    pub coordinator: Node,
    pub sources: Vec<FragmentSource>,
    pub translation_sources: Vec<TranslationPartitionSource>,
    /// The recipient's expected post-resize status.
    pub node_status: NodeStatusPayload,
    pub cluster_status: ClusterStatusPayload,
}

/// A recipient reporting its instruction finished (or failed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeInstructionCompletePayload {
    pub job_id: u64,
    pub node: Node,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Schema mutation payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMessage {
    pub index: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMessage {
    pub index: String,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewMessage {
    pub index: String,
    pub field: String,
    pub view: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardMessage {
    pub index: String,
    pub field: String,
    pub shard: u64,
}

/// Action carried by a transaction broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionAction {
    Start,
    Finish,
    Validate,
}

/// A transaction control broadcast; the transaction body is opaque here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMessage {
    pub transaction: serde_json::Value,
    pub action: TransactionAction,
}

impl ClusterMessage {
    /// Serializes to the MsgPack wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails (practically unreachable for
    /// these payloads).
    pub fn to_wire(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Deserializes from the MsgPack wire form.
    ///
    /// # Errors
    ///
    /// Returns an error when the bytes are not a valid cluster message.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
