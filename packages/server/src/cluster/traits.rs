//! Collaborator capability traits.
//!
//! The cluster core owns none of its collaborators: the message transport
//! (`Broadcaster`), the on-disk storage engine (`Holder`), the peer RPC
//! client (`InternalClient`), and the translation sync hook
//! (`TranslationSyncer`) are all supplied at construction as trait objects.
//! Their errors are opaque `anyhow` values; the cluster decides what is
//! fatal.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use tessera_core::{Node, Schema};

use super::messages::ClusterMessage;

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

/// Sends cluster messages to peers. The transport (HTTP, gRPC, in-memory)
/// is the embedding server's business.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Sends a message to every other cluster member.
    async fn send_sync(&self, msg: &ClusterMessage) -> anyhow::Result<()>;

    /// Sends a message to a single node.
    async fn send_to(&self, node: &Node, msg: &ClusterMessage) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Holder
// ---------------------------------------------------------------------------

/// The local storage engine: schema, fragments, and translate stores.
///
/// The cluster core treats the holder as opaque. All mutating operations
/// must be idempotent -- the same schema or shard set may be applied more
/// than once as broadcasts and resize instructions overlap.
#[async_trait]
pub trait Holder: Send + Sync {
    /// Returns the cluster-wide schema as this node knows it, including the
    /// union of available shards per field.
    async fn schema(&self) -> anyhow::Result<Schema>;

    /// Returns `true` if any index holds any data locally.
    async fn has_data(&self) -> anyhow::Result<bool>;

    /// Releases fragments this node no longer owns. Invoked after a resize
    /// ends; failures are logged and swallowed by the caller.
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// Creates any indexes/fields/views in `schema` that are missing locally.
    async fn apply_schema(&self, schema: &Schema) -> anyhow::Result<()>;

    /// Merges a remote field's shard union into the local field.
    async fn merge_available_shards(
        &self,
        index: &str,
        field: &str,
        shards: &BTreeSet<u64>,
    ) -> anyhow::Result<()>;

    /// Writes streamed remote shard contents into the local fragment,
    /// creating the fragment if needed.
    async fn import_fragment(
        &self,
        index: &str,
        field: &str,
        view: &str,
        shard: u64,
        data: Bytes,
    ) -> anyhow::Result<()>;

    /// Merges a streamed translate-store partition into the local store.
    async fn merge_translate_partition(
        &self,
        index: &str,
        partition_id: usize,
        data: Bytes,
    ) -> anyhow::Result<()>;

    /// Applies a schema mutation broadcast (create/delete index, field,
    /// view, shard, transaction control). Opaque to the cluster core.
    async fn apply_broadcast(&self, msg: &ClusterMessage) -> anyhow::Result<()>;

    // -- Translation stores -------------------------------------------------

    /// Translates index keys to ids, positionally. In read-only mode a
    /// missing key yields id 0.
    async fn translate_index_keys(
        &self,
        index: &str,
        keys: &[String],
        writable: bool,
    ) -> anyhow::Result<Vec<u64>>;

    /// Translates ids back to index keys, positionally.
    async fn translate_index_ids(&self, index: &str, ids: &[u64]) -> anyhow::Result<Vec<String>>;

    /// Looks up existing index keys; absent keys are omitted from the map.
    async fn find_index_keys(
        &self,
        index: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>>;

    /// Creates (or finds) index keys, returning the full mapping.
    async fn create_index_keys(
        &self,
        index: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>>;

    /// Translates field keys to ids, positionally. In read-only mode a
    /// missing key yields id 0.
    async fn translate_field_keys(
        &self,
        index: &str,
        field: &str,
        keys: &[String],
        writable: bool,
    ) -> anyhow::Result<Vec<u64>>;

    /// Looks up existing field keys; absent keys are omitted from the map.
    async fn find_field_keys(
        &self,
        index: &str,
        field: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>>;

    /// Creates (or finds) field keys, returning the full mapping.
    async fn create_field_keys(
        &self,
        index: &str,
        field: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>>;
}

// ---------------------------------------------------------------------------
// InternalClient
// ---------------------------------------------------------------------------

/// RPC client for node-to-node data access.
#[async_trait]
pub trait InternalClient: Send + Sync {
    /// Streams a fragment's shard contents from `node`. Returns `Ok(None)`
    /// when the source does not have the fragment (an empty shard), which
    /// callers treat as success.
    async fn retrieve_shard(
        &self,
        node: &Node,
        index: &str,
        field: &str,
        view: &str,
        shard: u64,
    ) -> anyhow::Result<Option<Bytes>>;

    /// Streams one translate-store partition from `node`.
    async fn translate_partition(
        &self,
        node: &Node,
        index: &str,
        partition_id: usize,
    ) -> anyhow::Result<Bytes>;

    /// Probes the node's liveness endpoint. `true` means the node answered
    /// within `timeout`; any transport error or non-success status is
    /// `false`.
    async fn probe_liveness(&self, node: &Node, timeout: Duration) -> bool;

    // -- Remote translation ------------------------------------------------

    async fn translate_index_keys(
        &self,
        node: &Node,
        index: &str,
        keys: &[String],
        writable: bool,
    ) -> anyhow::Result<Vec<u64>>;

    async fn translate_index_ids(
        &self,
        node: &Node,
        index: &str,
        ids: &[u64],
    ) -> anyhow::Result<Vec<String>>;

    async fn find_index_keys(
        &self,
        node: &Node,
        index: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>>;

    async fn create_index_keys(
        &self,
        node: &Node,
        index: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>>;

    async fn translate_field_keys(
        &self,
        node: &Node,
        index: &str,
        field: &str,
        keys: &[String],
        writable: bool,
    ) -> anyhow::Result<Vec<u64>>;

    async fn find_field_keys(
        &self,
        node: &Node,
        index: &str,
        field: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>>;

    async fn create_field_keys(
        &self,
        node: &Node,
        index: &str,
        field: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>>;
}

// ---------------------------------------------------------------------------
// TranslationSyncer
// ---------------------------------------------------------------------------

/// Hook to reset background translation replication when the cluster
/// returns to NORMAL and replica routes may have changed.
#[async_trait]
pub trait TranslationSyncer: Send + Sync {
    async fn reset(&self) -> anyhow::Result<()>;
}

/// No-op syncer for deployments without translation replication.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopTranslationSyncer;

#[async_trait]
impl TranslationSyncer for NopTranslationSyncer {
    async fn reset(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
