//! Tessera Core -- placement hashing, partition math, and contract types.
//!
//! This crate provides the wire-contract layer shared by every Tessera peer
//! (and by client SDKs that compute placement locally):
//!
//! - **Hash** ([`hash`]): FNV-1a 64 and the jump-consistent `Hasher`
//! - **Partition** ([`partition`]): shard/key/id to partition mapping
//! - **Node** ([`node`]): `Node`, `NodeState`, `ClusterState`, the `Noder` role
//! - **Schema** ([`schema`]): the minimal schema model resize planning needs
//!
//! Everything here must hash and serialize bit-identically across peers;
//! see the module docs for the specific contracts.

pub mod hash;
pub mod node;
pub mod partition;
pub mod schema;

// Hash
pub use hash::{fnv1a_64, Hasher, Jmphasher};

// Partition
pub use partition::{
    id_to_shard_partition, key_to_key_partition, shard_to_shard_partition, DEFAULT_PARTITION_N,
    SHARD_WIDTH,
};

// Node
pub use node::{node_by_id, node_ids, sort_by_id, ClusterState, LocalNoder, Node, NodeState, Noder};

// Schema
pub use schema::{FieldMeta, FragmentRef, IndexMeta, Schema};
