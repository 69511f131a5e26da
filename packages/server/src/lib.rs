//! Tessera Server -- cluster membership, partition placement, and resize
//! orchestration for a sharded, replicated bitmap index.
//!
//! The [`cluster`] module is the coordination core: it tracks membership,
//! maps shards and keys onto nodes deterministically, orchestrates data
//! movement when the cluster grows or shrinks, and routes key translation
//! to partition primaries. Storage, RPC, and gossip transports are
//! supplied by the embedding server through the [`cluster::traits`]
//! interfaces.

pub mod cluster;

pub use cluster::{
    determine_state, Broadcaster, Cluster, ClusterConfig, ClusterDeps, ClusterError,
    ClusterMessage, ClusterSnapshot, Holder, InternalClient, NodeEvent, NodeEventKind,
    ResizeActionKind, ResizeJobState, Topology, TranslateRouter, TranslationSyncer,
};
