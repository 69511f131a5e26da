//! Cluster coordination module.
//!
//! Provides the membership state machine, deterministic partition/replica
//! placement, resize orchestration, key-translation routing, and the wire
//! messages and collaborator traits that connect them to the embedding
//! server.

pub mod error;
pub mod messages;
pub mod resize;
pub mod snapshot;
pub mod state;
pub mod topology;
pub mod traits;
pub mod translate;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

// ---------------------------------------------------------------------------
// Re-exports — flat public API
// ---------------------------------------------------------------------------

// error
pub use error::ClusterError;

// types
pub use types::{
    ClusterConfig, NodeEvent, NodeEventKind, ResizeAction, ResizeActionKind, ResizeJobState,
};

// traits
pub use traits::{Broadcaster, Holder, InternalClient, NopTranslationSyncer, TranslationSyncer};

// messages
pub use messages::{
    AvailableShardSet, ClusterMessage, ClusterStatusPayload, FieldMessage, FragmentSource,
    IndexMessage, NodeStateMessage, NodeStatusPayload, ResizeInstructionCompletePayload,
    ResizeInstructionPayload, SetCoordinatorMessage, ShardMessage, TransactionAction,
    TransactionMessage, TranslationPartitionSource, UpdateCoordinatorMessage, ViewMessage,
};

// snapshot
pub use snapshot::ClusterSnapshot;

// topology
pub use topology::{decode as decode_topology, encode as encode_topology, Topology, TOPOLOGY_FILE};

// state
pub use state::{determine_state, AntiEntropyGate, Cluster, ClusterDeps};

// resize
pub use resize::ResizeJob;

// translate
pub use translate::TranslateRouter;

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------
