//! The cluster membership state machine.
//!
//! `Cluster` tracks the live node list, the cluster-wide state, and the
//! coordinator identity. Membership events from the gossip transport feed
//! `receive_event`; peer messages feed `receive_message`. The coordinator
//! drives state transitions and echoes them to peers as `ClusterStatus`
//! broadcasts, which non-coordinators adopt via `merge_cluster_status`.
//!
//! Locking: the cluster's own reader-writer lock protects the node list,
//! state, and cluster UUID. The topology carries its own lock and may be
//! taken while the cluster lock is held, never the reverse. The
//! anti-entropy gate is taken before the cluster lock in join/leave
//! handling. No lock is held across an await; routing reads go through a
//! lock-free `ArcSwap` snapshot republished on every membership change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use tessera_core::{sort_by_id, ClusterState, Hasher, Node, NodeState, Noder};

use super::error::ClusterError;
use super::messages::{
    ClusterMessage, ClusterStatusPayload, NodeStateMessage, UpdateCoordinatorMessage,
};
use super::resize::ResizeJob;
use super::snapshot::ClusterSnapshot;
use super::topology::Topology;
use super::traits::{Broadcaster, Holder, InternalClient, TranslationSyncer};
use super::types::{
    ClusterConfig, NodeEvent, NodeEventKind, ResizeAction, ResizeActionKind, RESIZE_QUEUE_DEPTH,
};

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// Collaborators supplied at construction. The cluster owns none of them.
pub struct ClusterDeps {
    pub hasher: Arc<dyn Hasher>,
    pub holder: Arc<dyn Holder>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub client: Arc<dyn InternalClient>,
    pub translation_syncer: Arc<dyn TranslationSyncer>,
}

// ---------------------------------------------------------------------------
// AntiEntropyGate
// ---------------------------------------------------------------------------

/// Serializes membership mutation against the background anti-entropy pass.
///
/// The anti-entropy worker holds the gate via `begin()` and polls
/// `should_abort()`; join/leave handling calls `abort_and_lock()`, which
/// flags the running pass to bail out and then waits for the gate.
pub struct AntiEntropyGate {
    abort: AtomicBool,
    mu: tokio::sync::Mutex<()>,
}

impl AntiEntropyGate {
    fn new() -> Self {
        Self {
            abort: AtomicBool::new(false),
            mu: tokio::sync::Mutex::new(()),
        }
    }

    /// Acquires the gate for an anti-entropy pass.
    pub async fn begin(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.mu.lock().await
    }

    /// `true` while a membership mutation is waiting for the gate; a
    /// running anti-entropy pass must abort promptly.
    #[must_use]
    pub fn should_abort(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Flags any running pass to abort, then acquires the gate.
    pub async fn abort_and_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.abort.store(true, Ordering::SeqCst);
        let guard = self.mu.lock().await;
        self.abort.store(false, Ordering::SeqCst);
        guard
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

pub(crate) struct ClusterInner {
    /// Cluster UUID, adopted from the persisted topology or the coordinator.
    pub id: String,
    pub state: ClusterState,
    /// Live members, sorted ascending by ID. Includes the local node.
    pub nodes: Vec<Node>,
}

/// The cluster coordination core of one node.
pub struct Cluster {
    local_id: String,
    local_uri: String,
    partition_n: usize,
    replica_n: usize,
    confirm_down_retries: usize,
    confirm_down_sleep: Duration,

    inner: RwLock<ClusterInner>,
    routing: ArcSwap<ClusterSnapshot>,
    topology: Topology,

    pub(crate) hasher: Arc<dyn Hasher>,
    pub(crate) holder: Arc<dyn Holder>,
    pub(crate) broadcaster: Arc<dyn Broadcaster>,
    pub(crate) client: Arc<dyn InternalClient>,
    translation_syncer: Arc<dyn TranslationSyncer>,

    pub(crate) actions_tx: mpsc::Sender<ResizeAction>,
    actions_rx: Mutex<Option<mpsc::Receiver<ResizeAction>>>,
    pub(crate) jobs: DashMap<u64, Arc<ResizeJob>>,
    pub(crate) current_job: Mutex<Option<Arc<ResizeJob>>>,

    joined_tx: watch::Sender<bool>,
    closing_tx: watch::Sender<bool>,
    anti_entropy: AntiEntropyGate,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Cluster {
    /// Builds a cluster for `local`. Call `setup()` before use and `start()`
    /// to run the resize worker.
    #[must_use]
    pub fn new(config: &ClusterConfig, local: Node, deps: ClusterDeps) -> Self {
        let (actions_tx, actions_rx) = mpsc::channel(RESIZE_QUEUE_DEPTH);
        let (joined_tx, _) = watch::channel(false);
        let (closing_tx, _) = watch::channel(false);
        let partition_n = config.partition_n.max(1);
        let replica_n = config.replica_n.max(1);
        let topology = Topology::new(
            &config.data_dir,
            Arc::clone(&deps.hasher),
            partition_n,
            replica_n,
        );
        let routing = ArcSwap::new(Arc::new(ClusterSnapshot::new(
            Vec::new(),
            Arc::clone(&deps.hasher),
            replica_n,
            partition_n,
        )));

        Self {
            local_id: local.id.clone(),
            local_uri: local.uri.clone(),
            partition_n,
            replica_n,
            confirm_down_retries: config.confirm_down_retries,
            confirm_down_sleep: config.confirm_down_sleep(),
            inner: RwLock::new(ClusterInner {
                id: String::new(),
                state: ClusterState::Starting,
                nodes: vec![local],
            }),
            routing,
            topology,
            hasher: deps.hasher,
            holder: deps.holder,
            broadcaster: deps.broadcaster,
            client: deps.client,
            translation_syncer: deps.translation_syncer,
            actions_tx,
            actions_rx: Mutex::new(Some(actions_rx)),
            jobs: DashMap::new(),
            current_job: Mutex::new(None),
            joined_tx,
            closing_tx,
            anti_entropy: AntiEntropyGate::new(),
            worker: Mutex::new(None),
        }
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Loads the persisted topology, adopts its cluster UUID, and registers
    /// the local node. A coordinator starting with an empty topology
    /// bootstraps a fresh UUID.
    ///
    /// # Errors
    ///
    /// Fails on unreadable/corrupt topology or persistence errors.
    pub fn setup(&self) -> Result<(), ClusterError> {
        self.topology.load()?;
        {
            let mut inner = self.inner.write();
            let persisted = self.topology.cluster_id();
            if !persisted.is_empty() {
                inner.id = persisted;
            }
            self.publish(&mut inner);
        }

        if self.is_coordinator() {
            if self.topology.is_empty() {
                let id = uuid::Uuid::new_v4().to_string();
                info!(cluster_id = %id, "bootstrapping new cluster");
                self.inner.write().id.clone_from(&id);
                self.topology.set_cluster_id(&id)?;
            }
            self.topology.add_id(&self.local_id)?;
        }
        Ok(())
    }

    /// Spawns the resize worker. Idempotent; the second call is a no-op.
    pub fn start(self: Arc<Self>) {
        let Some(rx) = self.actions_rx.lock().take() else {
            warn!("cluster already started");
            return;
        };
        let handle = tokio::spawn(super::resize::resize_worker(Arc::clone(&self), rx));
        *self.worker.lock() = Some(handle);
    }

    /// Signals shutdown and joins the resize worker.
    pub async fn close(&self) {
        let _ = self.closing_tx.send(true);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub(crate) fn closing_rx(&self) -> watch::Receiver<bool> {
        self.closing_tx.subscribe()
    }

    /// Blocks until the first `ClusterStatus` has been merged, i.e. cluster
    /// membership is known. Resolves immediately on the coordinator once it
    /// has broadcast, or on any node that already merged a status.
    ///
    /// # Errors
    ///
    /// Returns `ClusterShuttingDown` if the cluster closes first.
    pub async fn wait_for_joined(&self) -> Result<(), ClusterError> {
        let mut joined = self.joined_tx.subscribe();
        let mut closing = self.closing_tx.subscribe();
        loop {
            if *joined.borrow() {
                return Ok(());
            }
            tokio::select! {
                changed = joined.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = closing.changed() => return Err(ClusterError::ClusterShuttingDown),
            }
        }
    }

    // -- Read-only views ----------------------------------------------------

    #[must_use]
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    #[must_use]
    pub fn local_node(&self) -> Node {
        self.node_by_id(&self.local_id)
            .unwrap_or_else(|| Node::new(self.local_id.clone(), self.local_uri.clone()))
    }

    #[must_use]
    pub fn state(&self) -> ClusterState {
        self.inner.read().state
    }

    /// The cluster UUID, empty until bootstrapped or merged.
    #[must_use]
    pub fn cluster_id(&self) -> String {
        self.inner.read().id.clone()
    }

    #[must_use]
    pub fn node_by_id(&self, id: &str) -> Option<Node> {
        self.inner.read().nodes.iter().find(|n| n.id == id).cloned()
    }

    /// Lock-free routing snapshot of the current membership.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.routing.load_full()
    }

    #[must_use]
    pub fn is_coordinator(&self) -> bool {
        self.snapshot().is_primary_field_translation_node(&self.local_id)
    }

    /// The current coordinator: the primary owner of partition 0.
    #[must_use]
    pub fn coordinator(&self) -> Option<Node> {
        self.snapshot().primary_field_translation_node().cloned()
    }

    /// Gate for the external anti-entropy pass: hold it via
    /// [`AntiEntropyGate::begin`] and poll `should_abort` while running.
    #[must_use]
    pub fn anti_entropy(&self) -> &AntiEntropyGate {
        &self.anti_entropy
    }

    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    #[must_use]
    pub fn replica_n(&self) -> usize {
        self.replica_n
    }

    #[must_use]
    pub fn partition_n(&self) -> usize {
        self.partition_n
    }

    /// Owners of `(index, shard)`, primary first.
    ///
    /// During RESIZING, ownership of in-flight shards is ambiguous: writes
    /// route against this snapshot and may land at the outgoing owner; the
    /// anti-entropy pass replays them.
    #[must_use]
    pub fn shard_nodes(&self, index: &str, shard: u64) -> Vec<Node> {
        self.snapshot().shard_nodes(index, shard)
    }

    /// Primary owner of `(index, shard)`.
    #[must_use]
    pub fn primary_shard_node(&self, index: &str, shard: u64) -> Option<Node> {
        self.shard_nodes(index, shard).into_iter().next()
    }

    /// Primary owner of `(index, key)`.
    #[must_use]
    pub fn primary_key_node(&self, index: &str, key: &str) -> Option<Node> {
        self.snapshot().key_nodes(index, key).into_iter().next()
    }

    /// Builds the status payload describing this node's current view.
    ///
    /// # Errors
    ///
    /// Fails if the holder cannot produce a schema.
    pub async fn status(&self) -> Result<ClusterStatusPayload, ClusterError> {
        let schema = self.holder.schema().await?;
        let inner = self.inner.read();
        Ok(ClusterStatusPayload {
            cluster_id: inner.id.clone(),
            state: inner.state,
            nodes: inner.nodes.clone(),
            schema,
        })
    }

    // -- Membership events --------------------------------------------------

    /// Handles a membership event from the gossip transport. Events about
    /// the local node are ignored. The full protocol (join gating, liveness
    /// confirmation, resize, broadcast) runs on the coordinator; other
    /// nodes only track the membership so that coordinator selection
    /// converges. A Leave is handled by the coordinator of the *remaining*
    /// set, so a departing coordinator is handled by its successor.
    ///
    /// # Errors
    ///
    /// Surfaces rejected joins and broadcast/persistence failures.
    pub async fn receive_event(&self, event: NodeEvent) -> Result<(), ClusterError> {
        if event.node.id == self.local_id {
            return Ok(());
        }
        match event.kind {
            NodeEventKind::Join => {
                if self.is_coordinator() {
                    self.handle_join(event.node).await
                } else {
                    self.observe_node(event.node);
                    Ok(())
                }
            }
            NodeEventKind::Leave => {
                if self.handles_leave_of(&event.node.id) {
                    self.handle_leave(event.node).await
                } else {
                    let mut inner = self.inner.write();
                    inner.nodes.retain(|n| n.id != event.node.id);
                    self.publish(&mut inner);
                    Ok(())
                }
            }
            NodeEventKind::Update => {
                if self.is_coordinator() {
                    self.handle_update(event.node).await
                } else {
                    self.observe_node(event.node);
                    Ok(())
                }
            }
        }
    }

    /// Non-coordinator membership tracking: upsert the node in the live
    /// list without broadcasting or touching the persisted topology. This
    /// is what demotes a freshly started node from its one-node view of
    /// the cluster once gossip delivers the real members.
    fn observe_node(&self, node: Node) {
        let mut inner = self.inner.write();
        match inner.nodes.iter_mut().find(|n| n.id == node.id) {
            Some(existing) => {
                existing.uri.clone_from(&node.uri);
                existing.grpc_uri.clone_from(&node.grpc_uri);
                existing.state = node.state;
            }
            None => inner.nodes.push(node),
        }
        self.publish(&mut inner);
    }

    /// `true` if the local node is the coordinator of the member set with
    /// `leaving_id` excluded. This makes the successor handle the departure
    /// of the current coordinator.
    fn handles_leave_of(&self, leaving_id: &str) -> bool {
        let remaining: Vec<Node> = self
            .inner
            .read()
            .nodes
            .iter()
            .filter(|n| n.id != leaving_id)
            .cloned()
            .collect();
        ClusterSnapshot::new(
            remaining,
            Arc::clone(&self.hasher),
            self.replica_n,
            self.partition_n,
        )
        .is_primary_field_translation_node(&self.local_id)
    }

    async fn handle_join(&self, node: Node) -> Result<(), ClusterError> {
        let _gate = self.anti_entropy.abort_and_lock().await;
        let has_data = self.holder.has_data().await?;

        enum Decision {
            SendStatusTo(Node),
            Broadcast(ClusterState),
            Resize(Node),
        }

        let decision = {
            let mut inner = self.inner.write();
            if inner.state == ClusterState::Starting && !self.topology_agrees(&inner) {
                // Still assembling the persisted membership: only known
                // nodes may join.
                if !self.topology.contains(&node.id) {
                    warn!(node = %node.id, "rejecting join: not in persisted topology");
                    return Err(ClusterError::NodeNotInTopology { id: node.id });
                }
                self.add_node_locked(&mut inner, node.clone())?;
                if !has_data && self.topology_agrees(&inner) && all_ready(&inner.nodes) {
                    Decision::Broadcast(ClusterState::Normal)
                } else {
                    Decision::SendStatusTo(node)
                }
            } else if inner.nodes.iter().any(|n| n.id == node.id) {
                // Known member rejoining or changing addresses.
                self.update_node_locked(&mut inner, &node);
                let next = determine_state(
                    inner.state,
                    &self.topology.ids(),
                    &inner.nodes,
                    self.replica_n,
                );
                Decision::Broadcast(next)
            } else if !has_data {
                // Nothing to move; admit directly. Readiness still gates
                // the NORMAL transition.
                self.add_node_locked(&mut inner, node)?;
                let next = determine_state(
                    inner.state,
                    &self.topology.ids(),
                    &inner.nodes,
                    self.replica_n,
                );
                Decision::Broadcast(next)
            } else {
                Decision::Resize(node)
            }
        };

        match decision {
            Decision::SendStatusTo(node) => {
                let status = self.status().await?;
                self.broadcaster
                    .send_to(&node, &ClusterMessage::ClusterStatus(status))
                    .await?;
                Ok(())
            }
            Decision::Broadcast(state) => self.set_state_and_broadcast(state).await,
            Decision::Resize(node) => {
                info!(node = %node.id, "join requires data movement, starting resize");
                self.set_state_and_broadcast(ClusterState::Resizing).await?;
                self.enqueue_resize(node, ResizeActionKind::Add)
            }
        }
    }

    async fn handle_leave(&self, node: Node) -> Result<(), ClusterError> {
        if self.confirm_alive(&node).await {
            info!(node = %node.id, "ignoring spurious leave: node still answers liveness probes");
            return Ok(());
        }

        let _gate = self.anti_entropy.abort_and_lock().await;
        let was_coordinator = self.is_coordinator();
        let next = {
            let mut inner = self.inner.write();
            inner.nodes.retain(|n| n.id != node.id);
            self.publish(&mut inner);
            determine_state(
                inner.state,
                &self.topology.ids(),
                &inner.nodes,
                self.replica_n,
            )
        };
        self.topology.set_node_state(&node.id, NodeState::Down);

        if !was_coordinator && self.is_coordinator() {
            info!(node = %self.local_id, "assuming coordinator role");
            let msg = ClusterMessage::UpdateCoordinator(UpdateCoordinatorMessage {
                new_node: self.local_node(),
            });
            if let Err(err) = self.broadcaster.send_sync(&msg).await {
                warn!(error = %err, "failed to broadcast coordinator update");
            }
        }
        self.set_state_and_broadcast(next).await
    }

    async fn handle_update(&self, node: Node) -> Result<(), ClusterError> {
        {
            let mut inner = self.inner.write();
            if !inner.nodes.iter().any(|n| n.id == node.id) {
                warn!(node = %node.id, "update event for unknown node, ignoring");
                return Ok(());
            }
            self.update_node_locked(&mut inner, &node);
        }
        let status = self.status().await?;
        self.broadcaster
            .send_sync(&ClusterMessage::ClusterStatus(status))
            .await?;
        Ok(())
    }

    /// Probes the node up to `confirm_down_retries` times. Returns `true`
    /// if any probe succeeds (the leave was spurious).
    async fn confirm_alive(&self, node: &Node) -> bool {
        let timeout = self.confirm_down_sleep * 2;
        for attempt in 0..self.confirm_down_retries {
            if attempt > 0 {
                tokio::time::sleep(self.confirm_down_sleep).await;
            }
            if self.client.probe_liveness(node, timeout).await {
                debug!(node = %node.id, attempt, "liveness probe answered");
                return true;
            }
        }
        false
    }

    // -- Peer messages ------------------------------------------------------

    /// Dispatches an inbound cluster message. Schema mutation broadcasts are
    /// opaque here and handed to the holder.
    ///
    /// # Errors
    ///
    /// Surfaces handler failures; unknown-job completions are logged, not
    /// errors.
    pub async fn receive_message(self: Arc<Self>, msg: ClusterMessage) -> Result<(), ClusterError> {
        match msg {
            ClusterMessage::ClusterStatus(status) => self.merge_cluster_status(status).await,
            ClusterMessage::NodeState(ns) => self.receive_node_state(ns).await,
            ClusterMessage::ResizeInstruction(instr) => {
                self.follow_resize_instruction(*instr);
                Ok(())
            }
            ClusterMessage::ResizeInstructionComplete(complete) => {
                self.mark_resize_instruction_complete(&complete);
                Ok(())
            }
            ClusterMessage::UpdateCoordinator(m) => {
                self.adopt_coordinator(&m.new_node);
                Ok(())
            }
            ClusterMessage::SetCoordinator(m) => {
                // Selection is deterministic; an operator override is
                // adopted like an update and corrected on the next
                // membership change.
                self.adopt_coordinator(&m.new_node);
                Ok(())
            }
            other => Ok(self.holder.apply_broadcast(&other).await?),
        }
    }

    /// Adopts the coordinator's broadcast view: UUID, node set, node states,
    /// schema, and cluster state. No-op on the coordinator itself.
    ///
    /// # Errors
    ///
    /// Fails on schema application or topology persistence errors.
    pub async fn merge_cluster_status(
        &self,
        status: ClusterStatusPayload,
    ) -> Result<(), ClusterError> {
        if self.is_coordinator() {
            return Ok(());
        }
        debug!(state = %status.state, nodes = status.nodes.len(), "merging cluster status");
        self.holder.apply_schema(&status.schema).await?;

        let (old_state, new_state) = {
            let mut inner = self.inner.write();
            if !status.cluster_id.is_empty() && inner.id != status.cluster_id {
                inner.id.clone_from(&status.cluster_id);
            }
            for node in &status.nodes {
                match inner.nodes.iter_mut().find(|n| n.id == node.id) {
                    Some(existing) => {
                        existing.uri.clone_from(&node.uri);
                        existing.grpc_uri.clone_from(&node.grpc_uri);
                        existing.state = node.state;
                    }
                    None => inner.nodes.push(node.clone()),
                }
            }
            // Drop members the coordinator no longer lists -- except self:
            // a node never removes itself on hearsay.
            inner
                .nodes
                .retain(|n| n.id == self.local_id || status.nodes.iter().any(|s| s.id == n.id));
            let old = inner.state;
            inner.state = status.state;
            self.publish(&mut inner);
            (old, inner.state)
        };

        // Reconcile the persisted topology with the broadcast membership.
        if !status.cluster_id.is_empty() && self.topology.cluster_id() != status.cluster_id {
            self.topology.set_cluster_id(&status.cluster_id)?;
        }
        for node in &status.nodes {
            self.topology.add_id(&node.id)?;
            self.topology.set_node_state(&node.id, node.state);
        }

        self.run_transition_hooks(old_state, new_state);
        self.joined_tx.send_replace(true);
        Ok(())
    }

    /// Coordinator-side readiness handling: records the node's state and
    /// recomputes the cluster state.
    pub(crate) async fn receive_node_state(
        &self,
        msg: NodeStateMessage,
    ) -> Result<(), ClusterError> {
        if !self.is_coordinator() {
            return Ok(());
        }
        let next = {
            let mut inner = self.inner.write();
            let Some(node) = inner.nodes.iter_mut().find(|n| n.id == msg.node_id) else {
                warn!(node = %msg.node_id, "node state report from unknown node");
                return Ok(());
            };
            node.state = msg.state;
            self.publish(&mut inner);
            determine_state(
                inner.state,
                &self.topology.ids(),
                &inner.nodes,
                self.replica_n,
            )
        };
        self.topology.set_node_state(&msg.node_id, msg.state);
        debug!(node = %msg.node_id, state = %msg.state, "node readiness updated");
        self.set_state_and_broadcast(next).await
    }

    /// Reports the local node's readiness: handled directly on the
    /// coordinator, otherwise sent to it.
    ///
    /// # Errors
    ///
    /// Fails when no coordinator is known or the send fails.
    pub async fn set_node_state(&self, state: NodeState) -> Result<(), ClusterError> {
        let msg = NodeStateMessage {
            node_id: self.local_id.clone(),
            state,
        };
        if self.is_coordinator() {
            return self.receive_node_state(msg).await;
        }

        {
            let mut inner = self.inner.write();
            if let Some(node) = inner.nodes.iter_mut().find(|n| n.id == self.local_id) {
                node.state = state;
            }
            self.publish(&mut inner);
        }
        self.topology.set_node_state(&self.local_id, state);
        let coordinator = self
            .coordinator()
            .ok_or_else(|| anyhow::anyhow!("no coordinator known"))?;
        self.broadcaster
            .send_to(&coordinator, &ClusterMessage::NodeState(msg))
            .await?;
        Ok(())
    }

    // -- State transitions --------------------------------------------------

    /// Sets the cluster state, runs transition hooks, and broadcasts the
    /// resulting status to all peers.
    ///
    /// # Errors
    ///
    /// Fails if the status cannot be built or the broadcast fails; the
    /// local state change sticks regardless.
    pub async fn set_state_and_broadcast(&self, state: ClusterState) -> Result<(), ClusterError> {
        let old_state = {
            let mut inner = self.inner.write();
            let old = inner.state;
            inner.state = state;
            self.publish(&mut inner);
            old
        };
        if old_state != state {
            info!(from = %old_state, to = %state, "cluster state transition");
            metrics::counter!("tessera_cluster_state_transitions_total", "to" => state.to_string())
                .increment(1);
        }
        self.run_transition_hooks(old_state, state);
        if self.is_coordinator() {
            // The coordinator's broadcast is what peers converge on; it also
            // unblocks anyone waiting for membership on this node.
            self.joined_tx.send_replace(true);
        }
        let status = self.status().await?;
        self.broadcaster
            .send_sync(&ClusterMessage::ClusterStatus(status))
            .await?;
        Ok(())
    }

    /// Leaves RESIZING: recomputes the state from current membership as if
    /// no resize were running, then broadcasts. Used by the resize worker
    /// on job completion and abort.
    pub(crate) async fn exit_resize_and_broadcast(&self) -> Result<(), ClusterError> {
        let next = {
            let inner = self.inner.read();
            determine_state(
                ClusterState::Starting,
                &self.topology.ids(),
                &inner.nodes,
                self.replica_n,
            )
        };
        self.set_state_and_broadcast(next).await
    }

    /// Runs side effects for a state transition. Cleanup is spawned so it
    /// can never deadlock a startup path still wiring its subscribers.
    fn run_transition_hooks(&self, old_state: ClusterState, new_state: ClusterState) {
        let left_resizing = old_state == ClusterState::Resizing
            && matches!(new_state, ClusterState::Normal | ClusterState::Degraded);
        if left_resizing {
            let holder = Arc::clone(&self.holder);
            tokio::spawn(async move {
                if let Err(err) = holder.cleanup().await {
                    warn!(error = %err, "holder cleanup after resize failed");
                }
            });
        }
        if new_state == ClusterState::Normal && old_state != ClusterState::Normal {
            let syncer = Arc::clone(&self.translation_syncer);
            tokio::spawn(async move {
                if let Err(err) = syncer.reset().await {
                    warn!(error = %err, "translation syncer reset failed");
                }
            });
        }
    }

    // -- Internal membership helpers ----------------------------------------

    /// `true` when the persisted topology and the live node list name the
    /// same IDs.
    pub(crate) fn topology_agrees(&self, inner: &ClusterInner) -> bool {
        let mut live: Vec<&str> = inner.nodes.iter().map(|n| n.id.as_str()).collect();
        live.sort_unstable();
        let topo = self.topology.ids();
        topo.len() == live.len() && topo.iter().map(String::as_str).eq(live)
    }

    /// Adds a node to the live list and the persisted topology.
    pub(crate) fn add_node_locked(
        &self,
        inner: &mut ClusterInner,
        node: Node,
    ) -> Result<bool, ClusterError> {
        if inner.nodes.iter().any(|n| n.id == node.id) {
            self.update_node_locked(inner, &node);
            return Ok(false);
        }
        self.topology.add_id(&node.id)?;
        self.topology.set_node_state(&node.id, node.state);
        inner.nodes.push(node);
        self.publish(inner);
        Ok(true)
    }

    /// Removes a node from the live list and the persisted topology.
    pub(crate) fn remove_node_locked(
        &self,
        inner: &mut ClusterInner,
        id: &str,
    ) -> Result<bool, ClusterError> {
        if !inner.nodes.iter().any(|n| n.id == id) && !self.topology.contains(id) {
            return Ok(false);
        }
        self.topology.remove_id(id)?;
        inner.nodes.retain(|n| n.id != id);
        self.publish(inner);
        Ok(true)
    }

    fn update_node_locked(&self, inner: &mut ClusterInner, node: &Node) {
        if let Some(existing) = inner.nodes.iter_mut().find(|n| n.id == node.id) {
            existing.uri.clone_from(&node.uri);
            existing.grpc_uri.clone_from(&node.grpc_uri);
        }
        self.publish(inner);
    }

    /// Re-sorts the node list, refreshes coordinator flags, and republishes
    /// the routing snapshot. Must be called after every membership change,
    /// while the write lock is held.
    pub(crate) fn publish(&self, inner: &mut ClusterInner) {
        sort_by_id(&mut inner.nodes);
        let coordinator_idx = if inner.nodes.is_empty() {
            None
        } else {
            Some(self.hasher.hash(0, inner.nodes.len()))
        };
        for (i, node) in inner.nodes.iter_mut().enumerate() {
            node.is_coordinator = Some(i) == coordinator_idx;
        }
        self.routing.store(Arc::new(ClusterSnapshot::new(
            inner.nodes.clone(),
            Arc::clone(&self.hasher),
            self.replica_n,
            self.partition_n,
        )));
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("tessera_cluster_nodes").set(inner.nodes.len() as f64);
    }

    /// Marks the coordinator flags per a (Set|Update)Coordinator message.
    fn adopt_coordinator(&self, new_node: &Node) {
        info!(node = %new_node.id, "adopting coordinator");
        let mut inner = self.inner.write();
        for node in &mut inner.nodes {
            node.is_coordinator = node.id == new_node.id;
        }
        self.routing.store(Arc::new(ClusterSnapshot::new(
            inner.nodes.clone(),
            Arc::clone(&self.hasher),
            self.replica_n,
            self.partition_n,
        )));
    }

    pub(crate) fn with_inner_mut<T>(&self, f: impl FnOnce(&mut ClusterInner) -> T) -> T {
        let mut inner = self.inner.write();
        f(&mut inner)
    }

    pub(crate) fn enqueue_resize(
        &self,
        node: Node,
        kind: ResizeActionKind,
    ) -> Result<(), ClusterError> {
        self.actions_tx
            .try_send(ResizeAction { node, kind })
            .map_err(|err| anyhow::anyhow!("resize action queue unavailable: {err}").into())
    }
}

impl Noder for Cluster {
    fn nodes(&self) -> Vec<Node> {
        self.inner.read().nodes.clone()
    }
}

// ---------------------------------------------------------------------------
// State determination
// ---------------------------------------------------------------------------

fn all_ready(nodes: &[Node]) -> bool {
    !nodes.is_empty() && nodes.iter().all(|n| n.state == NodeState::Ready)
}

/// Pure cluster-state rule.
///
/// RESIZING is sticky (only the resize worker exits it). NORMAL needs the
/// live set to match the persisted topology with every node READY. A
/// started cluster missing fewer than `replica_n` members stays DEGRADED;
/// anything else is STARTING.
#[must_use]
pub fn determine_state(
    current: ClusterState,
    topology_ids: &[String],
    nodes: &[Node],
    replica_n: usize,
) -> ClusterState {
    if current == ClusterState::Resizing {
        return ClusterState::Resizing;
    }
    let live: std::collections::BTreeSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    let topo: std::collections::BTreeSet<&str> =
        topology_ids.iter().map(String::as_str).collect();
    let ready = all_ready(nodes);

    if topo == live && ready {
        return ClusterState::Normal;
    }
    let missing = topo.difference(&live).count();
    if missing >= 1 && ready && topology_ids.len().saturating_sub(nodes.len()) < replica_n {
        return ClusterState::Degraded;
    }
    ClusterState::Starting
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
