//! Resize orchestration: plan computation, job tracking, and the worker.
//!
//! When membership changes on a cluster that holds data, the coordinator
//! computes a per-node transfer plan (which fragments and translation
//! partitions move where, and from which source), distributes one
//! instruction per affected node, and collects completion reports. A single
//! dedicated worker consumes queued resize actions so at most one job is
//! ever in flight; the topology is mutated only when a job completes, so an
//! aborted job leaves membership untouched.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use tessera_core::{sort_by_id, ClusterState, Hasher, Node, Schema};

use super::error::ClusterError;
use super::messages::{
    AvailableShardSet, ClusterMessage, ClusterStatusPayload, FragmentSource, NodeStatusPayload,
    ResizeInstructionCompletePayload, ResizeInstructionPayload, TranslationPartitionSource,
};
use super::snapshot::ClusterSnapshot;
use super::state::Cluster;
use super::types::{ResizeAction, ResizeActionKind, ResizeJobState};

// ---------------------------------------------------------------------------
// ResizeJob
// ---------------------------------------------------------------------------

/// One in-flight (or terminal) resize job.
///
/// Tracks which target nodes have acknowledged their instruction. The
/// result channel is single-slot: whichever path reaches a terminal
/// conclusion first publishes it, and the worker consumes it.
pub struct ResizeJob {
    pub id: u64,
    pub kind: ResizeActionKind,
    /// The node being added or removed.
    pub node: Node,
    pub instructions: Vec<ResizeInstructionPayload>,
    targets: Mutex<HashMap<String, bool>>,
    state: RwLock<ResizeJobState>,
    result_tx: mpsc::Sender<Result<(), String>>,
    result_rx: Mutex<Option<mpsc::Receiver<Result<(), String>>>>,
}

impl ResizeJob {
    fn new(
        id: u64,
        kind: ResizeActionKind,
        node: Node,
        target_ids: Vec<String>,
        instructions: Vec<ResizeInstructionPayload>,
    ) -> Self {
        let (result_tx, result_rx) = mpsc::channel(1);
        let job = Self {
            id,
            kind,
            node,
            instructions,
            targets: Mutex::new(target_ids.into_iter().map(|id| (id, false)).collect()),
            state: RwLock::new(ResizeJobState::Running),
            result_tx,
            result_rx: Mutex::new(Some(result_rx)),
        };
        // Targets with no instruction have nothing to do; a job with no
        // instructions at all jumps straight to DONE.
        job.precomplete_workless_targets();
        job
    }

    #[must_use]
    pub fn state(&self) -> ResizeJobState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: ResizeJobState) {
        *self.state.write() = state;
    }

    /// Completion flags per target node ID.
    #[must_use]
    pub fn targets(&self) -> HashMap<String, bool> {
        self.targets.lock().clone()
    }

    pub(crate) fn take_result_rx(&self) -> Option<mpsc::Receiver<Result<(), String>>> {
        self.result_rx.lock().take()
    }

    /// Records a successful completion from `node_id`; publishes the result
    /// once every target has reported.
    pub(crate) fn mark_node_complete(&self, node_id: &str) {
        if self.state() != ResizeJobState::Running {
            return;
        }
        let all_done = {
            let mut targets = self.targets.lock();
            match targets.get_mut(node_id) {
                Some(flag) => *flag = true,
                None => {
                    warn!(job = self.id, node = node_id, "completion from non-target node");
                    return;
                }
            }
            targets.values().all(|&done| done)
        };
        if all_done {
            self.set_state(ResizeJobState::Done);
            let _ = self.result_tx.try_send(Ok(()));
        }
    }

    /// Aborts the job with a reason; the first abort wins.
    pub(crate) fn abort(&self, reason: String) {
        if self.state() != ResizeJobState::Running {
            return;
        }
        self.set_state(ResizeJobState::Aborted);
        let _ = self.result_tx.try_send(Err(reason));
    }

    fn precomplete_workless_targets(&self) {
        let mut targets = self.targets.lock();
        for (id, flag) in targets.iter_mut() {
            if !self.instructions.iter().any(|i| i.node.id == *id) {
                *flag = true;
            }
        }
        if !targets.is_empty() && targets.values().all(|&done| done) {
            drop(targets);
            self.set_state(ResizeJobState::Done);
            let _ = self.result_tx.try_send(Ok(()));
        }
    }
}

impl std::fmt::Debug for ResizeJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResizeJob")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("node", &self.node.id)
            .field("state", &self.state())
            .field("instructions", &self.instructions.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Plan computation
// ---------------------------------------------------------------------------

/// Transfer work for one recipient node.
#[derive(Debug, Clone)]
pub(crate) struct PlannedWork {
    pub recipient: Node,
    pub sources: Vec<FragmentSource>,
    pub translation_sources: Vec<TranslationPartitionSource>,
}

/// A computed resize plan: the validated diff plus per-recipient work.
#[derive(Debug, Clone)]
pub(crate) struct ResizePlan {
    pub kind: ResizeActionKind,
    pub diff_node: Node,
    /// Every node in the target cluster, whether or not it has work.
    pub targets: Vec<String>,
    /// Work items, one per recipient that must act. The newly added node is
    /// always present (it needs the schema), even with nothing to fetch.
    pub work: Vec<PlannedWork>,
}

/// Computes the transfer plan between two clusters differing by one node.
///
/// Fragment sources come from the `from` primaries: for an ADD only
/// primaries stream (sources are computed with `replica_n` = 1); for a
/// REMOVE the full `from` replica set is eligible, skipping the removed
/// node. Translation partitions move the same way for every keyed index.
///
/// # Errors
///
/// `TooManyChanges` when the diff is not exactly one node;
/// `NotEnoughReplicas` when some moved fragment or partition has no valid
/// source, which fails the whole job before anything is distributed.
pub(crate) fn plan_resize(
    from: &[Node],
    to: &[Node],
    schema: &Schema,
    hasher: &Arc<dyn Hasher>,
    replica_n: usize,
    partition_n: usize,
) -> Result<ResizePlan, ClusterError> {
    let added: Vec<&Node> = to
        .iter()
        .filter(|n| !from.iter().any(|f| f.id == n.id))
        .collect();
    let removed: Vec<&Node> = from
        .iter()
        .filter(|n| !to.iter().any(|t| t.id == n.id))
        .collect();
    let (kind, diff_node) = match (added.as_slice(), removed.as_slice()) {
        ([node], []) => (ResizeActionKind::Add, (*node).clone()),
        ([], [node]) => (ResizeActionKind::Remove, (*node).clone()),
        _ => {
            return Err(ClusterError::TooManyChanges {
                added: added.len(),
                removed: removed.len(),
            })
        }
    };

    let from_snap = ClusterSnapshot::new(from.to_vec(), Arc::clone(hasher), replica_n, partition_n);
    let to_snap = ClusterSnapshot::new(to.to_vec(), Arc::clone(hasher), replica_n, partition_n);
    // For an ADD only primaries need to stream.
    let src_replica_n = match kind {
        ResizeActionKind::Add => 1,
        ResizeActionKind::Remove => replica_n,
    };
    let src_snap =
        ClusterSnapshot::new(from.to_vec(), Arc::clone(hasher), src_replica_n, partition_n);
    let removed_id = (kind == ResizeActionKind::Remove).then(|| diff_node.id.clone());

    let mut work: BTreeMap<String, PlannedWork> = BTreeMap::new();
    fn work_for<'a>(
        work: &'a mut BTreeMap<String, PlannedWork>,
        recipient: &Node,
    ) -> &'a mut PlannedWork {
        work.entry(recipient.id.clone()).or_insert_with(|| PlannedWork {
            recipient: recipient.clone(),
            sources: Vec::new(),
            translation_sources: Vec::new(),
        })
    }

    // Fragment plan: stream every fragment a recipient gains under `to`.
    for frag in schema.fragments() {
        let from_owners = from_snap.shard_nodes(frag.index, frag.shard);
        let to_owners = to_snap.shard_nodes(frag.index, frag.shard);
        for recipient in &to_owners {
            if from_owners.iter().any(|n| n.id == recipient.id) {
                continue;
            }
            let source = src_snap
                .shard_nodes(frag.index, frag.shard)
                .into_iter()
                .find(|n| removed_id.as_deref() != Some(n.id.as_str()))
                .ok_or(ClusterError::NotEnoughReplicas)?;
            work_for(&mut work, recipient).sources.push(FragmentSource {
                node: source,
                index: frag.index.to_string(),
                field: frag.field.to_string(),
                view: frag.view.to_string(),
                shard: frag.shard,
            });
        }
    }

    // Translation plan: every key partition of every keyed index.
    for index in &schema.indexes {
        if !index.keyed {
            continue;
        }
        for partition_id in 0..partition_n {
            let from_owners = from_snap.partition_nodes(partition_id);
            let to_owners = to_snap.partition_nodes(partition_id);
            for recipient in &to_owners {
                if from_owners.iter().any(|n| n.id == recipient.id) {
                    continue;
                }
                let source = from_owners
                    .iter()
                    .find(|n| removed_id.as_deref() != Some(n.id.as_str()))
                    .cloned()
                    .ok_or(ClusterError::NotEnoughReplicas)?;
                work_for(&mut work, recipient)
                    .translation_sources
                    .push(TranslationPartitionSource {
                        node: source,
                        index: index.name.clone(),
                        partition_id,
                    });
            }
        }
    }

    // The newly added node needs an instruction even with nothing to fetch,
    // so it receives the schema.
    if kind == ResizeActionKind::Add {
        work_for(&mut work, &diff_node);
    }

    Ok(ResizePlan {
        kind,
        diff_node,
        targets: to.iter().map(|n| n.id.clone()).collect(),
        work: work.into_values().collect(),
    })
}

fn available_shard_sets(schema: &Schema) -> Vec<AvailableShardSet> {
    schema
        .indexes
        .iter()
        .flat_map(|index| {
            index.fields.iter().map(move |field| AvailableShardSet {
                index: index.name.clone(),
                field: field.name.clone(),
                shards: field.available_shards.clone(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Cluster: resize orchestration
// ---------------------------------------------------------------------------

impl Cluster {
    /// Explicitly removes a node. Coordinator-only, only in NORMAL or
    /// DEGRADED, only for a non-local member. The transfer plan is computed
    /// up front so an impossible removal (`NotEnoughReplicas`) is rejected
    /// before any membership change.
    ///
    /// # Errors
    ///
    /// `CoordinatorOnly`, `InvalidState`, `NodeNotFound`,
    /// `NotEnoughReplicas`, or persistence/broadcast failures.
    pub async fn remove_node(&self, id: &str) -> Result<(), ClusterError> {
        if !self.is_coordinator() {
            return Err(ClusterError::CoordinatorOnly);
        }
        let state = self.state();
        if !matches!(state, ClusterState::Normal | ClusterState::Degraded) {
            return Err(ClusterError::InvalidState {
                expected: "NORMAL or DEGRADED".to_string(),
                actual: state.to_string(),
            });
        }
        if id == self.local_id() {
            return Err(anyhow::anyhow!("cannot remove the local node").into());
        }
        if !self.topology().contains(id) {
            return Err(ClusterError::NodeNotFound { id: id.to_string() });
        }
        let node = self
            .node_by_id(id)
            .ok_or_else(|| ClusterError::NodeNotFound { id: id.to_string() })?;

        // Pre-validate: compute the would-be plan and fail fast.
        let from = tessera_core::Noder::nodes(self);
        let to: Vec<Node> = from.iter().filter(|n| n.id != id).cloned().collect();
        let schema = self.holder.schema().await?;
        plan_resize(
            &from,
            &to,
            &schema,
            &self.hasher,
            self.replica_n(),
            self.partition_n(),
        )?;

        if !self.holder.has_data().await? {
            info!(node = id, "removing node directly: holder is empty");
            self.with_inner_mut(|inner| self.remove_node_locked(inner, id))?;
            return self.exit_resize_and_broadcast().await;
        }

        self.set_state_and_broadcast(ClusterState::Resizing).await?;
        self.enqueue_resize(node, ResizeActionKind::Remove)
    }

    /// Creates and registers the resize job for an action. Hard error if a
    /// job already exists.
    pub(crate) async fn generate_resize_job(
        &self,
        action: &ResizeAction,
    ) -> Result<Arc<ResizeJob>, ClusterError> {
        if self.current_job.lock().is_some() {
            return Err(ClusterError::ResizeInProgress);
        }

        let from = tessera_core::Noder::nodes(self);
        let to: Vec<Node> = match action.kind {
            ResizeActionKind::Add => {
                let mut to = from.clone();
                if !to.iter().any(|n| n.id == action.node.id) {
                    to.push(action.node.clone());
                    sort_by_id(&mut to);
                }
                to
            }
            ResizeActionKind::Remove => {
                from.iter().filter(|n| n.id != action.node.id).cloned().collect()
            }
        };

        let schema = self.holder.schema().await?;
        let plan = plan_resize(
            &from,
            &to,
            &schema,
            &self.hasher,
            self.replica_n(),
            self.partition_n(),
        )?;

        // The attached status carries the union of both clusters so a
        // joining node learns the full membership; peers adopting it early
        // reconverge on the terminal broadcast.
        let mut status_nodes = from.clone();
        for node in &to {
            if !status_nodes.iter().any(|n| n.id == node.id) {
                status_nodes.push(node.clone());
            }
        }
        sort_by_id(&mut status_nodes);
        let cluster_status = ClusterStatusPayload {
            cluster_id: self.cluster_id(),
            state: ClusterState::Resizing,
            nodes: status_nodes,
            schema: schema.clone(),
        };

        let job_id = rand::rng().random::<u64>() >> 1;
        let coordinator = self.local_node();
        let shard_sets = available_shard_sets(&schema);
        let instructions: Vec<ResizeInstructionPayload> = plan
            .work
            .iter()
            .map(|w| ResizeInstructionPayload {
                job_id,
                node: w.recipient.clone(),
                coordinator: coordinator.clone(),
                sources: w.sources.clone(),
                translation_sources: w.translation_sources.clone(),
                node_status: NodeStatusPayload {
                    node: w.recipient.clone(),
                    schema: schema.clone(),
                    available_shards: shard_sets.clone(),
                },
                cluster_status: cluster_status.clone(),
            })
            .collect();

        let job = Arc::new(ResizeJob::new(
            job_id,
            plan.kind,
            plan.diff_node,
            plan.targets,
            instructions,
        ));
        info!(
            job = job.id,
            kind = %job.kind,
            node = %job.node.id,
            instructions = job.instructions.len(),
            "resize job created"
        );
        *self.current_job.lock() = Some(Arc::clone(&job));
        self.jobs.insert(job_id, Arc::clone(&job));
        Ok(job)
    }

    /// Sends every instruction to its recipient. The local node's own
    /// instruction is executed directly. A failed send aborts the job.
    pub(crate) async fn distribute_resize_instructions(
        self: Arc<Self>,
        job: &Arc<ResizeJob>,
    ) -> Result<(), ClusterError> {
        for instr in &job.instructions {
            if instr.node.id == self.local_id() {
                Arc::clone(&self).follow_resize_instruction(instr.clone());
                continue;
            }
            let msg = ClusterMessage::ResizeInstruction(Box::new(instr.clone()));
            if let Err(err) = self.broadcaster.send_to(&instr.node, &msg).await {
                job.abort(format!("sending instruction to {}: {err}", instr.node.id));
                return Ok(());
            }
        }
        Ok(())
    }

    /// Recipient side: runs an instruction asynchronously and reports the
    /// outcome to the coordinator.
    pub(crate) fn follow_resize_instruction(self: Arc<Self>, instr: ResizeInstructionPayload) {
        let cluster = self;
        tokio::spawn(async move {
            debug!(job = instr.job_id, "following resize instruction");
            let result = cluster.apply_resize_instruction(&instr).await;
            if let Err(err) = &result {
                warn!(job = instr.job_id, error = %err, "resize instruction failed");
            }
            let complete = ResizeInstructionCompletePayload {
                job_id: instr.job_id,
                node: cluster.local_node(),
                error: result.err().map(|e| e.to_string()),
            };
            if instr.coordinator.id == cluster.local_id() {
                cluster.mark_resize_instruction_complete(&complete);
            } else if let Err(err) = cluster
                .broadcaster
                .send_to(
                    &instr.coordinator,
                    &ClusterMessage::ResizeInstructionComplete(complete),
                )
                .await
            {
                error!(job = instr.job_id, error = %err, "failed to report resize completion");
            }
        });
    }

    async fn apply_resize_instruction(
        &self,
        instr: &ResizeInstructionPayload,
    ) -> anyhow::Result<()> {
        // Adopt the coordinator's view first so routing agrees with the
        // plan being applied.
        self.merge_cluster_status(instr.cluster_status.clone())
            .await
            .map_err(anyhow::Error::new)?;
        self.holder.apply_schema(&instr.node_status.schema).await?;
        for set in &instr.node_status.available_shards {
            self.holder
                .merge_available_shards(&set.index, &set.field, &set.shards)
                .await?;
        }

        for src in &instr.sources {
            match self
                .client
                .retrieve_shard(&src.node, &src.index, &src.field, &src.view, src.shard)
                .await?
            {
                Some(data) => {
                    self.holder
                        .import_fragment(&src.index, &src.field, &src.view, src.shard, data)
                        .await?;
                }
                // The source never wrote this shard: an empty fragment is
                // not an error.
                None => debug!(
                    index = %src.index,
                    field = %src.field,
                    shard = src.shard,
                    "fragment not found at source, treating as empty"
                ),
            }
        }

        for src in &instr.translation_sources {
            let data = self
                .client
                .translate_partition(&src.node, &src.index, src.partition_id)
                .await?;
            self.holder
                .merge_translate_partition(&src.index, src.partition_id, data)
                .await?;
        }
        Ok(())
    }

    /// Coordinator side: records one node's completion report.
    pub(crate) fn mark_resize_instruction_complete(
        &self,
        complete: &ResizeInstructionCompletePayload,
    ) {
        let Some(job) = self.jobs.get(&complete.job_id).map(|j| Arc::clone(&j)) else {
            warn!(job = complete.job_id, "completion report for unknown resize job");
            return;
        };
        match &complete.error {
            Some(err) => {
                warn!(job = job.id, node = %complete.node.id, error = %err, "resize instruction reported failure");
                job.abort(err.clone());
            }
            None => {
                debug!(job = job.id, node = %complete.node.id, "resize instruction complete");
                job.mark_node_complete(&complete.node.id);
            }
        }
    }

    /// Runs one action to a terminal state: generate, distribute, await the
    /// result, then finalize (DONE mutates the topology, ABORTED leaves it
    /// untouched) and return the cluster to NORMAL or DEGRADED.
    pub(crate) async fn process_resize_action(
        self: Arc<Self>,
        action: ResizeAction,
    ) -> Result<(), ClusterError> {
        info!(node = %action.node.id, kind = %action.kind, "processing resize action");
        let job = match self.generate_resize_job(&action).await {
            Ok(job) => job,
            Err(err) => {
                error!(error = %err, "resize job generation failed");
                // No job was installed; restore the cluster state.
                self.exit_resize_and_broadcast().await?;
                return Err(err);
            }
        };
        metrics::counter!("tessera_resize_jobs_total", "action" => action.kind.to_string())
            .increment(1);

        Arc::clone(&self).distribute_resize_instructions(&job).await?;

        let Some(mut result_rx) = job.take_result_rx() else {
            return Err(anyhow::anyhow!("resize job result receiver already taken").into());
        };
        let mut closing = self.closing_rx();
        let result = tokio::select! {
            result = result_rx.recv() => {
                result.unwrap_or_else(|| Err("resize job result channel closed".to_string()))
            }
            _ = closing.changed() => return Err(ClusterError::ClusterShuttingDown),
        };
        self.complete_current_job(&job, result).await
    }

    async fn complete_current_job(
        &self,
        job: &Arc<ResizeJob>,
        result: Result<(), String>,
    ) -> Result<(), ClusterError> {
        match result {
            Ok(()) => {
                job.set_state(ResizeJobState::Done);
                match job.kind {
                    ResizeActionKind::Add => {
                        let node = job.node.clone();
                        self.with_inner_mut(|inner| self.add_node_locked(inner, node))?;
                    }
                    ResizeActionKind::Remove => {
                        self.with_inner_mut(|inner| self.remove_node_locked(inner, &job.node.id))?;
                    }
                }
                info!(job = job.id, kind = %job.kind, node = %job.node.id, "resize job complete");
            }
            Err(reason) => {
                job.set_state(ResizeJobState::Aborted);
                warn!(job = job.id, reason = %reason, "resize job aborted; membership unchanged");
            }
        }
        *self.current_job.lock() = None;
        self.exit_resize_and_broadcast().await
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// The dedicated resize worker: consumes queued actions one at a time,
/// driving each to DONE or ABORTED before the next. A failed job is logged
/// and the worker keeps serving; shutdown wins over a pending result.
pub(crate) async fn resize_worker(cluster: Arc<Cluster>, mut actions: mpsc::Receiver<ResizeAction>) {
    let mut closing = cluster.closing_rx();
    debug!("resize worker started");
    loop {
        tokio::select! {
            _ = closing.changed() => {
                debug!("resize worker stopping");
                return;
            }
            action = actions.recv() => {
                let Some(action) = action else { return };
                match Arc::clone(&cluster).process_resize_action(action).await {
                    Ok(()) => {}
                    Err(ClusterError::ClusterShuttingDown) => return,
                    Err(err) => error!(error = %err, "resize action failed"),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
