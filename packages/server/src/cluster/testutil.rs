//! In-memory fakes shared by the cluster test suites.
//!
//! `TestCluster` wires one `Cluster` to recording fakes for single-node
//! tests; `TestNetwork` connects several clusters through an in-memory
//! broadcaster and internal client for the end-to-end scenarios.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use tessera_core::{
    ClusterState, FieldMeta, IndexMeta, Jmphasher, Node, NodeState, Schema,
};

use super::messages::{ClusterMessage, ResizeInstructionCompletePayload};
use super::state::{Cluster, ClusterDeps};
use super::topology;
use super::traits::{Broadcaster, Holder, InternalClient, NopTranslationSyncer};
use super::types::ClusterConfig;

/// Partition count assumed by every test fixture. The fake translate
/// stores hand out per-partition ID ranges against this value, mirroring
/// how real stores keep id->shard->partition routing consistent.
pub(crate) const TEST_PARTITION_N: usize = 16;

/// Installs a test-writer subscriber once; `RUST_LOG` controls verbosity.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn ready_node(id: &str) -> Node {
    let mut node = Node::new(id, format!("http://{id}:10101"));
    node.state = NodeState::Ready;
    node
}

fn merge_schema(dst: &mut Schema, src: &Schema) {
    for index in &src.indexes {
        let target = match dst.indexes.iter_mut().find(|i| i.name == index.name) {
            Some(existing) => existing,
            None => {
                dst.indexes.push(IndexMeta {
                    name: index.name.clone(),
                    keyed: index.keyed,
                    fields: Vec::new(),
                });
                dst.indexes.last_mut().unwrap()
            }
        };
        for field in &index.fields {
            let target_field = match target.fields.iter_mut().find(|f| f.name == field.name) {
                Some(existing) => existing,
                None => {
                    target.fields.push(FieldMeta {
                        name: field.name.clone(),
                        keyed: field.keyed,
                        views: Vec::new(),
                        available_shards: BTreeSet::new(),
                    });
                    target.fields.last_mut().unwrap()
                }
            };
            for view in &field.views {
                if !target_field.views.contains(view) {
                    target_field.views.push(view.clone());
                }
            }
            target_field
                .available_shards
                .extend(field.available_shards.iter().copied());
        }
    }
}

// ---------------------------------------------------------------------------
// FakeHolder
// ---------------------------------------------------------------------------

/// Recording in-memory holder with naive translate stores.
pub(crate) struct FakeHolder {
    schema: Mutex<Schema>,
    broadcasts: AtomicUsize,
    cleanups: AtomicUsize,
    imported: Mutex<Vec<(String, String, String, u64)>>,
    merged_partitions: Mutex<Vec<(String, usize)>>,
    index_keys: Mutex<HashMap<String, BTreeMap<String, u64>>>,
    index_next: Mutex<HashMap<(String, usize), u64>>,
    field_keys: Mutex<HashMap<(String, String), BTreeMap<String, u64>>>,
    next_id: AtomicU64,
}

impl FakeHolder {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_schema(Schema::default())
    }

    pub(crate) fn with_schema(schema: Schema) -> Arc<Self> {
        Arc::new(Self {
            schema: Mutex::new(schema),
            broadcasts: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
            imported: Mutex::new(Vec::new()),
            merged_partitions: Mutex::new(Vec::new()),
            index_keys: Mutex::new(HashMap::new()),
            index_next: Mutex::new(HashMap::new()),
            field_keys: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn broadcasts_seen(&self) -> usize {
        self.broadcasts.load(Ordering::SeqCst)
    }

    pub(crate) fn cleanups_run(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub(crate) fn imported(&self) -> Vec<(String, String, String, u64)> {
        self.imported.lock().clone()
    }

    pub(crate) fn merged_partitions(&self) -> Vec<(String, usize)> {
        self.merged_partitions.lock().clone()
    }

    pub(crate) fn current_schema(&self) -> Schema {
        self.schema.lock().clone()
    }

    pub(crate) fn has_index_key(&self, index: &str, key: &str) -> bool {
        self.index_keys
            .lock()
            .get(index)
            .is_some_and(|m| m.contains_key(key))
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocates an index-key id from the key partition's ID range, so the
    /// id maps back to a shard owned by the same partition.
    fn alloc_index_id(&self, index: &str, key: &str) -> u64 {
        let partition = tessera_core::key_to_key_partition(index, key, TEST_PARTITION_N);
        let shard = (0u64..100_000)
            .find(|&s| tessera_core::shard_to_shard_partition(index, s, TEST_PARTITION_N) == partition)
            .expect("no shard maps to partition");
        let mut next = self.index_next.lock();
        let offset = next.entry((index.to_string(), partition)).or_insert(0);
        *offset += 1;
        shard * tessera_core::SHARD_WIDTH + *offset
    }
}

#[async_trait]
impl Holder for FakeHolder {
    async fn schema(&self) -> anyhow::Result<Schema> {
        Ok(self.schema.lock().clone())
    }

    async fn has_data(&self) -> anyhow::Result<bool> {
        Ok(!self.schema.lock().is_empty())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn apply_schema(&self, schema: &Schema) -> anyhow::Result<()> {
        merge_schema(&mut self.schema.lock(), schema);
        Ok(())
    }

    async fn merge_available_shards(
        &self,
        index: &str,
        field: &str,
        shards: &BTreeSet<u64>,
    ) -> anyhow::Result<()> {
        let mut schema = self.schema.lock();
        if let Some(field) = schema
            .indexes
            .iter_mut()
            .find(|i| i.name == index)
            .and_then(|i| i.fields.iter_mut().find(|f| f.name == field))
        {
            field.available_shards.extend(shards.iter().copied());
        }
        Ok(())
    }

    async fn import_fragment(
        &self,
        index: &str,
        field: &str,
        view: &str,
        shard: u64,
        _data: Bytes,
    ) -> anyhow::Result<()> {
        self.imported.lock().push((
            index.to_string(),
            field.to_string(),
            view.to_string(),
            shard,
        ));
        Ok(())
    }

    async fn merge_translate_partition(
        &self,
        index: &str,
        partition_id: usize,
        _data: Bytes,
    ) -> anyhow::Result<()> {
        self.merged_partitions
            .lock()
            .push((index.to_string(), partition_id));
        Ok(())
    }

    async fn apply_broadcast(&self, _msg: &ClusterMessage) -> anyhow::Result<()> {
        self.broadcasts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn translate_index_keys(
        &self,
        index: &str,
        keys: &[String],
        writable: bool,
    ) -> anyhow::Result<Vec<u64>> {
        let mut stores = self.index_keys.lock();
        let store = stores.entry(index.to_string()).or_default();
        Ok(keys
            .iter()
            .map(|key| match store.get(key) {
                Some(&id) => id,
                None if writable => {
                    let id = self.alloc_index_id(index, key);
                    store.insert(key.clone(), id);
                    id
                }
                None => 0,
            })
            .collect())
    }

    async fn translate_index_ids(&self, index: &str, ids: &[u64]) -> anyhow::Result<Vec<String>> {
        let stores = self.index_keys.lock();
        let store = stores.get(index);
        Ok(ids
            .iter()
            .map(|id| {
                store
                    .and_then(|s| s.iter().find(|(_, v)| *v == id))
                    .map(|(k, _)| k.clone())
                    .unwrap_or_default()
            })
            .collect())
    }

    async fn find_index_keys(
        &self,
        index: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>> {
        let stores = self.index_keys.lock();
        let Some(store) = stores.get(index) else {
            return Ok(HashMap::new());
        };
        Ok(keys
            .iter()
            .filter_map(|k| store.get(k).map(|&id| (k.clone(), id)))
            .collect())
    }

    async fn create_index_keys(
        &self,
        index: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>> {
        let mut stores = self.index_keys.lock();
        let store = stores.entry(index.to_string()).or_default();
        Ok(keys
            .iter()
            .map(|key| {
                let id = match store.get(key) {
                    Some(&id) => id,
                    None => {
                        let id = self.alloc_index_id(index, key);
                        store.insert(key.clone(), id);
                        id
                    }
                };
                (key.clone(), id)
            })
            .collect())
    }

    async fn translate_field_keys(
        &self,
        index: &str,
        field: &str,
        keys: &[String],
        writable: bool,
    ) -> anyhow::Result<Vec<u64>> {
        let mut stores = self.field_keys.lock();
        let store = stores
            .entry((index.to_string(), field.to_string()))
            .or_default();
        Ok(keys
            .iter()
            .map(|key| match store.get(key) {
                Some(&id) => id,
                None if writable => {
                    let id = self.alloc_id();
                    store.insert(key.clone(), id);
                    id
                }
                None => 0,
            })
            .collect())
    }

    async fn find_field_keys(
        &self,
        index: &str,
        field: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>> {
        let stores = self.field_keys.lock();
        let Some(store) = stores.get(&(index.to_string(), field.to_string())) else {
            return Ok(HashMap::new());
        };
        Ok(keys
            .iter()
            .filter_map(|k| store.get(k).map(|&id| (k.clone(), id)))
            .collect())
    }

    async fn create_field_keys(
        &self,
        index: &str,
        field: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>> {
        let mut stores = self.field_keys.lock();
        let store = stores
            .entry((index.to_string(), field.to_string()))
            .or_default();
        Ok(keys
            .iter()
            .map(|key| {
                let id = match store.get(key) {
                    Some(&id) => id,
                    None => {
                        let id = self.alloc_id();
                        store.insert(key.clone(), id);
                        id
                    }
                };
                (key.clone(), id)
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// FakeBroadcaster
// ---------------------------------------------------------------------------

/// Records every message. When connected to a cluster it acknowledges
/// outbound resize instructions as if the remote recipient ran them.
pub(crate) struct FakeBroadcaster {
    messages: Mutex<Vec<(Option<String>, ClusterMessage)>>,
    cluster: Mutex<Option<Weak<Cluster>>>,
    instruction_failure: Mutex<Option<String>>,
}

impl FakeBroadcaster {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
            cluster: Mutex::new(None),
            instruction_failure: Mutex::new(None),
        })
    }

    pub(crate) fn connect(&self, cluster: &Arc<Cluster>) {
        *self.cluster.lock() = Some(Arc::downgrade(cluster));
    }

    pub(crate) fn fail_instructions(&self, reason: &str) {
        *self.instruction_failure.lock() = Some(reason.to_string());
    }

    /// Cluster states carried by recorded `ClusterStatus` messages.
    pub(crate) fn sent_states(&self) -> Vec<ClusterState> {
        self.messages
            .lock()
            .iter()
            .filter_map(|(_, msg)| match msg {
                ClusterMessage::ClusterStatus(status) => Some(status.state),
                _ => None,
            })
            .collect()
    }

    fn record(&self, target: Option<String>, msg: &ClusterMessage) {
        self.messages.lock().push((target, msg.clone()));
    }
}

#[async_trait]
impl Broadcaster for FakeBroadcaster {
    async fn send_sync(&self, msg: &ClusterMessage) -> anyhow::Result<()> {
        self.record(None, msg);
        Ok(())
    }

    async fn send_to(&self, node: &Node, msg: &ClusterMessage) -> anyhow::Result<()> {
        self.record(Some(node.id.clone()), msg);
        if let ClusterMessage::ResizeInstruction(instr) = msg {
            let cluster = self.cluster.lock().as_ref().and_then(Weak::upgrade);
            if let Some(cluster) = cluster {
                let complete = ResizeInstructionCompletePayload {
                    job_id: instr.job_id,
                    node: instr.node.clone(),
                    error: self.instruction_failure.lock().clone(),
                };
                cluster.mark_resize_instruction_complete(&complete);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeInternalClient
// ---------------------------------------------------------------------------

/// Scriptable internal client. Probe answers are configured per node;
/// translation calls are delegated to registered per-node fake holders.
pub(crate) struct FakeInternalClient {
    probe_responses: Mutex<HashMap<String, VecDeque<bool>>>,
    probe_counts: Mutex<HashMap<String, usize>>,
    remote_holders: Mutex<HashMap<String, Arc<FakeHolder>>>,
}

impl FakeInternalClient {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            probe_responses: Mutex::new(HashMap::new()),
            probe_counts: Mutex::new(HashMap::new()),
            remote_holders: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn set_probe_responses(&self, node_id: &str, responses: &[bool]) {
        self.probe_responses
            .lock()
            .insert(node_id.to_string(), responses.iter().copied().collect());
    }

    pub(crate) fn probe_count(&self, node_id: &str) -> usize {
        self.probe_counts.lock().get(node_id).copied().unwrap_or(0)
    }

    pub(crate) fn add_remote_holder(&self, node_id: &str) -> Arc<FakeHolder> {
        let holder = FakeHolder::new();
        self.remote_holders
            .lock()
            .insert(node_id.to_string(), Arc::clone(&holder));
        holder
    }

    pub(crate) fn remote_holder(&self, node_id: &str) -> Arc<FakeHolder> {
        Arc::clone(
            self.remote_holders
                .lock()
                .get(node_id)
                .unwrap_or_else(|| panic!("no fake holder registered for {node_id}")),
        )
    }

    fn holder_of(&self, node: &Node) -> anyhow::Result<Arc<FakeHolder>> {
        self.remote_holders
            .lock()
            .get(&node.id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no route to node {}", node.id))
    }
}

#[async_trait]
impl InternalClient for FakeInternalClient {
    async fn retrieve_shard(
        &self,
        _node: &Node,
        _index: &str,
        _field: &str,
        _view: &str,
        _shard: u64,
    ) -> anyhow::Result<Option<Bytes>> {
        Ok(Some(Bytes::from_static(b"shard-data")))
    }

    async fn translate_partition(
        &self,
        _node: &Node,
        _index: &str,
        _partition_id: usize,
    ) -> anyhow::Result<Bytes> {
        Ok(Bytes::from_static(b"translate-data"))
    }

    async fn probe_liveness(&self, node: &Node, _timeout: Duration) -> bool {
        *self.probe_counts.lock().entry(node.id.clone()).or_insert(0) += 1;
        self.probe_responses
            .lock()
            .get_mut(&node.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(false)
    }

    async fn translate_index_keys(
        &self,
        node: &Node,
        index: &str,
        keys: &[String],
        writable: bool,
    ) -> anyhow::Result<Vec<u64>> {
        self.holder_of(node)?
            .translate_index_keys(index, keys, writable)
            .await
    }

    async fn translate_index_ids(
        &self,
        node: &Node,
        index: &str,
        ids: &[u64],
    ) -> anyhow::Result<Vec<String>> {
        self.holder_of(node)?.translate_index_ids(index, ids).await
    }

    async fn find_index_keys(
        &self,
        node: &Node,
        index: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>> {
        self.holder_of(node)?.find_index_keys(index, keys).await
    }

    async fn create_index_keys(
        &self,
        node: &Node,
        index: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>> {
        self.holder_of(node)?.create_index_keys(index, keys).await
    }

    async fn translate_field_keys(
        &self,
        node: &Node,
        index: &str,
        field: &str,
        keys: &[String],
        writable: bool,
    ) -> anyhow::Result<Vec<u64>> {
        self.holder_of(node)?
            .translate_field_keys(index, field, keys, writable)
            .await
    }

    async fn find_field_keys(
        &self,
        node: &Node,
        index: &str,
        field: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>> {
        self.holder_of(node)?.find_field_keys(index, field, keys).await
    }

    async fn create_field_keys(
        &self,
        node: &Node,
        index: &str,
        field: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>> {
        self.holder_of(node)?
            .create_field_keys(index, field, keys)
            .await
    }
}

// ---------------------------------------------------------------------------
// TestCluster
// ---------------------------------------------------------------------------

/// One cluster wired to recording fakes, with its own data dir.
pub(crate) struct TestCluster {
    pub cluster: Arc<Cluster>,
    pub holder: Arc<FakeHolder>,
    pub broadcaster: Arc<FakeBroadcaster>,
    pub client: Arc<FakeInternalClient>,
    _dir: tempfile::TempDir,
}

pub(crate) struct TestClusterBuilder {
    id: String,
    replica_n: usize,
    partition_n: usize,
    seed: Option<(String, Vec<String>)>,
    schema: Schema,
}

impl TestCluster {
    pub(crate) fn builder(id: &str) -> TestClusterBuilder {
        TestClusterBuilder {
            id: id.to_string(),
            replica_n: 1,
            partition_n: 16,
            seed: None,
            schema: Schema::default(),
        }
    }

    /// Enables remote auto-acknowledgement of resize instructions.
    pub(crate) fn connect_network(&self) {
        self.broadcaster.connect(&self.cluster);
    }

    pub(crate) fn holder_for(&self, node_id: &str) -> Arc<FakeHolder> {
        if node_id == self.cluster.local_id() {
            Arc::clone(&self.holder)
        } else {
            self.client.remote_holder(node_id)
        }
    }

    /// Polls `cond` until it holds or a 5s deadline expires.
    pub(crate) async fn wait_until(&self, cond: impl Fn() -> bool, what: &str) {
        wait_until(cond, what).await;
    }
}

pub(crate) async fn wait_until(cond: impl Fn() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

impl TestClusterBuilder {
    pub(crate) fn replica_n(mut self, replica_n: usize) -> Self {
        self.replica_n = replica_n;
        self
    }

    pub(crate) fn partition_n(mut self, partition_n: usize) -> Self {
        self.partition_n = partition_n;
        self
    }

    pub(crate) fn seed_topology(mut self, cluster_id: &str, ids: &[&str]) -> Self {
        self.seed = Some((
            cluster_id.to_string(),
            ids.iter().map(|s| (*s).to_string()).collect(),
        ));
        self
    }

    pub(crate) fn with_shards(mut self, index: &str, field: &str, shards: &[u64]) -> Self {
        merge_schema(
            &mut self.schema,
            &Schema {
                indexes: vec![IndexMeta {
                    name: index.to_string(),
                    keyed: false,
                    fields: vec![FieldMeta {
                        name: field.to_string(),
                        keyed: false,
                        views: vec!["standard".to_string()],
                        available_shards: shards.iter().copied().collect(),
                    }],
                }],
            },
        );
        self
    }

    pub(crate) fn build(self) -> TestCluster {
        init_tracing();
        let dir = tempfile::tempdir().expect("tempdir");
        if let Some((cluster_id, mut ids)) = self.seed {
            ids.sort_unstable();
            std::fs::write(
                dir.path().join(topology::TOPOLOGY_FILE),
                topology::encode(&cluster_id, &ids),
            )
            .expect("seed topology");
        }
        let holder = FakeHolder::with_schema(self.schema);
        let broadcaster = FakeBroadcaster::new();
        let client = FakeInternalClient::new();
        let config = ClusterConfig {
            data_dir: dir.path().to_path_buf(),
            partition_n: self.partition_n,
            replica_n: self.replica_n,
            confirm_down_retries: 3,
            confirm_down_sleep_ms: 10,
        };
        let cluster = Arc::new(Cluster::new(
            &config,
            Node::new(self.id.clone(), format!("http://{}:10101", self.id)),
            ClusterDeps {
                hasher: Arc::new(Jmphasher),
                holder: Arc::clone(&holder) as Arc<dyn Holder>,
                broadcaster: Arc::clone(&broadcaster) as Arc<dyn Broadcaster>,
                client: Arc::clone(&client) as Arc<dyn InternalClient>,
                translation_syncer: Arc::new(NopTranslationSyncer),
            },
        ));
        TestCluster {
            cluster,
            holder,
            broadcaster,
            client,
            _dir: dir,
        }
    }
}

// ---------------------------------------------------------------------------
// TestNetwork: multi-cluster in-memory transport
// ---------------------------------------------------------------------------

/// Registry connecting several clusters through in-memory transports.
pub(crate) struct TestNetwork {
    nodes: Mutex<HashMap<String, NetEntry>>,
    retrievals: Mutex<Vec<(String, String, String, String, u64)>>,
    missing_fragments: Mutex<Vec<(String, String, String, u64)>>,
    alive: Mutex<HashMap<String, bool>>,
    statuses: Mutex<Vec<(String, ClusterState)>>,
    coordinator_updates: Mutex<Vec<(String, String)>>,
}

struct NetEntry {
    cluster: Arc<Cluster>,
    holder: Arc<FakeHolder>,
}

impl TestNetwork {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
            retrievals: Mutex::new(Vec::new()),
            missing_fragments: Mutex::new(Vec::new()),
            alive: Mutex::new(HashMap::new()),
            statuses: Mutex::new(Vec::new()),
            coordinator_updates: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn register(&self, id: &str, cluster: Arc<Cluster>, holder: Arc<FakeHolder>) {
        self.nodes
            .lock()
            .insert(id.to_string(), NetEntry { cluster, holder });
        self.alive.lock().insert(id.to_string(), true);
    }

    pub(crate) fn set_alive(&self, id: &str, alive: bool) {
        self.alive.lock().insert(id.to_string(), alive);
    }

    pub(crate) fn cluster(&self, id: &str) -> Option<Arc<Cluster>> {
        self.nodes.lock().get(id).map(|e| Arc::clone(&e.cluster))
    }

    pub(crate) fn holder(&self, id: &str) -> Arc<FakeHolder> {
        Arc::clone(&self.nodes.lock().get(id).expect("unknown node").holder)
    }

    pub(crate) fn node_ids(&self) -> Vec<String> {
        self.nodes.lock().keys().cloned().collect()
    }

    pub(crate) fn retrievals(&self) -> Vec<(String, String, String, String, u64)> {
        self.retrievals.lock().clone()
    }

    pub(crate) fn mark_fragment_missing(&self, index: &str, field: &str, view: &str, shard: u64) {
        self.missing_fragments.lock().push((
            index.to_string(),
            field.to_string(),
            view.to_string(),
            shard,
        ));
    }

    /// (sender, state) pairs from every `ClusterStatus` seen on the wire.
    pub(crate) fn status_log(&self) -> Vec<(String, ClusterState)> {
        self.statuses.lock().clone()
    }

    /// (sender, new coordinator) pairs from `UpdateCoordinator` broadcasts.
    pub(crate) fn coordinator_updates(&self) -> Vec<(String, String)> {
        self.coordinator_updates.lock().clone()
    }
}

/// Broadcaster delivering messages directly into peer clusters.
pub(crate) struct NetBroadcaster {
    network: Arc<TestNetwork>,
    local_id: String,
}

impl NetBroadcaster {
    pub(crate) fn new(network: &Arc<TestNetwork>, local_id: &str) -> Arc<Self> {
        Arc::new(Self {
            network: Arc::clone(network),
            local_id: local_id.to_string(),
        })
    }

    fn log(&self, msg: &ClusterMessage) {
        match msg {
            ClusterMessage::ClusterStatus(status) => self
                .network
                .statuses
                .lock()
                .push((self.local_id.clone(), status.state)),
            ClusterMessage::UpdateCoordinator(m) => self
                .network
                .coordinator_updates
                .lock()
                .push((self.local_id.clone(), m.new_node.id.clone())),
            _ => {}
        }
    }

    async fn deliver(&self, target_id: &str, msg: &ClusterMessage) {
        let Some(cluster) = self.network.cluster(target_id) else {
            return;
        };
        if !self.network.alive.lock().get(target_id).copied().unwrap_or(false) {
            return;
        }
        if let Err(err) = cluster.receive_message(msg.clone()).await {
            tracing::warn!(target = target_id, error = %err, "test delivery failed");
        }
    }
}

#[async_trait]
impl Broadcaster for NetBroadcaster {
    async fn send_sync(&self, msg: &ClusterMessage) -> anyhow::Result<()> {
        self.log(msg);
        let targets: Vec<String> = self
            .network
            .node_ids()
            .into_iter()
            .filter(|id| *id != self.local_id)
            .collect();
        for target in targets {
            self.deliver(&target, msg).await;
        }
        Ok(())
    }

    async fn send_to(&self, node: &Node, msg: &ClusterMessage) -> anyhow::Result<()> {
        self.log(msg);
        self.deliver(&node.id, msg).await;
        Ok(())
    }
}

/// Internal client resolving against the peers' fake holders.
pub(crate) struct NetInternalClient {
    network: Arc<TestNetwork>,
}

impl NetInternalClient {
    pub(crate) fn new(network: &Arc<TestNetwork>) -> Arc<Self> {
        Arc::new(Self {
            network: Arc::clone(network),
        })
    }

    fn holder_of(&self, node: &Node) -> anyhow::Result<Arc<FakeHolder>> {
        self.network
            .nodes
            .lock()
            .get(&node.id)
            .map(|e| Arc::clone(&e.holder))
            .ok_or_else(|| anyhow::anyhow!("no route to node {}", node.id))
    }
}

#[async_trait]
impl InternalClient for NetInternalClient {
    async fn retrieve_shard(
        &self,
        node: &Node,
        index: &str,
        field: &str,
        view: &str,
        shard: u64,
    ) -> anyhow::Result<Option<Bytes>> {
        self.network.retrievals.lock().push((
            node.id.clone(),
            index.to_string(),
            field.to_string(),
            view.to_string(),
            shard,
        ));
        let missing = self.network.missing_fragments.lock().contains(&(
            index.to_string(),
            field.to_string(),
            view.to_string(),
            shard,
        ));
        if missing {
            return Ok(None);
        }
        Ok(Some(Bytes::from_static(b"shard-data")))
    }

    async fn translate_partition(
        &self,
        _node: &Node,
        _index: &str,
        _partition_id: usize,
    ) -> anyhow::Result<Bytes> {
        Ok(Bytes::from_static(b"translate-data"))
    }

    async fn probe_liveness(&self, node: &Node, _timeout: Duration) -> bool {
        self.network.alive.lock().get(&node.id).copied().unwrap_or(false)
    }

    async fn translate_index_keys(
        &self,
        node: &Node,
        index: &str,
        keys: &[String],
        writable: bool,
    ) -> anyhow::Result<Vec<u64>> {
        self.holder_of(node)?
            .translate_index_keys(index, keys, writable)
            .await
    }

    async fn translate_index_ids(
        &self,
        node: &Node,
        index: &str,
        ids: &[u64],
    ) -> anyhow::Result<Vec<String>> {
        self.holder_of(node)?.translate_index_ids(index, ids).await
    }

    async fn find_index_keys(
        &self,
        node: &Node,
        index: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>> {
        self.holder_of(node)?.find_index_keys(index, keys).await
    }

    async fn create_index_keys(
        &self,
        node: &Node,
        index: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>> {
        self.holder_of(node)?.create_index_keys(index, keys).await
    }

    async fn translate_field_keys(
        &self,
        node: &Node,
        index: &str,
        field: &str,
        keys: &[String],
        writable: bool,
    ) -> anyhow::Result<Vec<u64>> {
        self.holder_of(node)?
            .translate_field_keys(index, field, keys, writable)
            .await
    }

    async fn find_field_keys(
        &self,
        node: &Node,
        index: &str,
        field: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>> {
        self.holder_of(node)?.find_field_keys(index, field, keys).await
    }

    async fn create_field_keys(
        &self,
        node: &Node,
        index: &str,
        field: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, u64>> {
        self.holder_of(node)?
            .create_field_keys(index, field, keys)
            .await
    }
}
