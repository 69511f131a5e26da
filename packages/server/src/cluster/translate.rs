//! Key-translation routing.
//!
//! Two translation flavors exist. Field translation is owned by the
//! coordinator (the primary field translation node): every request lands
//! there. Index translation is partitioned: each key-partition has exactly
//! one authoritative owner (its primary), and batches are split by
//! partition and fanned out concurrently. Batch order is preserved in
//! output positions. Cancellation is structural -- dropping a returned
//! future aborts any pending fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future;

use super::error::ClusterError;
use super::state::Cluster;

/// Routes key/id translation requests to their authoritative owners.
#[derive(Clone)]
pub struct TranslateRouter {
    cluster: Arc<Cluster>,
}

impl TranslateRouter {
    /// A translation router over the given cluster.
    #[must_use]
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }

    // -- Field translation --------------------------------------------------

    /// Translates field keys to row ids. Runs locally on the coordinator,
    /// otherwise the whole batch is forwarded to it.
    ///
    /// # Errors
    ///
    /// `TranslationKeyNotFound` for a missing key in read-only mode;
    /// transport and store failures as `Internal`.
    pub async fn translate_field_keys(
        &self,
        index: &str,
        field: &str,
        keys: &[String],
        writable: bool,
    ) -> Result<Vec<u64>, ClusterError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let coordinator = self
            .cluster
            .coordinator()
            .ok_or_else(|| anyhow::anyhow!("no cluster members"))?;
        let ids = if coordinator.id == self.cluster.local_id() {
            self.cluster
                .holder
                .translate_field_keys(index, field, keys, writable)
                .await?
        } else {
            self.cluster
                .client
                .translate_field_keys(&coordinator, index, field, keys, writable)
                .await?
        };
        if !writable {
            if let Some(pos) = ids.iter().position(|&id| id == 0) {
                return Err(ClusterError::TranslationKeyNotFound {
                    index: index.to_string(),
                    key: keys[pos].clone(),
                });
            }
        }
        Ok(ids)
    }

    /// Looks up existing field keys: local replica first, the remainder
    /// from the coordinator.
    ///
    /// # Errors
    ///
    /// Store or transport failures.
    pub async fn find_field_keys(
        &self,
        index: &str,
        field: &str,
        keys: &[String],
    ) -> Result<HashMap<String, u64>, ClusterError> {
        let mut found = self.cluster.holder.find_field_keys(index, field, keys).await?;
        if self.cluster.is_coordinator() {
            return Ok(found);
        }
        let missing: Vec<String> = keys
            .iter()
            .filter(|k| !found.contains_key(*k))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(found);
        }
        let coordinator = self
            .cluster
            .coordinator()
            .ok_or_else(|| anyhow::anyhow!("no cluster members"))?;
        let remote = self
            .cluster
            .client
            .find_field_keys(&coordinator, index, field, &missing)
            .await?;
        found.extend(remote);
        Ok(found)
    }

    /// Creates field keys. Keys the local replica already knows are reused;
    /// the rest are created on the coordinator.
    ///
    /// # Errors
    ///
    /// Store or transport failures.
    pub async fn create_field_keys(
        &self,
        index: &str,
        field: &str,
        keys: &[String],
    ) -> Result<HashMap<String, u64>, ClusterError> {
        if self.cluster.is_coordinator() {
            return Ok(self.cluster.holder.create_field_keys(index, field, keys).await?);
        }
        let mut found = self.cluster.holder.find_field_keys(index, field, keys).await?;
        let missing: Vec<String> = keys
            .iter()
            .filter(|k| !found.contains_key(*k))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(found);
        }
        let coordinator = self
            .cluster
            .coordinator()
            .ok_or_else(|| anyhow::anyhow!("no cluster members"))?;
        let created = self
            .cluster
            .client
            .create_field_keys(&coordinator, index, field, &missing)
            .await?;
        found.extend(created);
        Ok(found)
    }

    // -- Partitioned index translation ---------------------------------------

    /// Translates index keys to column ids, preserving caller order in the
    /// output. Keys are grouped by key-partition and each group is resolved
    /// on its primary concurrently.
    ///
    /// # Errors
    ///
    /// `TranslationKeyNotFound` when `writable` is false and a key is
    /// unknown; store/transport failures otherwise.
    pub async fn translate_index_key_set(
        &self,
        index: &str,
        keys: &[String],
        writable: bool,
    ) -> Result<Vec<u64>, ClusterError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let snap = self.cluster.snapshot();
        let mut by_partition: HashMap<usize, Vec<usize>> = HashMap::new();
        for (pos, key) in keys.iter().enumerate() {
            by_partition
                .entry(snap.key_to_key_partition(index, key))
                .or_default()
                .push(pos);
        }

        let groups = by_partition.into_iter().map(|(partition_id, positions)| {
            let sub_keys: Vec<String> = positions.iter().map(|&i| keys[i].clone()).collect();
            async move {
                let ids = self
                    .translate_partition_keys(partition_id, index, &sub_keys, writable)
                    .await?;
                Ok::<_, ClusterError>((positions, sub_keys, ids))
            }
        });

        let mut out = vec![0u64; keys.len()];
        for (positions, sub_keys, ids) in future::try_join_all(groups).await? {
            for ((pos, key), id) in positions.into_iter().zip(sub_keys).zip(ids) {
                if !writable && id == 0 {
                    return Err(ClusterError::TranslationKeyNotFound {
                        index: index.to_string(),
                        key,
                    });
                }
                out[pos] = id;
            }
        }
        Ok(out)
    }

    /// Translates column ids back to index keys, preserving caller order.
    /// Ids are grouped by the partition of their containing shard.
    ///
    /// # Errors
    ///
    /// Store/transport failures.
    pub async fn translate_index_id_set(
        &self,
        index: &str,
        ids: &[u64],
    ) -> Result<Vec<String>, ClusterError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let snap = self.cluster.snapshot();
        let mut by_partition: HashMap<usize, Vec<usize>> = HashMap::new();
        for (pos, id) in ids.iter().enumerate() {
            by_partition
                .entry(snap.id_to_shard_partition(index, *id))
                .or_default()
                .push(pos);
        }

        let groups = by_partition.into_iter().map(|(partition_id, positions)| {
            let snap = Arc::clone(&snap);
            let sub_ids: Vec<u64> = positions.iter().map(|&i| ids[i]).collect();
            async move {
                let primary = snap
                    .partition_nodes(partition_id)
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("partition {partition_id} has no owner"))?;
                let keys = if primary.id == self.cluster.local_id() {
                    self.cluster.holder.translate_index_ids(index, &sub_ids).await?
                } else {
                    self.cluster
                        .client
                        .translate_index_ids(&primary, index, &sub_ids)
                        .await?
                };
                Ok::<_, ClusterError>((positions, keys))
            }
        });

        let mut out = vec![String::new(); ids.len()];
        for (positions, keys) in future::try_join_all(groups).await? {
            for (pos, key) in positions.into_iter().zip(keys) {
                out[pos] = key;
            }
        }
        Ok(out)
    }

    /// Looks up existing index keys across partitions in parallel.
    ///
    /// # Errors
    ///
    /// Store/transport failures.
    pub async fn find_index_keys(
        &self,
        index: &str,
        keys: &[String],
    ) -> Result<HashMap<String, u64>, ClusterError> {
        self.index_key_fanout(index, keys, false).await
    }

    /// Creates (or finds) index keys across partitions in parallel.
    ///
    /// # Errors
    ///
    /// Store/transport failures.
    pub async fn create_index_keys(
        &self,
        index: &str,
        keys: &[String],
    ) -> Result<HashMap<String, u64>, ClusterError> {
        self.index_key_fanout(index, keys, true).await
    }

    async fn index_key_fanout(
        &self,
        index: &str,
        keys: &[String],
        create: bool,
    ) -> Result<HashMap<String, u64>, ClusterError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let snap = self.cluster.snapshot();
        let mut by_partition: HashMap<usize, Vec<String>> = HashMap::new();
        for key in keys {
            by_partition
                .entry(snap.key_to_key_partition(index, key))
                .or_default()
                .push(key.clone());
        }

        let groups = by_partition.into_iter().map(|(partition_id, sub_keys)| {
            let snap = Arc::clone(&snap);
            async move {
                let primary = snap
                    .partition_nodes(partition_id)
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("partition {partition_id} has no owner"))?;
                let local = primary.id == self.cluster.local_id();
                let mapping = match (local, create) {
                    (true, false) => self.cluster.holder.find_index_keys(index, &sub_keys).await?,
                    (true, true) => self.cluster.holder.create_index_keys(index, &sub_keys).await?,
                    (false, false) => {
                        self.cluster
                            .client
                            .find_index_keys(&primary, index, &sub_keys)
                            .await?
                    }
                    (false, true) => {
                        self.cluster
                            .client
                            .create_index_keys(&primary, index, &sub_keys)
                            .await?
                    }
                };
                Ok::<_, ClusterError>(mapping)
            }
        });

        let mut out = HashMap::new();
        for mapping in future::try_join_all(groups).await? {
            out.extend(mapping);
        }
        Ok(out)
    }

    async fn translate_partition_keys(
        &self,
        partition_id: usize,
        index: &str,
        keys: &[String],
        writable: bool,
    ) -> Result<Vec<u64>, ClusterError> {
        let primary = self
            .cluster
            .snapshot()
            .partition_nodes(partition_id)
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("partition {partition_id} has no owner"))?;
        let ids = if primary.id == self.cluster.local_id() {
            self.cluster
                .holder
                .translate_index_keys(index, keys, writable)
                .await?
        } else {
            self.cluster
                .client
                .translate_index_keys(&primary, index, keys, writable)
                .await?
        };
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
