//! Minimal schema model shared between peers.
//!
//! The coordination core only needs enough schema to plan data movement:
//! which indexes exist, whether they are keyed, their fields and views, and
//! the union of shards available anywhere in the cluster for each field.
//! The full storage schema belongs to the holder.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Cluster-wide schema snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub indexes: Vec<IndexMeta>,
}

/// One index: name, keying, and its fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMeta {
    pub name: String,
    /// Keyed indexes translate record keys through per-partition stores.
    pub keyed: bool,
    pub fields: Vec<FieldMeta>,
}

/// One field: views and the cluster-wide union of available shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMeta {
    pub name: String,
    /// Keyed fields translate row keys through the coordinator's store.
    pub keyed: bool,
    pub views: Vec<String>,
    pub available_shards: BTreeSet<u64>,
}

/// A single fragment coordinate: one (index, field, view, shard) cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentRef<'a> {
    pub index: &'a str,
    pub field: &'a str,
    pub view: &'a str,
    pub shard: u64,
}

impl Schema {
    /// Iterates every fragment present anywhere in the cluster: the cross
    /// product of each field's views with its available shards.
    pub fn fragments(&self) -> impl Iterator<Item = FragmentRef<'_>> {
        self.indexes.iter().flat_map(|index| {
            index.fields.iter().flat_map(move |field| {
                field.views.iter().flat_map(move |view| {
                    field.available_shards.iter().map(move |&shard| FragmentRef {
                        index: &index.name,
                        field: &field.name,
                        view,
                        shard,
                    })
                })
            })
        })
    }

    /// Returns `true` when no index holds any shard.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragments().next().is_none()
    }

    #[must_use]
    pub fn index(&self, name: &str) -> Option<&IndexMeta> {
        self.indexes.iter().find(|i| i.name == name)
    }
}
