//! Node Store: persistent hierarchy membership rows.
//!
//! The protocol only ever reads and writes rows through [`NodeStore`]; the
//! daemon backs it with RocksDB and tests use [`MemoryStore`].

use crate::error::{Error, Result};
use crate::types::{
    ChannelId, ChannelMainNode, ChannelNode, ClusterId, ClusterMainNode, DomainId, DomainMainNode,
    MainNodeRecord, NodeId, TierLevel,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Storage of domain/cluster/channel main-node rows and channel members.
///
/// Every method may block on I/O. Rows are never hard-deleted; the only
/// removal is the replacement of a local main-node record.
pub trait NodeStore: Send + Sync {
    // --- Domains ---

    fn put_domain_main(&self, row: &DomainMainNode) -> Result<()>;
    fn get_domain_main(&self, domain_id: &DomainId) -> Result<Option<DomainMainNode>>;
    fn list_domain_mains(&self) -> Result<Vec<DomainMainNode>>;

    // --- Clusters ---

    fn put_cluster_main(&self, row: &ClusterMainNode) -> Result<()>;
    fn get_cluster_main(&self, cluster_id: &ClusterId) -> Result<Option<ClusterMainNode>>;
    fn list_cluster_mains(&self, domain_id: &DomainId) -> Result<Vec<ClusterMainNode>>;

    // --- Channels ---

    fn put_channel_main(&self, row: &ChannelMainNode) -> Result<()>;
    fn get_channel_main(&self, channel_id: &ChannelId) -> Result<Option<ChannelMainNode>>;
    fn list_channel_mains(&self, cluster_id: &ClusterId) -> Result<Vec<ChannelMainNode>>;

    // --- Members ---

    /// Insert or refresh a member row, keyed by `(channel_id, node_id)`.
    fn put_channel_node(&self, row: &ChannelNode) -> Result<()>;
    fn list_channel_nodes(&self, channel_id: &ChannelId) -> Result<Vec<ChannelNode>>;

    // --- Local placement ---

    /// This process's cached main-node record for `level`.
    fn local_main(&self, level: TierLevel) -> Result<Option<MainNodeRecord>>;

    /// Replace (never append to) the cached record for the record's level.
    fn replace_local_main(&self, record: &MainNodeRecord) -> Result<()>;

    /// Refresh `last_seen` on every row. Returns the number of rows touched.
    fn touch_all(&self, now: u64) -> Result<usize>;

    /// The domain whose main node is `node_id`, if any.
    fn domain_owned_by(&self, node_id: &NodeId) -> Result<Option<DomainMainNode>> {
        Ok(self
            .list_domain_mains()?
            .into_iter()
            .find(|row| &row.node_id == node_id))
    }

    /// True if `node_id` has a member row in `channel_id`.
    fn is_channel_member(&self, channel_id: &ChannelId, node_id: &NodeId) -> Result<bool> {
        Ok(self
            .list_channel_nodes(channel_id)?
            .iter()
            .any(|row| &row.node_id == node_id))
    }
}

#[derive(Debug, Default)]
struct Tables {
    domains: BTreeMap<DomainId, DomainMainNode>,
    clusters: BTreeMap<ClusterId, ClusterMainNode>,
    channels: BTreeMap<ChannelId, ChannelMainNode>,
    members: BTreeMap<(ChannelId, NodeId), ChannelNode>,
    local: HashMap<TierLevel, MainNodeRecord>,
}

/// In-memory [`NodeStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T> {
        let tables = self
            .tables
            .read()
            .map_err(|_| Error::Store("memory store lock poisoned".into()))?;
        Ok(f(&tables))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> Result<T> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| Error::Store("memory store lock poisoned".into()))?;
        Ok(f(&mut tables))
    }
}

impl NodeStore for MemoryStore {
    fn put_domain_main(&self, row: &DomainMainNode) -> Result<()> {
        self.write(|t| {
            t.domains.insert(row.domain_id.clone(), row.clone());
        })
    }

    fn get_domain_main(&self, domain_id: &DomainId) -> Result<Option<DomainMainNode>> {
        self.read(|t| t.domains.get(domain_id).cloned())
    }

    fn list_domain_mains(&self) -> Result<Vec<DomainMainNode>> {
        self.read(|t| t.domains.values().cloned().collect())
    }

    fn put_cluster_main(&self, row: &ClusterMainNode) -> Result<()> {
        self.write(|t| {
            t.clusters.insert(row.cluster_id.clone(), row.clone());
        })
    }

    fn get_cluster_main(&self, cluster_id: &ClusterId) -> Result<Option<ClusterMainNode>> {
        self.read(|t| t.clusters.get(cluster_id).cloned())
    }

    fn list_cluster_mains(&self, domain_id: &DomainId) -> Result<Vec<ClusterMainNode>> {
        self.read(|t| {
            t.clusters
                .values()
                .filter(|row| &row.domain_id == domain_id)
                .cloned()
                .collect()
        })
    }

    fn put_channel_main(&self, row: &ChannelMainNode) -> Result<()> {
        self.write(|t| {
            t.channels.insert(row.channel_id.clone(), row.clone());
        })
    }

    fn get_channel_main(&self, channel_id: &ChannelId) -> Result<Option<ChannelMainNode>> {
        self.read(|t| t.channels.get(channel_id).cloned())
    }

    fn list_channel_mains(&self, cluster_id: &ClusterId) -> Result<Vec<ChannelMainNode>> {
        self.read(|t| {
            t.channels
                .values()
                .filter(|row| &row.cluster_id == cluster_id)
                .cloned()
                .collect()
        })
    }

    fn put_channel_node(&self, row: &ChannelNode) -> Result<()> {
        self.write(|t| {
            t.members
                .insert((row.channel_id.clone(), row.node_id.clone()), row.clone());
        })
    }

    fn list_channel_nodes(&self, channel_id: &ChannelId) -> Result<Vec<ChannelNode>> {
        self.read(|t| {
            t.members
                .values()
                .filter(|row| &row.channel_id == channel_id)
                .cloned()
                .collect()
        })
    }

    fn local_main(&self, level: TierLevel) -> Result<Option<MainNodeRecord>> {
        self.read(|t| t.local.get(&level).cloned())
    }

    fn replace_local_main(&self, record: &MainNodeRecord) -> Result<()> {
        self.write(|t| {
            t.local.insert(record.level(), record.clone());
        })
    }

    fn touch_all(&self, now: u64) -> Result<usize> {
        self.write(|t| {
            let mut touched = 0;
            for row in t.domains.values_mut() {
                row.last_seen = now;
                touched += 1;
            }
            for row in t.clusters.values_mut() {
                row.last_seen = now;
                touched += 1;
            }
            for row in t.channels.values_mut() {
                row.last_seen = now;
                touched += 1;
            }
            for row in t.members.values_mut() {
                row.last_seen = now;
                touched += 1;
            }
            for record in t.local.values_mut() {
                record.touch(now);
                touched += 1;
            }
            touched
        })
    }
}
