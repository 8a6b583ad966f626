//! Allocation Engine: find a child tier with spare capacity.
//!
//! A cluster or channel is available only while its member count is below
//! the capacity ceiling. Saturated tiers are never selected again; there is
//! no eviction or rebalancing.
//!
//! Search order is `(created_at, tier_id)` ascending, so the first match is
//! deterministic for a given store state.
//!
//! Find, create and admit must happen under [`Allocator::lock`] so two
//! concurrent joiners are not both handed the last free slot of a tier.
//! Overshoot by a small margin across processes is tolerated.

use crate::error::{Error, Result};
use crate::store::NodeStore;
use crate::types::{
    now_millis, ChannelId, ChannelMainNode, ClusterId, ClusterMainNode, DomainId, TierLevel,
    TierParent, TierRef,
};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

/// Default member ceiling for clusters and channels.
pub const DEFAULT_TIER_CAPACITY: u32 = 1000;

/// Held while a find/create/admit sequence runs.
pub type AllocationGuard<'a> = MutexGuard<'a, ()>;

/// Capacity-bounded tier search.
#[derive(Debug)]
pub struct Allocator {
    capacity: u32,
    lock: Mutex<()>,
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new(DEFAULT_TIER_CAPACITY)
    }
}

impl Allocator {
    /// Create an allocator with the given member ceiling.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            lock: Mutex::new(()),
        }
    }

    /// The member ceiling.
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// True while `member_count` leaves room for one more member.
    pub const fn has_room(&self, member_count: u32) -> bool {
        member_count < self.capacity
    }

    /// Serialize allocation decisions on this node.
    pub async fn lock(&self) -> AllocationGuard<'_> {
        self.lock.lock().await
    }

    /// Find the first tier under `parent` whose member count is below the
    /// ceiling. `Ok(None)` means a new tier must be created.
    pub fn find_available_tier(
        &self,
        store: &dyn NodeStore,
        parent: &TierParent,
    ) -> Result<Option<TierRef>> {
        let found = match parent {
            TierParent::Domain(domain_id) => {
                self.find_cluster(store, domain_id)?.map(TierRef::Cluster)
            }
            TierParent::Cluster(cluster_id) => {
                self.find_channel(store, cluster_id)?.map(TierRef::Channel)
            }
        };

        match &found {
            Some(tier) => trace!(
                level = %tier.level(),
                members = tier.member_count(),
                "Found tier with spare capacity"
            ),
            None => debug!(level = %parent.child_level(), "No tier with spare capacity"),
        }
        Ok(found)
    }

    /// First cluster of `domain_id` with room.
    pub fn find_cluster(
        &self,
        store: &dyn NodeStore,
        domain_id: &DomainId,
    ) -> Result<Option<ClusterMainNode>> {
        let mut clusters = store.list_cluster_mains(domain_id)?;
        clusters.sort_by(|a, b| (a.created_at, &a.cluster_id).cmp(&(b.created_at, &b.cluster_id)));
        Ok(clusters
            .into_iter()
            .find(|row| self.has_room(row.member_count)))
    }

    /// First channel of `cluster_id` with room.
    pub fn find_channel(
        &self,
        store: &dyn NodeStore,
        cluster_id: &ClusterId,
    ) -> Result<Option<ChannelMainNode>> {
        let mut channels = store.list_channel_mains(cluster_id)?;
        channels.sort_by(|a, b| (a.created_at, &a.channel_id).cmp(&(b.created_at, &b.channel_id)));
        Ok(channels
            .into_iter()
            .find(|row| self.has_room(row.member_count)))
    }

    /// Count one more member into `tier` and persist the new count.
    pub fn admit(&self, store: &dyn NodeStore, tier: &TierRef) -> Result<TierRef> {
        match tier {
            TierRef::Cluster(row) => self.admit_cluster(store, &row.cluster_id).map(TierRef::Cluster),
            TierRef::Channel(row) => self.admit_channel(store, &row.channel_id).map(TierRef::Channel),
        }
    }

    /// Count one more member into a cluster.
    ///
    /// Re-reads the row so updates made under the allocation lock are not
    /// lost.
    pub fn admit_cluster(
        &self,
        store: &dyn NodeStore,
        cluster_id: &ClusterId,
    ) -> Result<ClusterMainNode> {
        let mut row = store
            .get_cluster_main(cluster_id)?
            .ok_or(Error::TierNotFound(TierLevel::Cluster))?;
        row.member_count = row.member_count.saturating_add(1);
        row.last_seen = now_millis();
        store.put_cluster_main(&row)?;
        Ok(row)
    }

    /// Count one more member into a channel.
    pub fn admit_channel(
        &self,
        store: &dyn NodeStore,
        channel_id: &ChannelId,
    ) -> Result<ChannelMainNode> {
        let mut row = store
            .get_channel_main(channel_id)?
            .ok_or(Error::TierNotFound(TierLevel::Channel))?;
        row.member_count = row.member_count.saturating_add(1);
        row.last_seen = now_millis();
        store.put_channel_main(&row)?;
        Ok(row)
    }
}
