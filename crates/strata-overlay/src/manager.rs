//! Node Manager: the single entry point of the overlay protocol.
//!
//! One manager runs per process. It plays both sides of the handshake:
//!
//! - as a **main node** it answers `newClusterNode`, `newChannelNode`,
//!   `registerTo*Node` and `addNewNode`, running the Allocation Engine and
//!   sending `registerConfirmed` to joiners in the background;
//! - as a **joiner** it drives each of its joins through the Confirmation
//!   State Machine, arming one confirmation timer per outstanding level.
//!
//! ```text
//!  joiner J                         main node P
//!  ────────                         ───────────
//!  registerToDomainNode ──────────▶ validate, find/create cluster
//!  arm timer (J, domain)   ◀─ ack ─ spawn registerConfirmed
//!  registerConfirmed(domain) ◀───── (background)
//!  cancel timer, cache main row
//!  registerToClusterNode ─────────▶ …
//! ```
//!
//! Every call takes an explicit [`NodeContext`] naming the node it acts as.

use crate::allocation::Allocator;
use crate::confirmation::{ConfirmationStep, JoinPhase, JoinProgress, JoinSnapshot};
use crate::directory::PeerDirectory;
use crate::error::{Error, Result};
use crate::escalator::{ConfirmationTimers, RetryDecision, RetryPolicy};
use crate::rpc::{
    Ack, AddNewNode, NewChannelRequest, NewClusterRequest, PeerClient, RegisterAccepted,
    RegisterConfirmed, RegisterToChannelRequest, RegisterToClusterRequest,
    RegisterToDomainRequest, RpcOperation,
};
use crate::store::NodeStore;
use crate::supervisor::TaskSupervisor;
use crate::types::{
    generate_tier_id, now_millis, ChannelId, ChannelMainNode, ChannelNode, ClusterId,
    ClusterMainNode, DomainId, DomainMainNode, JoinId, MainNodeRecord, NodeContext, NodeId,
    PeerAddr, PeerTarget, TierLevel,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Default time a finished join stays queryable (10 minutes).
pub const DEFAULT_FINISHED_JOIN_RETENTION: Duration = Duration::from_secs(600);

/// Configuration for a Node Manager.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Confirmation timeout and retry bound.
    pub retry: RetryPolicy,

    /// Member ceiling for clusters and channels.
    pub tier_capacity: u32,

    /// When the domain level of a join runs out of retries, bootstrap a
    /// private domain instead of abandoning the join.
    pub bootstrap_on_exhaustion: bool,

    /// How long a placed or abandoned join stays queryable.
    pub finished_join_retention: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            tier_capacity: crate::allocation::DEFAULT_TIER_CAPACITY,
            bootstrap_on_exhaustion: false,
            finished_join_retention: DEFAULT_FINISHED_JOIN_RETENTION,
        }
    }
}

impl OverlayConfig {
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_tier_capacity(mut self, capacity: u32) -> Self {
        self.tier_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_bootstrap_on_exhaustion(mut self, enabled: bool) -> Self {
        self.bootstrap_on_exhaustion = enabled;
        self
    }

    #[must_use]
    pub fn with_finished_join_retention(mut self, retention: Duration) -> Self {
        self.finished_join_retention = retention;
        self
    }
}

/// This node's cached main-node records, one per level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalPlacement {
    pub domain: Option<DomainMainNode>,
    pub cluster: Option<ClusterMainNode>,
    pub channel: Option<ChannelMainNode>,
    /// Set once this node is a member of its cached channel.
    pub member: Option<ChannelNode>,
}

struct JoinEntry {
    progress: JoinProgress,
    phase_tx: watch::Sender<JoinPhase>,
}

impl JoinEntry {
    fn publish(&self) {
        self.phase_tx.send_replace(self.progress.phase.clone());
    }
}

struct Inner {
    config: OverlayConfig,
    store: Arc<dyn NodeStore>,
    client: Arc<dyn PeerClient>,
    directory: Arc<dyn PeerDirectory>,
    allocator: Allocator,
    timers: ConfirmationTimers,
    supervisor: TaskSupervisor,
    joins: Mutex<HashMap<JoinId, JoinEntry>>,
}

/// The overlay façade. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct NodeManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for NodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeManager")
            .field("config", &self.inner.config)
            .field("armed_timers", &self.inner.timers.armed_count())
            .field("background_tasks", &self.inner.supervisor.in_flight())
            .finish()
    }
}

impl NodeManager {
    /// Create a manager over the given store, carrier and directory.
    pub fn new(
        config: OverlayConfig,
        store: Arc<dyn NodeStore>,
        client: Arc<dyn PeerClient>,
        directory: Arc<dyn PeerDirectory>,
    ) -> Self {
        let allocator = Allocator::new(config.tier_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                client,
                directory,
                allocator,
                timers: ConfirmationTimers::new(),
                supervisor: TaskSupervisor::new(),
                joins: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.inner.store
    }

    pub fn directory(&self) -> &Arc<dyn PeerDirectory> {
        &self.inner.directory
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.inner.supervisor
    }

    pub fn timers(&self) -> &ConfirmationTimers {
        &self.inner.timers
    }

    // --- Tier creation (self-registration) ---

    /// Make the acting node the main node of a brand-new domain.
    ///
    /// Idempotent: a node that already owns a domain gets that domain back.
    pub async fn new_domain_node(&self, ctx: &NodeContext) -> Result<DomainMainNode> {
        let me = ctx.require_node()?;
        let store = self.store();

        if let Some(existing) = store.domain_owned_by(me)? {
            store.replace_local_main(&MainNodeRecord::Domain(existing.clone()))?;
            debug!(domain_id = %existing.domain_id, "Domain already owned by this node");
            return Ok(existing);
        }

        let row = DomainMainNode::new(
            me.clone(),
            DomainId::new(generate_tier_id(TierLevel::Domain, me)),
        );
        store.put_domain_main(&row)?;
        store.replace_local_main(&MainNodeRecord::Domain(row.clone()))?;
        info!(domain_id = %row.domain_id, node_id = %me, "Created domain");
        Ok(row)
    }

    /// `newClusterNode`: create (or return) a cluster owned by `req.node_id`
    /// in a domain the acting node is main node of.
    pub async fn new_cluster_node(
        &self,
        ctx: &NodeContext,
        req: NewClusterRequest,
    ) -> Result<ClusterMainNode> {
        let me = ctx.require_node()?;
        let store = self.store();
        let domain = match &req.domain_id {
            Some(domain_id) => store
                .get_domain_main(domain_id)?
                .ok_or(Error::TierNotFound(TierLevel::Domain))?,
            None => store
                .domain_owned_by(me)?
                .ok_or(Error::TierNotFound(TierLevel::Domain))?,
        };
        if &domain.node_id != me {
            return Err(Error::NotMainNode(TierLevel::Domain));
        }

        let _guard = self.inner.allocator.lock().await;
        self.create_cluster_locked(me, &domain, &req.node_id)
    }

    /// `newChannelNode`: create (or return) a channel owned by `req.node_id`
    /// in a cluster the acting node is main node of.
    pub async fn new_channel_node(
        &self,
        ctx: &NodeContext,
        req: NewChannelRequest,
    ) -> Result<ChannelMainNode> {
        let me = ctx.require_node()?;
        let store = self.store();
        let cluster = match &req.cluster_id {
            Some(cluster_id) => store
                .get_cluster_main(cluster_id)?
                .ok_or(Error::TierNotFound(TierLevel::Cluster))?,
            None => match store.local_main(TierLevel::Cluster)? {
                Some(MainNodeRecord::Cluster(row)) if &row.node_id == me => store
                    .get_cluster_main(&row.cluster_id)?
                    .unwrap_or(row),
                _ => return Err(Error::TierNotFound(TierLevel::Cluster)),
            },
        };
        if &cluster.node_id != me {
            return Err(Error::NotMainNode(TierLevel::Cluster));
        }

        let _guard = self.inner.allocator.lock().await;
        self.create_channel_locked(me, &cluster, &req.node_id)
    }

    /// Bootstrap a private hierarchy: domain, cluster and channel all owned
    /// by the acting node, which becomes a member of its own channel.
    pub async fn bootstrap(&self, ctx: &NodeContext) -> Result<ChannelNode> {
        let me = ctx.require_node()?.clone();
        let domain = self.new_domain_node(ctx).await?;
        let cluster = self
            .new_cluster_node(
                ctx,
                NewClusterRequest {
                    node_id: me.clone(),
                    domain_id: Some(domain.domain_id),
                },
            )
            .await?;
        let channel = self
            .new_channel_node(
                ctx,
                NewChannelRequest {
                    node_id: me,
                    cluster_id: Some(cluster.cluster_id),
                },
            )
            .await?;
        Ok(channel.creator_member())
    }

    // Callers must hold the allocation lock.
    fn create_cluster_locked(
        &self,
        me: &NodeId,
        domain: &DomainMainNode,
        owner: &NodeId,
    ) -> Result<ClusterMainNode> {
        let store = self.store();
        let allocator = &self.inner.allocator;

        let mut owned: Vec<_> = store
            .list_cluster_mains(&domain.domain_id)?
            .into_iter()
            .filter(|row| &row.node_id == owner && allocator.has_room(row.member_count))
            .collect();
        owned.sort_by(|a, b| (a.created_at, &a.cluster_id).cmp(&(b.created_at, &b.cluster_id)));

        let row = match owned.into_iter().next() {
            Some(existing) => {
                debug!(cluster_id = %existing.cluster_id, owner = %owner, "Reusing owned cluster");
                existing
            }
            None => {
                let mut row = ClusterMainNode::new(
                    owner.clone(),
                    domain.domain_id.clone(),
                    ClusterId::new(generate_tier_id(TierLevel::Cluster, owner)),
                );
                row.member_count = 1;
                store.put_cluster_main(&row)?;
                info!(
                    cluster_id = %row.cluster_id,
                    domain_id = %row.domain_id,
                    owner = %owner,
                    "Created cluster"
                );
                row
            }
        };

        if owner == me {
            store.replace_local_main(&MainNodeRecord::Cluster(row.clone()))?;
        }
        Ok(row)
    }

    // Callers must hold the allocation lock.
    fn create_channel_locked(
        &self,
        me: &NodeId,
        cluster: &ClusterMainNode,
        owner: &NodeId,
    ) -> Result<ChannelMainNode> {
        let store = self.store();
        let allocator = &self.inner.allocator;

        let mut owned: Vec<_> = store
            .list_channel_mains(&cluster.cluster_id)?
            .into_iter()
            .filter(|row| &row.node_id == owner && allocator.has_room(row.member_count))
            .collect();
        owned.sort_by(|a, b| (a.created_at, &a.channel_id).cmp(&(b.created_at, &b.channel_id)));

        let row = match owned.into_iter().next() {
            Some(existing) => {
                debug!(channel_id = %existing.channel_id, owner = %owner, "Reusing owned channel");
                existing
            }
            None => {
                let mut row = ChannelMainNode::new(
                    owner.clone(),
                    cluster.domain_id.clone(),
                    cluster.cluster_id.clone(),
                    ChannelId::new(generate_tier_id(TierLevel::Channel, owner)),
                );
                row.member_count = 1;
                store.put_channel_main(&row)?;
                info!(
                    channel_id = %row.channel_id,
                    cluster_id = %row.cluster_id,
                    owner = %owner,
                    "Created channel"
                );
                row
            }
        };

        store.put_channel_node(&row.creator_member())?;
        if owner == me {
            store.replace_local_main(&MainNodeRecord::Channel(row.clone()))?;
        }
        Ok(row)
    }

    // --- Main-node side of the handshake ---

    /// `registerToDomainNode`: admit `req.node_id` into a cluster of this
    /// node's domain, creating the cluster if none has room, and confirm in
    /// the background.
    pub async fn register_to_domain_node(
        &self,
        ctx: &NodeContext,
        req: RegisterToDomainRequest,
    ) -> Result<RegisterAccepted> {
        let me = ctx.require_node()?;
        let store = self.store();
        let domain = store
            .get_domain_main(&req.domain_id)?
            .ok_or(Error::TierNotFound(TierLevel::Domain))?;
        if &domain.node_id != me {
            return Err(Error::NotMainNode(TierLevel::Domain));
        }
        let joiner_addr = self.recognize(&req.node_id, req.requester_addr.as_ref())?;

        let cluster = {
            let _guard = self.inner.allocator.lock().await;
            let cluster = match self.inner.allocator.find_cluster(store.as_ref(), &domain.domain_id)? {
                Some(cluster) => cluster,
                None => self.create_cluster_locked(me, &domain, me)?,
            };
            self.inner.allocator.admit_cluster(store.as_ref(), &cluster.cluster_id)?
        };
        info!(
            join_id = %req.join_id,
            node_id = %req.node_id,
            cluster_id = %cluster.cluster_id,
            members = cluster.member_count,
            "Admitted node into domain"
        );

        let confirmation = RegisterConfirmed {
            domain_id: domain.domain_id,
            cluster_id: Some(cluster.cluster_id),
            channel_id: None,
            node_id: me.clone(),
            target_node_id: req.node_id,
            confirmed_by: TierLevel::Domain,
            join_id: req.join_id.clone(),
            next_main_node_addr: self.address_of(ctx, &cluster.node_id),
            next_main_node_id: Some(cluster.node_id),
        };
        self.send_confirmation(joiner_addr, confirmation);

        Ok(RegisterAccepted {
            join_id: req.join_id,
            level: TierLevel::Domain,
        })
    }

    /// `registerToClusterNode`: admit `req.node_id` into a channel of the
    /// cluster, creating the channel if none has room.
    pub async fn register_to_cluster_node(
        &self,
        ctx: &NodeContext,
        req: RegisterToClusterRequest,
    ) -> Result<RegisterAccepted> {
        let me = ctx.require_node()?;
        let store = self.store();
        let cluster = store
            .get_cluster_main(&req.cluster_id)?
            .ok_or(Error::TierNotFound(TierLevel::Cluster))?;
        if &cluster.node_id != me {
            return Err(Error::NotMainNode(TierLevel::Cluster));
        }
        let joiner_addr = self.recognize(&req.node_id, req.requester_addr.as_ref())?;

        let channel = {
            let _guard = self.inner.allocator.lock().await;
            let channel = match self.inner.allocator.find_channel(store.as_ref(), &cluster.cluster_id)? {
                Some(channel) => channel,
                None => self.create_channel_locked(me, &cluster, me)?,
            };
            self.inner.allocator.admit_channel(store.as_ref(), &channel.channel_id)?
        };
        info!(
            join_id = %req.join_id,
            node_id = %req.node_id,
            channel_id = %channel.channel_id,
            members = channel.member_count,
            "Admitted node into cluster"
        );

        let confirmation = RegisterConfirmed {
            domain_id: cluster.domain_id,
            cluster_id: Some(cluster.cluster_id),
            channel_id: Some(channel.channel_id),
            node_id: me.clone(),
            target_node_id: req.node_id,
            confirmed_by: TierLevel::Cluster,
            join_id: req.join_id.clone(),
            next_main_node_addr: self.address_of(ctx, &channel.node_id),
            next_main_node_id: Some(channel.node_id),
        };
        self.send_confirmation(joiner_addr, confirmation);

        Ok(RegisterAccepted {
            join_id: req.join_id,
            level: TierLevel::Cluster,
        })
    }

    /// `registerToChannelNode`: record the joiner as a channel member,
    /// announce it to the existing members, and confirm.
    pub async fn register_to_channel_node(
        &self,
        ctx: &NodeContext,
        req: RegisterToChannelRequest,
    ) -> Result<RegisterAccepted> {
        let me = ctx.require_node()?;
        let store = self.store();
        let channel = store
            .get_channel_main(&req.channel_id)?
            .ok_or(Error::TierNotFound(TierLevel::Channel))?;
        if &channel.node_id != me || &req.node_id != me {
            return Err(Error::NotMainNode(TierLevel::Channel));
        }
        let joiner_addr = self.recognize(&req.target_node_id, req.requester_addr.as_ref())?;

        let existing = store.list_channel_nodes(&channel.channel_id)?;
        let already_member = existing.iter().any(|m| m.node_id == req.target_node_id);
        store.put_channel_node(&ChannelNode {
            node_id: req.target_node_id.clone(),
            domain_id: channel.domain_id.clone(),
            cluster_id: channel.cluster_id.clone(),
            channel_id: channel.channel_id.clone(),
            last_seen: now_millis(),
        })?;

        if already_member {
            debug!(node_id = %req.target_node_id, "Node already a channel member, skipping fan-out");
        } else {
            info!(
                join_id = %req.join_id,
                node_id = %req.target_node_id,
                channel_id = %channel.channel_id,
                peers = existing.len(),
                "Added channel member"
            );
            let announcement = AddNewNode {
                domain_id: channel.domain_id.clone(),
                cluster_id: channel.cluster_id.clone(),
                channel_id: channel.channel_id.clone(),
                target_node_id: req.target_node_id.clone(),
                target_addr: Some(joiner_addr.clone()),
            };
            for member in existing
                .iter()
                .filter(|m| &m.node_id != me && m.node_id != req.target_node_id)
            {
                self.announce_member(&member.node_id, announcement.clone());
            }
        }

        let confirmation = RegisterConfirmed {
            domain_id: channel.domain_id,
            cluster_id: Some(channel.cluster_id),
            channel_id: Some(channel.channel_id),
            node_id: me.clone(),
            target_node_id: req.target_node_id,
            confirmed_by: TierLevel::Channel,
            join_id: req.join_id.clone(),
            next_main_node_id: None,
            next_main_node_addr: None,
        };
        self.send_confirmation(joiner_addr, confirmation);

        Ok(RegisterAccepted {
            join_id: req.join_id,
            level: TierLevel::Channel,
        })
    }

    /// `addNewNode`: learn about a new member of a channel this node is in.
    pub async fn add_new_node(&self, ctx: &NodeContext, req: AddNewNode) -> Result<Ack> {
        let me = ctx.require_node()?;
        let store = self.store();
        if !store.is_channel_member(&req.channel_id, me)? {
            return Err(Error::TierNotFound(TierLevel::Channel));
        }
        if let Some(addr) = &req.target_addr {
            self.directory().register(&req.target_node_id, addr);
        }
        store.put_channel_node(&ChannelNode {
            node_id: req.target_node_id.clone(),
            domain_id: req.domain_id,
            cluster_id: req.cluster_id,
            channel_id: req.channel_id.clone(),
            last_seen: now_millis(),
        })?;
        debug!(node_id = %req.target_node_id, channel_id = %req.channel_id, "Learned new channel member");
        Ok(Ack {})
    }

    /// Register the joiner's address if given; the joiner must resolve.
    fn recognize(&self, node_id: &NodeId, addr: Option<&PeerAddr>) -> Result<PeerAddr> {
        if node_id.is_empty() {
            return Err(Error::InvalidRequest("node_id is empty".into()));
        }
        if let Some(addr) = addr {
            self.directory().register(node_id, addr);
        }
        self.directory()
            .resolve(node_id)
            .ok_or_else(|| Error::UnknownNode(node_id.clone()))
    }

    fn address_of(&self, ctx: &NodeContext, node_id: &NodeId) -> Option<PeerAddr> {
        if node_id == &ctx.node_id {
            ctx.addr.clone()
        } else {
            self.directory().resolve(node_id)
        }
    }

    fn send_confirmation(&self, joiner: PeerAddr, confirmation: RegisterConfirmed) {
        let client = Arc::clone(&self.inner.client);
        self.inner.supervisor.spawn("registerConfirmed", async move {
            client.register_confirmed(&joiner, confirmation).await.map(|_| ())
        });
    }

    fn announce_member(&self, member: &NodeId, announcement: AddNewNode) {
        let Some(addr) = self.directory().resolve(member) else {
            warn!(member = %member, "No address for channel member, skipping addNewNode");
            return;
        };
        let client = Arc::clone(&self.inner.client);
        self.inner.supervisor.spawn("addNewNode", async move {
            client.add_new_node(&addr, announcement).await.map(|_| ())
        });
    }

    // --- Joiner side of the handshake ---

    /// Start joining `domain_id` through its main node.
    ///
    /// Returns once the domain registration has been sent. A rejection from
    /// the domain main node is returned immediately and never retried; a
    /// transport failure is left to the confirmation timer.
    pub async fn join(
        &self,
        ctx: &NodeContext,
        domain_id: DomainId,
        domain_main: PeerTarget,
    ) -> Result<JoinId> {
        let me = ctx.require_node()?;
        self.directory()
            .register(&domain_main.node_id, &domain_main.addr);

        let join_id = JoinId::generate(me);
        let progress =
            JoinProgress::new(join_id.clone(), ctx.clone(), domain_id, domain_main.node_id);
        let attempt = progress.attempt;
        let (phase_tx, _) = watch::channel(progress.phase.clone());
        self.lock_joins().insert(
            join_id.clone(),
            JoinEntry {
                progress,
                phase_tx,
            },
        );
        info!(join_id = %join_id, node_id = %me, "Starting join");

        self.start_confirmation_timeout(&join_id, TierLevel::Domain);
        match self.dispatch(&join_id, TierLevel::Domain, attempt).await {
            Ok(_) => Ok(join_id),
            Err(e) if e.is_retriable() => {
                warn!(join_id = %join_id, error = %e, "Domain registration failed, awaiting retry");
                Ok(join_id)
            }
            Err(e) => {
                self.abandon(&join_id, TierLevel::Domain, &e);
                Err(e)
            }
        }
    }

    /// `registerConfirmed`: a main node confirmed one level of a join.
    pub async fn register_confirmed(
        &self,
        ctx: &NodeContext,
        req: RegisterConfirmed,
    ) -> Result<Ack> {
        let me = ctx.require_node()?;
        if &req.target_node_id != me {
            return Err(Error::MisaddressedConfirmation(req.target_node_id));
        }
        if let (Some(next), Some(addr)) = (&req.next_main_node_id, &req.next_main_node_addr) {
            self.directory().register(next, addr);
        }

        // The step is staged on a copy and committed only once the local
        // records are written. A failed write leaves the phase and the armed
        // timer untouched, so the level is retried.
        let step = {
            let mut joins = self.lock_joins();
            let entry = joins
                .get_mut(&req.join_id)
                .ok_or_else(|| Error::JoinNotFound(req.join_id.clone()))?;
            let mut staged = entry.progress.clone();
            let step = staged.apply(&req)?;
            match &step {
                ConfirmationStep::Ignored(_) => {}
                ConfirmationStep::Advance { confirmed, next, .. } => {
                    self.store()
                        .replace_local_main(&confirmed_record(&req, &staged))?;
                    let attempt = staged.request_level(*next);
                    self.cancel_confirmation_timeout(&req.join_id, *confirmed);
                    self.start_confirmation_timeout(&req.join_id, *next);
                    self.dispatch_in_background(req.join_id.clone(), *next, attempt);
                }
                ConfirmationStep::Completed(member) => {
                    self.store()
                        .replace_local_main(&confirmed_record(&req, &staged))?;
                    self.store().put_channel_node(member)?;
                    self.cancel_confirmation_timeout(&req.join_id, TierLevel::Channel);
                }
            }
            if !matches!(step, ConfirmationStep::Ignored(_)) {
                entry.progress = staged;
                entry.publish();
            }
            step
        };

        match step {
            ConfirmationStep::Ignored(reason) => {
                debug!(
                    join_id = %req.join_id,
                    level = %req.confirmed_by,
                    reason = ?reason,
                    "Ignoring confirmation"
                );
            }
            ConfirmationStep::Advance { confirmed, next, .. } => {
                info!(join_id = %req.join_id, level = %confirmed, next = %next, "Level confirmed");
            }
            ConfirmationStep::Completed(member) => {
                info!(
                    join_id = %req.join_id,
                    domain_id = %member.domain_id,
                    cluster_id = %member.cluster_id,
                    channel_id = %member.channel_id,
                    "Join complete"
                );
                self.retire(&req.join_id);
            }
        }
        Ok(Ack {})
    }

    /// Send registration `attempt` for `level` of a join to that level's
    /// main node. Returns `None` without sending if the attempt is stale.
    async fn dispatch(
        &self,
        join_id: &JoinId,
        level: TierLevel,
        attempt: u64,
    ) -> Result<Option<RegisterAccepted>> {
        let progress = {
            let joins = self.lock_joins();
            let entry = joins
                .get(join_id)
                .ok_or_else(|| Error::JoinNotFound(join_id.clone()))?;
            if !entry.progress.is_current(level, attempt) {
                debug!(join_id = %join_id, level = %level, attempt, "Skipping stale registration");
                return Ok(None);
            }
            entry.progress.clone()
        };
        let target = progress
            .target(level)
            .cloned()
            .ok_or(Error::TierNotFound(level))?;
        let addr = self
            .directory()
            .resolve(&target)
            .ok_or_else(|| Error::UnknownNode(target.clone()))?;
        let ctx = &progress.ctx;
        let client = &self.inner.client;

        debug!(
            join_id = %join_id,
            op = %RpcOperation::register_to(level),
            target = %target,
            retry = progress.retry_count,
            "Sending registration"
        );
        let accepted = match level {
            TierLevel::Domain => {
                client
                    .register_to_domain_node(
                        &addr,
                        RegisterToDomainRequest {
                            domain_id: progress.domain_id.clone(),
                            node_id: ctx.node_id.clone(),
                            join_id: join_id.clone(),
                            requester_addr: ctx.addr.clone(),
                        },
                    )
                    .await
            }
            TierLevel::Cluster => {
                let cluster_id = progress
                    .cluster_id
                    .clone()
                    .ok_or(Error::TierNotFound(TierLevel::Cluster))?;
                client
                    .register_to_cluster_node(
                        &addr,
                        RegisterToClusterRequest {
                            cluster_id,
                            node_id: ctx.node_id.clone(),
                            join_id: join_id.clone(),
                            requester_addr: ctx.addr.clone(),
                        },
                    )
                    .await
            }
            TierLevel::Channel => {
                let channel_id = progress
                    .channel_id
                    .clone()
                    .ok_or(Error::TierNotFound(TierLevel::Channel))?;
                client
                    .register_to_channel_node(
                        &addr,
                        RegisterToChannelRequest {
                            channel_id,
                            node_id: target,
                            target_node_id: ctx.node_id.clone(),
                            join_id: join_id.clone(),
                            requester_addr: ctx.addr.clone(),
                        },
                    )
                    .await
            }
        }?;

        if let Some(entry) = self.lock_joins().get_mut(join_id) {
            if entry.progress.accepted(level, attempt) {
                entry.publish();
            }
        }
        Ok(Some(accepted))
    }

    /// Dispatch without blocking the caller. Rejections of the current
    /// attempt abandon the join; transport failures are left to the
    /// confirmation timer.
    fn dispatch_in_background(&self, join_id: JoinId, level: TierLevel, attempt: u64) {
        let manager = self.clone();
        self.inner.supervisor.spawn("registerToNode", async move {
            match manager.dispatch(&join_id, level, attempt).await {
                Ok(_) => Ok(()),
                Err(e) if e.is_retriable() => Err(e),
                Err(e) => {
                    if manager.is_current(&join_id, level, attempt) {
                        manager.abandon(&join_id, level, &e);
                    }
                    Err(e)
                }
            }
        });
    }

    fn is_current(&self, join_id: &JoinId, level: TierLevel, attempt: u64) -> bool {
        self.lock_joins()
            .get(join_id)
            .is_some_and(|entry| entry.progress.is_current(level, attempt))
    }

    fn abandon(&self, join_id: &JoinId, level: TierLevel, reason: &dyn std::fmt::Display) {
        self.inner.timers.cancel_join(join_id);
        {
            let mut joins = self.lock_joins();
            let Some(entry) = joins.get_mut(join_id) else {
                return;
            };
            if entry.progress.phase.is_terminal() {
                return;
            }
            entry.progress.abandon(level, reason.to_string());
            entry.publish();
        }
        warn!(join_id = %join_id, level = %level, reason = %reason, "Join abandoned");
        self.retire(join_id);
    }

    /// Drop a finished join once the retention period has passed.
    fn retire(&self, join_id: &JoinId) {
        let inner = Arc::downgrade(&self.inner);
        let join_id = join_id.clone();
        let retention = self.inner.config.finished_join_retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if let Some(inner) = inner.upgrade() {
                NodeManager { inner }.forget_join(&join_id);
            }
        });
    }

    /// Remove a finished join from the table. Joins still in progress are
    /// kept; returns true if an entry was removed.
    pub fn forget_join(&self, join_id: &JoinId) -> bool {
        let mut joins = self.lock_joins();
        let finished = joins
            .get(join_id)
            .is_some_and(|entry| entry.progress.phase.is_terminal());
        if finished {
            joins.remove(join_id);
            debug!(join_id = %join_id, "Forgot finished join");
        }
        finished
    }

    // --- Timeout/Retry Escalator ---

    /// Arm the confirmation timer for `level` of a join.
    pub fn start_confirmation_timeout(&self, join_id: &JoinId, level: TierLevel) {
        let manager = self.clone();
        let expired = join_id.clone();
        self.inner.timers.start(
            (join_id.clone(), level),
            self.inner.config.retry.confirmation_timeout,
            async move { manager.on_confirmation_timeout(expired, level).await },
        );
    }

    /// Disarm the confirmation timer for `level`. Idempotent.
    pub fn cancel_confirmation_timeout(&self, join_id: &JoinId, level: TierLevel) -> bool {
        self.inner.timers.cancel(&(join_id.clone(), level))
    }

    async fn on_confirmation_timeout(&self, join_id: JoinId, level: TierLevel) {
        let decision = {
            let joins = self.lock_joins();
            let Some(entry) = joins.get(&join_id) else {
                return;
            };
            if entry.progress.phase.pending_level() != Some(level) {
                debug!(join_id = %join_id, level = %level, "Stale confirmation timeout ignored");
                return;
            }
            self.inner.config.retry.decide(level, entry.progress.retry_count)
        };

        warn!(join_id = %join_id, level = %level, decision = ?decision, "Confirmation timed out");
        match decision {
            RetryDecision::RetryCurrentLevel { .. } => self.retry_current_level(&join_id, level),
            RetryDecision::RetryUpperLevel { upper } => {
                self.retry_upper_level(&join_id, level, upper)
            }
            RetryDecision::Exhausted => self.exhausted(&join_id).await,
        }
    }

    /// Re-send the same level's registration and re-arm its timer.
    ///
    /// The timer is armed and the send scheduled under the joins lock, so a
    /// confirmation arriving meanwhile cancels both.
    pub fn retry_current_level(&self, join_id: &JoinId, level: TierLevel) {
        let mut joins = self.lock_joins();
        let Some(entry) = joins.get_mut(join_id) else {
            return;
        };
        if entry.progress.phase.pending_level() != Some(level) {
            return;
        }
        let attempt = entry.progress.retry(level);
        entry.publish();
        info!(join_id = %join_id, level = %level, retry = entry.progress.retry_count, "Retrying registration");
        self.start_confirmation_timeout(join_id, level);
        self.dispatch_in_background(join_id.clone(), level, attempt);
    }

    /// Abandon `level` and ask the main node of `upper` for a fresh
    /// allocation, with a fresh retry count.
    pub fn retry_upper_level(&self, join_id: &JoinId, level: TierLevel, upper: TierLevel) {
        let mut joins = self.lock_joins();
        let Some(entry) = joins.get_mut(join_id) else {
            return;
        };
        if entry.progress.phase.pending_level() != Some(level) {
            return;
        }
        let attempt = entry.progress.escalate_to(upper);
        entry.publish();
        info!(join_id = %join_id, from = %level, to = %upper, "Escalating to upper level");
        self.cancel_confirmation_timeout(join_id, level);
        self.start_confirmation_timeout(join_id, upper);
        self.dispatch_in_background(join_id.clone(), upper, attempt);
    }

    async fn exhausted(&self, join_id: &JoinId) {
        if !self.inner.config.bootstrap_on_exhaustion {
            self.abandon(join_id, TierLevel::Domain, &"domain confirmation retries exhausted");
            return;
        }

        let Some(ctx) = self
            .lock_joins()
            .get(join_id)
            .map(|entry| entry.progress.ctx.clone())
        else {
            return;
        };
        info!(join_id = %join_id, "Domain unreachable, bootstrapping own hierarchy");
        match self.bootstrap(&ctx).await {
            Ok(member) => {
                if let Some(entry) = self.lock_joins().get_mut(join_id) {
                    entry.progress.domain_id = member.domain_id;
                    entry.progress.cluster_id = Some(member.cluster_id);
                    entry.progress.channel_id = Some(member.channel_id);
                    entry.progress.phase = JoinPhase::Confirmed(TierLevel::Channel);
                    entry.publish();
                }
                self.retire(join_id);
            }
            Err(e) => self.abandon(join_id, TierLevel::Domain, &e),
        }
    }

    // --- Tier hosting ---

    /// Ask a domain main node to create a cluster owned by this node, and
    /// record it as this node's local cluster.
    pub async fn request_cluster(
        &self,
        ctx: &NodeContext,
        domain_main: &PeerTarget,
        domain_id: Option<DomainId>,
    ) -> Result<ClusterMainNode> {
        let me = ctx.require_node()?;
        self.directory().register(&domain_main.node_id, &domain_main.addr);
        let row = self
            .inner
            .client
            .new_cluster_node(
                &domain_main.addr,
                NewClusterRequest {
                    node_id: me.clone(),
                    domain_id,
                },
            )
            .await?;
        if &row.node_id != me {
            return Err(Error::NotMainNode(TierLevel::Cluster));
        }
        let store = self.store();
        store.put_cluster_main(&row)?;
        store.replace_local_main(&MainNodeRecord::Cluster(row.clone()))?;
        info!(cluster_id = %row.cluster_id, "Hosting cluster");
        Ok(row)
    }

    /// Ask a cluster main node to create a channel owned by this node, and
    /// record it as this node's local channel.
    pub async fn request_channel(
        &self,
        ctx: &NodeContext,
        cluster_main: &PeerTarget,
        cluster_id: Option<ClusterId>,
    ) -> Result<ChannelMainNode> {
        let me = ctx.require_node()?;
        self.directory().register(&cluster_main.node_id, &cluster_main.addr);
        let row = self
            .inner
            .client
            .new_channel_node(
                &cluster_main.addr,
                NewChannelRequest {
                    node_id: me.clone(),
                    cluster_id,
                },
            )
            .await?;
        if &row.node_id != me {
            return Err(Error::NotMainNode(TierLevel::Channel));
        }
        let store = self.store();
        store.put_channel_main(&row)?;
        store.put_channel_node(&row.creator_member())?;
        store.replace_local_main(&MainNodeRecord::Channel(row.clone()))?;
        info!(channel_id = %row.channel_id, "Hosting channel");
        Ok(row)
    }

    // --- Queries ---

    pub fn join_status(&self, join_id: &JoinId) -> Option<JoinSnapshot> {
        self.lock_joins()
            .get(join_id)
            .map(|entry| entry.progress.snapshot())
    }

    /// Snapshots of every tracked join.
    pub fn joins(&self) -> Vec<JoinSnapshot> {
        self.lock_joins()
            .values()
            .map(|entry| entry.progress.snapshot())
            .collect()
    }

    /// Watch the phase of a join.
    pub fn subscribe(&self, join_id: &JoinId) -> Option<watch::Receiver<JoinPhase>> {
        self.lock_joins()
            .get(join_id)
            .map(|entry| entry.phase_tx.subscribe())
    }

    /// Wait until the join is placed or abandoned, returning the final phase.
    pub async fn wait_for_placement(&self, join_id: &JoinId) -> Result<JoinPhase> {
        let mut rx = self
            .subscribe(join_id)
            .ok_or_else(|| Error::JoinNotFound(join_id.clone()))?;
        let phase = rx
            .wait_for(JoinPhase::is_terminal)
            .await
            .map_err(|_| Error::JoinNotFound(join_id.clone()))?;
        Ok(phase.clone())
    }

    /// This node's cached main-node records and own membership.
    pub fn placement(&self, ctx: &NodeContext) -> Result<LocalPlacement> {
        let me = ctx.require_node()?;
        let store = self.store();
        let domain = match store.local_main(TierLevel::Domain)? {
            Some(MainNodeRecord::Domain(row)) => Some(row),
            _ => None,
        };
        let cluster = match store.local_main(TierLevel::Cluster)? {
            Some(MainNodeRecord::Cluster(row)) => Some(row),
            _ => None,
        };
        let channel = match store.local_main(TierLevel::Channel)? {
            Some(MainNodeRecord::Channel(row)) => Some(row),
            _ => None,
        };
        let member = match &channel {
            Some(row) => store
                .list_channel_nodes(&row.channel_id)?
                .into_iter()
                .find(|m| &m.node_id == me),
            None => None,
        };
        Ok(LocalPlacement {
            domain,
            cluster,
            channel,
            member,
        })
    }

    fn lock_joins(&self) -> MutexGuard<'_, HashMap<JoinId, JoinEntry>> {
        match self.inner.joins.lock() {
            Ok(joins) => joins,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The main-node record a confirmation installs for its level.
fn confirmed_record(req: &RegisterConfirmed, progress: &JoinProgress) -> MainNodeRecord {
    let domain_id = progress.domain_id.clone();
    match (req.confirmed_by, &progress.cluster_id, &progress.channel_id) {
        (TierLevel::Cluster, Some(cluster_id), _) => MainNodeRecord::Cluster(ClusterMainNode::new(
            req.node_id.clone(),
            domain_id,
            cluster_id.clone(),
        )),
        (TierLevel::Channel, Some(cluster_id), Some(channel_id)) => {
            MainNodeRecord::Channel(ChannelMainNode::new(
                req.node_id.clone(),
                domain_id,
                cluster_id.clone(),
                channel_id.clone(),
            ))
        }
        _ => MainNodeRecord::Domain(DomainMainNode::new(req.node_id.clone(), domain_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    /// A carrier with no peers behind it.
    struct Unreachable;

    #[async_trait]
    impl PeerClient for Unreachable {
        async fn new_cluster_node(&self, peer: &PeerAddr, _: NewClusterRequest) -> Result<ClusterMainNode> {
            Err(Error::Transport(format!("{} unreachable", peer)))
        }
        async fn new_channel_node(&self, peer: &PeerAddr, _: NewChannelRequest) -> Result<ChannelMainNode> {
            Err(Error::Transport(format!("{} unreachable", peer)))
        }
        async fn register_to_domain_node(&self, peer: &PeerAddr, _: RegisterToDomainRequest) -> Result<RegisterAccepted> {
            Err(Error::Transport(format!("{} unreachable", peer)))
        }
        async fn register_to_cluster_node(&self, peer: &PeerAddr, _: RegisterToClusterRequest) -> Result<RegisterAccepted> {
            Err(Error::Transport(format!("{} unreachable", peer)))
        }
        async fn register_to_channel_node(&self, peer: &PeerAddr, _: RegisterToChannelRequest) -> Result<RegisterAccepted> {
            Err(Error::Transport(format!("{} unreachable", peer)))
        }
        async fn register_confirmed(&self, peer: &PeerAddr, _: RegisterConfirmed) -> Result<Ack> {
            Err(Error::Transport(format!("{} unreachable", peer)))
        }
        async fn add_new_node(&self, peer: &PeerAddr, _: AddNewNode) -> Result<Ack> {
            Err(Error::Transport(format!("{} unreachable", peer)))
        }
    }

    fn manager() -> NodeManager {
        NodeManager::new(
            OverlayConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(Unreachable),
            Arc::new(StaticDirectory::new()),
        )
    }

    #[tokio::test]
    async fn domain_creation_is_idempotent() {
        let manager = manager();
        let ctx = NodeContext::new("a");

        let first = manager.new_domain_node(&ctx).await.unwrap();
        let second = manager.new_domain_node(&ctx).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(manager.store().list_domain_mains().unwrap().len(), 1);
        let placement = manager.placement(&ctx).unwrap();
        assert_eq!(placement.domain.unwrap().domain_id, first.domain_id);
    }

    #[tokio::test]
    async fn missing_node_identity_is_rejected() {
        let manager = manager();
        let err = manager.new_domain_node(&NodeContext::new("")).await.unwrap_err();
        assert!(matches!(err, Error::NoLocalNode));
        assert_eq!(err.to_string(), "no current user/node set");
    }

    #[tokio::test]
    async fn bootstrap_builds_private_hierarchy() {
        let manager = manager();
        let ctx = NodeContext::new("a");

        let member = manager.bootstrap(&ctx).await.unwrap();
        let again = manager.bootstrap(&ctx).await.unwrap();

        assert_eq!(member.channel_id, again.channel_id);
        let placement = manager.placement(&ctx).unwrap();
        let cluster = placement.cluster.unwrap();
        let channel = placement.channel.unwrap();
        assert_eq!(cluster.member_count, 1);
        assert_eq!(channel.member_count, 1);
        assert_eq!(placement.member.unwrap().node_id, NodeId::from("a"));
        assert_eq!(
            manager.store().list_channel_nodes(&channel.channel_id).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn cluster_creation_requires_domain_main() {
        let manager = manager();
        let owner = NodeContext::new("a");
        let domain = manager.new_domain_node(&owner).await.unwrap();

        let err = manager
            .new_cluster_node(
                &NodeContext::new("b"),
                NewClusterRequest {
                    node_id: NodeId::from("b"),
                    domain_id: Some(domain.domain_id.clone()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotMainNode(TierLevel::Domain)));
        assert_eq!(err.to_string(), "node_id does not match domain main node");

        let err = manager
            .new_cluster_node(
                &owner,
                NewClusterRequest {
                    node_id: NodeId::from("b"),
                    domain_id: Some(DomainId::from("d-missing")),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Domain not found");
    }

    #[tokio::test]
    async fn cluster_for_another_owner_is_not_cached_locally() {
        let manager = manager();
        let ctx = NodeContext::new("a");
        manager.new_domain_node(&ctx).await.unwrap();

        let row = manager
            .new_cluster_node(
                &ctx,
                NewClusterRequest {
                    node_id: NodeId::from("b"),
                    domain_id: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(row.node_id, NodeId::from("b"));
        assert!(manager.placement(&ctx).unwrap().cluster.is_none());
    }

    #[tokio::test]
    async fn channel_registration_checks_both_main_ids() {
        let manager = manager();
        let ctx = NodeContext::new("a");
        let member = manager.bootstrap(&ctx).await.unwrap();
        manager
            .directory()
            .register(&NodeId::from("b"), &PeerAddr::new("mem://b"));

        let err = manager
            .register_to_channel_node(
                &ctx,
                RegisterToChannelRequest {
                    channel_id: member.channel_id.clone(),
                    node_id: NodeId::from("someone-else"),
                    target_node_id: NodeId::from("b"),
                    join_id: JoinId::from("j-1"),
                    requester_addr: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotMainNode(TierLevel::Channel)));
    }

    #[tokio::test]
    async fn unknown_joiner_is_rejected() {
        let manager = manager();
        let ctx = NodeContext::new("a");
        let domain = manager.new_domain_node(&ctx).await.unwrap();

        let err = manager
            .register_to_domain_node(
                &ctx,
                RegisterToDomainRequest {
                    domain_id: domain.domain_id,
                    node_id: NodeId::from("ghost"),
                    join_id: JoinId::from("j-1"),
                    requester_addr: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownNode(_)));
    }

    #[tokio::test]
    async fn add_new_node_requires_membership() {
        let manager = manager();
        let ctx = NodeContext::new("a");
        let member = manager.bootstrap(&ctx).await.unwrap();

        let announcement = AddNewNode {
            domain_id: member.domain_id.clone(),
            cluster_id: member.cluster_id.clone(),
            channel_id: ChannelId::from("h-other"),
            target_node_id: NodeId::from("b"),
            target_addr: None,
        };
        let err = manager.add_new_node(&ctx, announcement.clone()).await.unwrap_err();
        assert!(matches!(err, Error::TierNotFound(TierLevel::Channel)));

        let announcement = AddNewNode {
            channel_id: member.channel_id.clone(),
            target_addr: Some(PeerAddr::new("mem://b")),
            ..announcement
        };
        manager.add_new_node(&ctx, announcement).await.unwrap();
        assert!(manager
            .store()
            .is_channel_member(&member.channel_id, &NodeId::from("b"))
            .unwrap());
        assert!(manager.directory().is_known(&NodeId::from("b")));
    }

    #[tokio::test]
    async fn misaddressed_confirmation_is_rejected() {
        let manager = manager();
        let err = manager
            .register_confirmed(
                &NodeContext::new("a"),
                RegisterConfirmed {
                    domain_id: DomainId::from("d-1"),
                    cluster_id: None,
                    channel_id: None,
                    node_id: NodeId::from("p"),
                    target_node_id: NodeId::from("b"),
                    confirmed_by: TierLevel::Domain,
                    join_id: JoinId::from("j-1"),
                    next_main_node_id: None,
                    next_main_node_addr: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MisaddressedConfirmation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_domain_is_retried_then_abandoned() {
        let retry = RetryPolicy::default()
            .with_timeout(std::time::Duration::from_secs(5))
            .with_max_retries(1);
        let manager = NodeManager::new(
            OverlayConfig::default().with_retry(retry),
            Arc::new(MemoryStore::new()),
            Arc::new(Unreachable),
            Arc::new(StaticDirectory::new()),
        );
        let ctx = NodeContext::new("b").with_addr("mem://b");

        let join_id = manager
            .join(&ctx, DomainId::from("d-1"), PeerTarget::new("a", "mem://a"))
            .await
            .unwrap();
        // Never acknowledged, so the registration is still only requested.
        assert_eq!(
            manager.join_status(&join_id).unwrap().phase,
            JoinPhase::Requested(TierLevel::Domain)
        );

        let phase = manager.wait_for_placement(&join_id).await.unwrap();
        assert!(matches!(phase, JoinPhase::Abandoned { level: TierLevel::Domain, .. }));
        assert_eq!(manager.timers().armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_joins_are_forgotten_after_retention() {
        let retry = RetryPolicy::default()
            .with_timeout(Duration::from_secs(1))
            .with_max_retries(0);
        let config = OverlayConfig::default()
            .with_retry(retry)
            .with_finished_join_retention(Duration::from_secs(30));
        let manager = NodeManager::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(Unreachable),
            Arc::new(StaticDirectory::new()),
        );
        let ctx = NodeContext::new("b").with_addr("mem://b");

        let join_id = manager
            .join(&ctx, DomainId::from("d-1"), PeerTarget::new("a", "mem://a"))
            .await
            .unwrap();
        assert!(!manager.forget_join(&join_id));

        let phase = manager.wait_for_placement(&join_id).await.unwrap();
        assert!(matches!(phase, JoinPhase::Abandoned { .. }));
        assert!(manager.join_status(&join_id).is_some());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(manager.join_status(&join_id).is_none());
        assert!(manager.joins().is_empty());
    }
}
