//! Multi-node join scenarios over the loopback carrier.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strata_overlay::{
    Ack, AddNewNode, ChannelId, ChannelMainNode, ChannelNode, ClusterId, ClusterMainNode,
    DomainId, DomainMainNode, Error, JoinId, JoinPhase, LoopbackNetwork, MainNodeRecord,
    MemoryStore, NewChannelRequest, NewClusterRequest, NodeContext, NodeManager, NodeId,
    NodeStore, OverlayConfig, PeerAddr, PeerClient, PeerDirectory, PeerTarget,
    RegisterAccepted, RegisterConfirmed, RegisterToChannelRequest, RegisterToClusterRequest,
    RegisterToDomainRequest, Result, RetryPolicy, RpcOperation, StaticDirectory, TierLevel,
};

struct Mesh {
    network: Arc<LoopbackNetwork>,
    directory: Arc<StaticDirectory>,
}

impl Mesh {
    fn new() -> Self {
        Self {
            network: Arc::new(LoopbackNetwork::new()),
            directory: Arc::new(StaticDirectory::new()),
        }
    }

    fn node(&self, id: &str, config: OverlayConfig) -> (NodeManager, NodeContext) {
        self.node_with_store(id, config, Arc::new(MemoryStore::new()))
    }

    fn node_with_store(
        &self,
        id: &str,
        config: OverlayConfig,
        store: Arc<dyn NodeStore>,
    ) -> (NodeManager, NodeContext) {
        let manager = NodeManager::new(
            config,
            store,
            self.network.clone(),
            self.directory.clone(),
        );
        let ctx = NodeContext::new(id).with_addr(format!("mem://{}", id));
        self.network.attach(manager.clone(), ctx.clone()).unwrap();
        (manager, ctx)
    }

    fn target(ctx: &NodeContext) -> PeerTarget {
        PeerTarget {
            node_id: ctx.node_id.clone(),
            addr: ctx.addr.clone().unwrap(),
        }
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        self.network.clear();
    }
}

fn addr(id: &str) -> PeerAddr {
    PeerAddr::new(format!("mem://{}", id))
}

#[tokio::test]
async fn joiner_is_placed_under_domain_owner() {
    let net = Mesh::new();
    let (a, a_ctx) = net.node("a", OverlayConfig::default());
    let (b, b_ctx) = net.node("b", OverlayConfig::default());

    let domain = a.new_domain_node(&a_ctx).await.unwrap();
    let join_id = b
        .join(&b_ctx, domain.domain_id.clone(), Mesh::target(&a_ctx))
        .await
        .unwrap();

    let phase = b.wait_for_placement(&join_id).await.unwrap();
    assert_eq!(phase, JoinPhase::Confirmed(TierLevel::Channel));

    let placement = b.placement(&b_ctx).unwrap();
    let member = placement.member.unwrap();
    assert_eq!(member.domain_id, domain.domain_id);
    assert_eq!(placement.domain.unwrap().node_id, a_ctx.node_id);
    assert_eq!(placement.cluster.unwrap().node_id, a_ctx.node_id);
    assert_eq!(placement.channel.unwrap().node_id, a_ctx.node_id);

    let clusters = a.store().list_cluster_mains(&domain.domain_id).unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].cluster_id, member.cluster_id);
    assert_eq!(clusters[0].member_count, 2);

    let members = a.store().list_channel_nodes(&member.channel_id).unwrap();
    let mut ids: Vec<_> = members.iter().map(|m| m.node_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(b.timers().armed_count(), 0);
}

#[tokio::test]
async fn full_cluster_forces_a_new_one() {
    let net = Mesh::new();
    let config = OverlayConfig::default().with_tier_capacity(2);
    let (a, a_ctx) = net.node("a", config.clone());
    let (b, b_ctx) = net.node("b", config.clone());
    let (c, c_ctx) = net.node("c", config);

    let domain = a.new_domain_node(&a_ctx).await.unwrap();
    let b_join = b
        .join(&b_ctx, domain.domain_id.clone(), Mesh::target(&a_ctx))
        .await
        .unwrap();
    assert!(b.wait_for_placement(&b_join).await.unwrap().is_placed());
    let c_join = c
        .join(&c_ctx, domain.domain_id.clone(), Mesh::target(&a_ctx))
        .await
        .unwrap();
    assert!(c.wait_for_placement(&c_join).await.unwrap().is_placed());

    let b_cluster = b.placement(&b_ctx).unwrap().member.unwrap().cluster_id;
    let c_cluster = c.placement(&c_ctx).unwrap().member.unwrap().cluster_id;
    assert_ne!(b_cluster, c_cluster);

    let clusters = a.store().list_cluster_mains(&domain.domain_id).unwrap();
    assert_eq!(clusters.len(), 2);
    assert!(clusters.iter().all(|c| c.member_count <= 2));
}

#[tokio::test]
async fn existing_members_learn_about_newcomers() {
    let net = Mesh::new();
    let (a, a_ctx) = net.node("a", OverlayConfig::default());
    let (b, b_ctx) = net.node("b", OverlayConfig::default());
    let (c, c_ctx) = net.node("c", OverlayConfig::default());

    let domain = a.new_domain_node(&a_ctx).await.unwrap();
    let b_join = b
        .join(&b_ctx, domain.domain_id.clone(), Mesh::target(&a_ctx))
        .await
        .unwrap();
    b.wait_for_placement(&b_join).await.unwrap();
    let c_join = c
        .join(&c_ctx, domain.domain_id.clone(), Mesh::target(&a_ctx))
        .await
        .unwrap();
    c.wait_for_placement(&c_join).await.unwrap();
    a.supervisor().wait_idle().await;

    let channel = c.placement(&c_ctx).unwrap().member.unwrap().channel_id;
    assert!(b
        .store()
        .is_channel_member(&channel, &NodeId::from("c"))
        .unwrap());
    assert_eq!(net.network.call_count(RpcOperation::AddNewNode, &addr("b")), 1);
    assert_eq!(net.network.call_count(RpcOperation::AddNewNode, &addr("a")), 0);
}

#[tokio::test]
async fn rejected_domain_registration_is_not_retried() {
    let net = Mesh::new();
    let retry = RetryPolicy::default().with_timeout(Duration::from_millis(50));
    let (a, a_ctx) = net.node("a", OverlayConfig::default());
    let (b, b_ctx) = net.node("b", OverlayConfig::default().with_retry(retry));
    a.new_domain_node(&a_ctx).await.unwrap();

    let err = b
        .join(&b_ctx, DomainId::from("d-missing"), Mesh::target(&a_ctx))
        .await
        .unwrap_err();
    assert!(matches!(&err, Error::Rejected(msg) if msg == "Domain not found"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        net.network
            .call_count(RpcOperation::RegisterToDomainNode, &addr("a")),
        1
    );
    let joins = b.joins();
    assert_eq!(joins.len(), 1);
    assert!(matches!(joins[0].phase, JoinPhase::Abandoned { level: TierLevel::Domain, .. }));
}

#[tokio::test]
async fn join_through_non_owner_is_rejected() {
    let net = Mesh::new();
    let (a, a_ctx) = net.node("a", OverlayConfig::default());
    let (_m, m_ctx) = net.node("m", OverlayConfig::default());
    let (b, b_ctx) = net.node("b", OverlayConfig::default());
    let domain = a.new_domain_node(&a_ctx).await.unwrap();

    let err = b
        .join(&b_ctx, domain.domain_id, Mesh::target(&m_ctx))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Rejected(_)));
}

#[tokio::test(start_paused = true)]
async fn partitioned_domain_recovers_after_heal() {
    let net = Mesh::new();
    let (a, a_ctx) = net.node("a", OverlayConfig::default());
    let (b, b_ctx) = net.node("b", OverlayConfig::default());
    let domain = a.new_domain_node(&a_ctx).await.unwrap();

    net.network.partition(&addr("a"));
    let join_id = b
        .join(&b_ctx, domain.domain_id, Mesh::target(&a_ctx))
        .await
        .unwrap();
    assert_eq!(
        b.join_status(&join_id).unwrap().phase,
        JoinPhase::Requested(TierLevel::Domain)
    );

    tokio::time::sleep(Duration::from_secs(30)).await;
    net.network.heal(&addr("a"));

    let phase = b.wait_for_placement(&join_id).await.unwrap();
    assert!(phase.is_placed());
    assert_eq!(
        net.network
            .call_count(RpcOperation::RegisterToDomainNode, &addr("a")),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn unreachable_domain_falls_back_to_own_hierarchy() {
    let net = Mesh::new();
    let retry = RetryPolicy::default()
        .with_timeout(Duration::from_secs(1))
        .with_max_retries(0);
    let config = OverlayConfig::default()
        .with_retry(retry)
        .with_bootstrap_on_exhaustion(true);
    let (b, b_ctx) = net.node("b", config);

    let join_id = b
        .join(&b_ctx, DomainId::from("d-gone"), PeerTarget::new("ghost", "mem://ghost"))
        .await
        .unwrap();
    let phase = b.wait_for_placement(&join_id).await.unwrap();

    assert!(phase.is_placed());
    let placement = b.placement(&b_ctx).unwrap();
    assert_eq!(placement.domain.unwrap().node_id, b_ctx.node_id);
    assert_eq!(placement.member.unwrap().node_id, b_ctx.node_id);
}

#[tokio::test]
async fn hosted_cluster_admits_later_joiners() {
    let net = Mesh::new();
    let (a, a_ctx) = net.node("a", OverlayConfig::default());
    let (b, b_ctx) = net.node("b", OverlayConfig::default());
    let (c, c_ctx) = net.node("c", OverlayConfig::default());
    for ctx in [&a_ctx, &b_ctx, &c_ctx] {
        net.directory
            .register(&ctx.node_id, ctx.addr.as_ref().unwrap());
    }
    let domain = a.new_domain_node(&a_ctx).await.unwrap();

    let hosted = b
        .request_cluster(&b_ctx, &Mesh::target(&a_ctx), Some(domain.domain_id.clone()))
        .await
        .unwrap();
    assert_eq!(hosted.node_id, b_ctx.node_id);
    assert_eq!(b.placement(&b_ctx).unwrap().cluster.unwrap(), hosted);

    let join_id = c
        .join(&c_ctx, domain.domain_id, Mesh::target(&a_ctx))
        .await
        .unwrap();
    assert!(c.wait_for_placement(&join_id).await.unwrap().is_placed());

    let placement = c.placement(&c_ctx).unwrap();
    assert_eq!(placement.member.unwrap().cluster_id, hosted.cluster_id);
    assert_eq!(placement.channel.unwrap().node_id, b_ctx.node_id);
}

/// Accepts every registration and never confirms on its own.
#[derive(Default)]
struct Scripted {
    calls: Mutex<HashMap<RpcOperation, usize>>,
}

impl Scripted {
    fn count(&self, op: RpcOperation) -> usize {
        self.calls.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    fn record(&self, op: RpcOperation, join_id: &JoinId, level: TierLevel) -> Result<RegisterAccepted> {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;
        Ok(RegisterAccepted {
            join_id: join_id.clone(),
            level,
        })
    }
}

#[async_trait]
impl PeerClient for Scripted {
    async fn new_cluster_node(&self, _: &PeerAddr, _: NewClusterRequest) -> Result<ClusterMainNode> {
        Err(Error::Transport("not scripted".into()))
    }
    async fn new_channel_node(&self, _: &PeerAddr, _: NewChannelRequest) -> Result<ChannelMainNode> {
        Err(Error::Transport("not scripted".into()))
    }
    async fn register_to_domain_node(&self, _: &PeerAddr, req: RegisterToDomainRequest) -> Result<RegisterAccepted> {
        self.record(RpcOperation::RegisterToDomainNode, &req.join_id, TierLevel::Domain)
    }
    async fn register_to_cluster_node(&self, _: &PeerAddr, req: RegisterToClusterRequest) -> Result<RegisterAccepted> {
        self.record(RpcOperation::RegisterToClusterNode, &req.join_id, TierLevel::Cluster)
    }
    async fn register_to_channel_node(&self, _: &PeerAddr, req: RegisterToChannelRequest) -> Result<RegisterAccepted> {
        self.record(RpcOperation::RegisterToChannelNode, &req.join_id, TierLevel::Channel)
    }
    async fn register_confirmed(&self, _: &PeerAddr, _: RegisterConfirmed) -> Result<Ack> {
        Ok(Ack {})
    }
    async fn add_new_node(&self, _: &PeerAddr, _: AddNewNode) -> Result<Ack> {
        Ok(Ack {})
    }
}

fn scripted_joiner() -> (NodeManager, NodeContext, Arc<Scripted>) {
    let client = Arc::new(Scripted::default());
    let manager = NodeManager::new(
        OverlayConfig::default(),
        Arc::new(MemoryStore::new()),
        client.clone(),
        Arc::new(StaticDirectory::new()),
    );
    (manager, NodeContext::new("b").with_addr("mem://b"), client)
}

fn domain_confirmation(join_id: &JoinId) -> RegisterConfirmed {
    RegisterConfirmed {
        domain_id: DomainId::from("d-1"),
        cluster_id: Some("c-1".into()),
        channel_id: None,
        node_id: NodeId::from("a"),
        target_node_id: NodeId::from("b"),
        confirmed_by: TierLevel::Domain,
        join_id: join_id.clone(),
        next_main_node_id: Some(NodeId::from("p")),
        next_main_node_addr: Some(PeerAddr::new("mem://p")),
    }
}

#[tokio::test(start_paused = true)]
async fn silent_cluster_escalates_then_domain_exhausts() {
    let (b, b_ctx, client) = scripted_joiner();
    let join_id = b
        .join(&b_ctx, DomainId::from("d-1"), PeerTarget::new("a", "mem://a"))
        .await
        .unwrap();
    b.register_confirmed(&b_ctx, domain_confirmation(&join_id))
        .await
        .unwrap();

    // Cluster sends at 0, 60, 120 and 180s; escalation at 240s.
    tokio::time::sleep(Duration::from_secs(270)).await;
    assert_eq!(client.count(RpcOperation::RegisterToClusterNode), 4);
    assert_eq!(client.count(RpcOperation::RegisterToDomainNode), 2);
    let status = b.join_status(&join_id).unwrap();
    assert_eq!(status.phase, JoinPhase::AwaitingConfirmation(TierLevel::Domain));
    assert_eq!(status.cluster_id, None);

    let phase = b.wait_for_placement(&join_id).await.unwrap();
    assert!(matches!(phase, JoinPhase::Abandoned { level: TierLevel::Domain, .. }));
    assert_eq!(client.count(RpcOperation::RegisterToClusterNode), 4);
    assert_eq!(client.count(RpcOperation::RegisterToDomainNode), 5);
    assert_eq!(b.timers().armed_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn channel_confirmation_before_cluster_is_rejected() {
    let (b, b_ctx, _client) = scripted_joiner();
    let join_id = b
        .join(&b_ctx, DomainId::from("d-1"), PeerTarget::new("a", "mem://a"))
        .await
        .unwrap();

    let early = RegisterConfirmed {
        channel_id: Some("h-1".into()),
        confirmed_by: TierLevel::Channel,
        next_main_node_id: None,
        next_main_node_addr: None,
        ..domain_confirmation(&join_id)
    };
    let err = b.register_confirmed(&b_ctx, early).await.unwrap_err();
    assert!(matches!(
        err,
        Error::OutOfOrderConfirmation {
            expected: TierLevel::Domain,
            received: TierLevel::Channel
        }
    ));
    assert_eq!(
        b.join_status(&join_id).unwrap().phase,
        JoinPhase::AwaitingConfirmation(TierLevel::Domain)
    );

    b.register_confirmed(&b_ctx, domain_confirmation(&join_id))
        .await
        .unwrap();
    assert_eq!(
        b.join_status(&join_id).unwrap().phase,
        JoinPhase::Requested(TierLevel::Cluster)
    );
    b.supervisor().wait_idle().await;
    assert_eq!(
        b.join_status(&join_id).unwrap().phase,
        JoinPhase::AwaitingConfirmation(TierLevel::Cluster)
    );
}

#[tokio::test(start_paused = true)]
async fn confirmation_during_retry_cancels_the_resend() {
    let (b, b_ctx, client) = scripted_joiner();
    let join_id = b
        .join(&b_ctx, DomainId::from("d-1"), PeerTarget::new("a", "mem://a"))
        .await
        .unwrap();
    assert_eq!(client.count(RpcOperation::RegisterToDomainNode), 1);

    // The timeout decided to retry; the confirmation lands before the
    // re-send gets to run.
    b.retry_current_level(&join_id, TierLevel::Domain);
    b.register_confirmed(&b_ctx, domain_confirmation(&join_id))
        .await
        .unwrap();
    b.supervisor().wait_idle().await;

    assert_eq!(client.count(RpcOperation::RegisterToDomainNode), 1);
    assert_eq!(client.count(RpcOperation::RegisterToClusterNode), 1);
    assert!(!b.timers().is_armed(&(join_id.clone(), TierLevel::Domain)));
    assert!(b.timers().is_armed(&(join_id.clone(), TierLevel::Cluster)));
    let status = b.join_status(&join_id).unwrap();
    assert_eq!(status.phase, JoinPhase::AwaitingConfirmation(TierLevel::Cluster));
    assert_eq!(status.retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn late_duplicate_confirmation_is_ignored() {
    let (b, b_ctx, client) = scripted_joiner();
    let join_id = b
        .join(&b_ctx, DomainId::from("d-1"), PeerTarget::new("a", "mem://a"))
        .await
        .unwrap();
    b.register_confirmed(&b_ctx, domain_confirmation(&join_id))
        .await
        .unwrap();
    b.supervisor().wait_idle().await;
    let sent = client.count(RpcOperation::RegisterToClusterNode);

    b.register_confirmed(&b_ctx, domain_confirmation(&join_id))
        .await
        .unwrap();
    b.supervisor().wait_idle().await;

    assert_eq!(client.count(RpcOperation::RegisterToClusterNode), sent);
    assert_eq!(
        b.join_status(&join_id).unwrap().phase,
        JoinPhase::AwaitingConfirmation(TierLevel::Cluster)
    );
}

/// Memory store whose first `replace_local_main` fails.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    failed_once: AtomicBool,
}

impl NodeStore for FlakyStore {
    fn put_domain_main(&self, row: &DomainMainNode) -> Result<()> {
        self.inner.put_domain_main(row)
    }
    fn get_domain_main(&self, domain_id: &DomainId) -> Result<Option<DomainMainNode>> {
        self.inner.get_domain_main(domain_id)
    }
    fn list_domain_mains(&self) -> Result<Vec<DomainMainNode>> {
        self.inner.list_domain_mains()
    }
    fn put_cluster_main(&self, row: &ClusterMainNode) -> Result<()> {
        self.inner.put_cluster_main(row)
    }
    fn get_cluster_main(&self, cluster_id: &ClusterId) -> Result<Option<ClusterMainNode>> {
        self.inner.get_cluster_main(cluster_id)
    }
    fn list_cluster_mains(&self, domain_id: &DomainId) -> Result<Vec<ClusterMainNode>> {
        self.inner.list_cluster_mains(domain_id)
    }
    fn put_channel_main(&self, row: &ChannelMainNode) -> Result<()> {
        self.inner.put_channel_main(row)
    }
    fn get_channel_main(&self, channel_id: &ChannelId) -> Result<Option<ChannelMainNode>> {
        self.inner.get_channel_main(channel_id)
    }
    fn list_channel_mains(&self, cluster_id: &ClusterId) -> Result<Vec<ChannelMainNode>> {
        self.inner.list_channel_mains(cluster_id)
    }
    fn put_channel_node(&self, row: &ChannelNode) -> Result<()> {
        self.inner.put_channel_node(row)
    }
    fn list_channel_nodes(&self, channel_id: &ChannelId) -> Result<Vec<ChannelNode>> {
        self.inner.list_channel_nodes(channel_id)
    }
    fn local_main(&self, level: TierLevel) -> Result<Option<MainNodeRecord>> {
        self.inner.local_main(level)
    }
    fn replace_local_main(&self, record: &MainNodeRecord) -> Result<()> {
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(Error::Store("disk full".into()));
        }
        self.inner.replace_local_main(record)
    }
    fn touch_all(&self, now: u64) -> Result<usize> {
        self.inner.touch_all(now)
    }
}

#[tokio::test(start_paused = true)]
async fn failed_local_write_keeps_the_level_retrying() {
    let net = Mesh::new();
    let (a, a_ctx) = net.node("a", OverlayConfig::default());
    let (b, b_ctx) =
        net.node_with_store("b", OverlayConfig::default(), Arc::new(FlakyStore::default()));
    let domain = a.new_domain_node(&a_ctx).await.unwrap();

    let join_id = b
        .join(&b_ctx, domain.domain_id, Mesh::target(&a_ctx))
        .await
        .unwrap();
    a.supervisor().wait_idle().await;

    // The domain confirmation arrived but could not be recorded.
    assert_eq!(
        b.join_status(&join_id).unwrap().phase,
        JoinPhase::AwaitingConfirmation(TierLevel::Domain)
    );
    assert!(b.timers().is_armed(&(join_id.clone(), TierLevel::Domain)));
    assert!(b.placement(&b_ctx).unwrap().domain.is_none());

    let phase = tokio::time::timeout(Duration::from_secs(600), b.wait_for_placement(&join_id))
        .await
        .unwrap()
        .unwrap();
    assert!(phase.is_placed());
    assert_eq!(
        net.network
            .call_count(RpcOperation::RegisterToDomainNode, &addr("a")),
        2
    );
    assert_eq!(b.placement(&b_ctx).unwrap().domain.unwrap().node_id, a_ctx.node_id);
    assert_eq!(b.timers().armed_count(), 0);
}
