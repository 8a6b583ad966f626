//! In-process carrier connecting several Node Managers.
//!
//! Each attached manager is reachable at a `PeerAddr`. Calls go through the
//! same response envelope the HTTP carrier uses, so rejections surface as
//! [`Error::Rejected`] exactly as they would over the wire. A partitioned
//! address fails every call with [`Error::Transport`].

use crate::error::{Error, Result};
use crate::manager::NodeManager;
use crate::rpc::{
    Ack, AddNewNode, NewChannelRequest, NewClusterRequest, PeerClient, RegisterAccepted,
    RegisterConfirmed, RegisterToChannelRequest, RegisterToClusterRequest,
    RegisterToDomainRequest, RpcOperation, RpcResponse,
};
use crate::types::{ChannelMainNode, ClusterMainNode, NodeContext, PeerAddr};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::trace;

/// Number of most recent calls kept in the call log.
pub const CALL_LOG_LIMIT: usize = 1024;

#[derive(Default)]
struct State {
    nodes: HashMap<PeerAddr, (NodeManager, NodeContext)>,
    partitioned: HashSet<PeerAddr>,
    counts: HashMap<(RpcOperation, PeerAddr), usize>,
    recent: VecDeque<(RpcOperation, PeerAddr)>,
}

/// Loopback [`PeerClient`] routing calls to attached managers.
#[derive(Default)]
pub struct LoopbackNetwork {
    state: Mutex<State>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `manager`, acting as `ctx`, reachable at `ctx.addr`.
    pub fn attach(&self, manager: NodeManager, ctx: NodeContext) -> Result<()> {
        let addr = ctx
            .addr
            .clone()
            .ok_or_else(|| Error::InvalidRequest("node context has no address".into()))?;
        self.lock().nodes.insert(addr, (manager, ctx));
        Ok(())
    }

    /// Drop every attached manager.
    pub fn clear(&self) {
        self.lock().nodes.clear();
    }

    /// Make `addr` unreachable.
    pub fn partition(&self, addr: &PeerAddr) {
        self.lock().partitioned.insert(addr.clone());
    }

    pub fn heal(&self, addr: &PeerAddr) {
        self.lock().partitioned.remove(addr);
    }

    /// Number of `op` calls attempted against `addr`, partitioned ones included.
    pub fn call_count(&self, op: RpcOperation, addr: &PeerAddr) -> usize {
        self.lock()
            .counts
            .get(&(op, addr.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// The most recent calls, oldest first, up to [`CALL_LOG_LIMIT`].
    pub fn calls(&self) -> Vec<(RpcOperation, PeerAddr)> {
        self.lock().recent.iter().cloned().collect()
    }

    fn route(&self, op: RpcOperation, peer: &PeerAddr) -> Result<(NodeManager, NodeContext)> {
        let mut state = self.lock();
        *state.counts.entry((op, peer.clone())).or_default() += 1;
        if state.recent.len() == CALL_LOG_LIMIT {
            state.recent.pop_front();
        }
        state.recent.push_back((op, peer.clone()));
        if state.partitioned.contains(peer) {
            return Err(Error::Transport(format!("{} is partitioned", peer)));
        }
        trace!(op = %op, peer = %peer, "Loopback call");
        state
            .nodes
            .get(peer)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("connection refused: {}", peer)))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Pass a handler result through the response envelope.
fn over_wire<T>(result: Result<T>) -> Result<T> {
    RpcResponse::from_result(result).into_result()
}

#[async_trait]
impl PeerClient for LoopbackNetwork {
    async fn new_cluster_node(
        &self,
        peer: &PeerAddr,
        req: NewClusterRequest,
    ) -> Result<ClusterMainNode> {
        let (manager, ctx) = self.route(RpcOperation::NewClusterNode, peer)?;
        over_wire(manager.new_cluster_node(&ctx, req).await)
    }

    async fn new_channel_node(
        &self,
        peer: &PeerAddr,
        req: NewChannelRequest,
    ) -> Result<ChannelMainNode> {
        let (manager, ctx) = self.route(RpcOperation::NewChannelNode, peer)?;
        over_wire(manager.new_channel_node(&ctx, req).await)
    }

    async fn register_to_domain_node(
        &self,
        peer: &PeerAddr,
        req: RegisterToDomainRequest,
    ) -> Result<RegisterAccepted> {
        let (manager, ctx) = self.route(RpcOperation::RegisterToDomainNode, peer)?;
        over_wire(manager.register_to_domain_node(&ctx, req).await)
    }

    async fn register_to_cluster_node(
        &self,
        peer: &PeerAddr,
        req: RegisterToClusterRequest,
    ) -> Result<RegisterAccepted> {
        let (manager, ctx) = self.route(RpcOperation::RegisterToClusterNode, peer)?;
        over_wire(manager.register_to_cluster_node(&ctx, req).await)
    }

    async fn register_to_channel_node(
        &self,
        peer: &PeerAddr,
        req: RegisterToChannelRequest,
    ) -> Result<RegisterAccepted> {
        let (manager, ctx) = self.route(RpcOperation::RegisterToChannelNode, peer)?;
        over_wire(manager.register_to_channel_node(&ctx, req).await)
    }

    async fn register_confirmed(&self, peer: &PeerAddr, req: RegisterConfirmed) -> Result<Ack> {
        let (manager, ctx) = self.route(RpcOperation::RegisterConfirmed, peer)?;
        over_wire(manager.register_confirmed(&ctx, req).await)
    }

    async fn add_new_node(&self, peer: &PeerAddr, req: AddNewNode) -> Result<Ack> {
        let (manager, ctx) = self.route(RpcOperation::AddNewNode, peer)?;
        over_wire(manager.add_new_node(&ctx, req).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelId, ClusterId, DomainId, NodeId};

    #[tokio::test]
    async fn call_log_keeps_counts_past_its_limit() {
        let network = LoopbackNetwork::new();
        let nowhere = PeerAddr::new("mem://nowhere");
        let announcement = AddNewNode {
            domain_id: DomainId::from("d-1"),
            cluster_id: ClusterId::from("c-1"),
            channel_id: ChannelId::from("h-1"),
            target_node_id: NodeId::from("b"),
            target_addr: None,
        };

        for _ in 0..CALL_LOG_LIMIT + 10 {
            let err = network
                .add_new_node(&nowhere, announcement.clone())
                .await
                .unwrap_err();
            assert!(err.is_retriable());
        }

        assert_eq!(network.calls().len(), CALL_LOG_LIMIT);
        assert_eq!(
            network.call_count(RpcOperation::AddNewNode, &nowhere),
            CALL_LOG_LIMIT + 10
        );
    }
}
