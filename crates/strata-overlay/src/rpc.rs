//! Peer RPC: wire types and the carrier-agnostic client trait.
//!
//! Every operation is a JSON object request answered by a
//! `{success, error?, ...payload}` envelope. The carrier (HTTP, loopback,
//! anything point-to-point and reliable) implements [`PeerClient`].

use crate::error::{Error, Result};
use crate::types::{
    ChannelId, ChannelMainNode, ClusterId, ClusterMainNode, DomainId, JoinId, NodeId, PeerAddr,
    TierLevel,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The seven peer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcOperation {
    NewClusterNode,
    NewChannelNode,
    RegisterToDomainNode,
    RegisterToClusterNode,
    RegisterToChannelNode,
    RegisterConfirmed,
    AddNewNode,
}

impl RpcOperation {
    pub const ALL: [RpcOperation; 7] = [
        Self::NewClusterNode,
        Self::NewChannelNode,
        Self::RegisterToDomainNode,
        Self::RegisterToClusterNode,
        Self::RegisterToChannelNode,
        Self::RegisterConfirmed,
        Self::AddNewNode,
    ];

    /// Operation name as it appears on the wire.
    pub const fn name(self) -> &'static str {
        match self {
            Self::NewClusterNode => "newClusterNode",
            Self::NewChannelNode => "newChannelNode",
            Self::RegisterToDomainNode => "registerToDomainNode",
            Self::RegisterToClusterNode => "registerToClusterNode",
            Self::RegisterToChannelNode => "registerToChannelNode",
            Self::RegisterConfirmed => "registerConfirmed",
            Self::AddNewNode => "addNewNode",
        }
    }

    /// The registration operation addressed to the main node of `level`.
    pub const fn register_to(level: TierLevel) -> Self {
        match level {
            TierLevel::Domain => Self::RegisterToDomainNode,
            TierLevel::Cluster => Self::RegisterToClusterNode,
            TierLevel::Channel => Self::RegisterToChannelNode,
        }
    }
}

impl fmt::Display for RpcOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Response envelope shared by every operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub payload: Option<T>,
}

impl<T> RpcResponse<T> {
    pub fn ok(payload: T) -> Self {
        Self {
            success: true,
            error: None,
            payload: Some(payload),
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            payload: None,
        }
    }

    /// Build an envelope from a handler result.
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(payload) => Self::ok(payload),
            Err(e) => Self::rejected(e.to_string()),
        }
    }

    /// Unwrap the envelope; `success: false` becomes [`Error::Rejected`].
    pub fn into_result(self) -> Result<T> {
        if !self.success {
            return Err(Error::Rejected(
                self.error.unwrap_or_else(|| "request rejected".to_string()),
            ));
        }
        self.payload
            .ok_or_else(|| Error::Rejected("response carried no payload".to_string()))
    }
}

/// Empty payload for operations that only acknowledge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {}

/// `newClusterNode`: ask a domain main node to create a cluster owned by `node_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewClusterRequest {
    pub node_id: NodeId,
    /// Domain to create the cluster in; defaults to the domain the
    /// receiving node is main node of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<DomainId>,
}

/// `newChannelNode`: ask a cluster main node to create a channel owned by `node_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChannelRequest {
    pub node_id: NodeId,
    /// Cluster to create the channel in; defaults to the receiver's local cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<ClusterId>,
}

/// `registerToDomainNode`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterToDomainRequest {
    pub domain_id: DomainId,
    pub node_id: NodeId,
    pub join_id: JoinId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_addr: Option<PeerAddr>,
}

/// `registerToClusterNode`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterToClusterRequest {
    pub cluster_id: ClusterId,
    pub node_id: NodeId,
    pub join_id: JoinId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_addr: Option<PeerAddr>,
}

/// `registerToChannelNode`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterToChannelRequest {
    pub channel_id: ChannelId,
    /// The channel main node the joiner believes it is addressing.
    pub node_id: NodeId,
    /// The joining node.
    pub target_node_id: NodeId,
    pub join_id: JoinId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_addr: Option<PeerAddr>,
}

/// Acknowledgement of a registration; the confirmation follows asynchronously.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAccepted {
    pub join_id: JoinId,
    pub level: TierLevel,
}

/// `registerConfirmed`: owner → joiner, finalizing placement at one level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterConfirmed {
    pub domain_id: DomainId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<ClusterId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    /// The confirming main node.
    pub node_id: NodeId,
    /// The joiner being confirmed.
    pub target_node_id: NodeId,
    pub confirmed_by: TierLevel,
    pub join_id: JoinId,
    /// Main node of the child tier the joiner must contact next.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_main_node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_main_node_addr: Option<PeerAddr>,
}

/// `addNewNode`: owner → existing member, announcing a new channel member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddNewNode {
    pub domain_id: DomainId,
    pub cluster_id: ClusterId,
    pub channel_id: ChannelId,
    pub target_node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_addr: Option<PeerAddr>,
}

/// Carrier for peer calls.
///
/// Implementations map carrier failures (timeouts, refused connections) to
/// [`Error::Transport`] and `success: false` envelopes to [`Error::Rejected`].
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn new_cluster_node(
        &self,
        peer: &PeerAddr,
        req: NewClusterRequest,
    ) -> Result<ClusterMainNode>;

    async fn new_channel_node(
        &self,
        peer: &PeerAddr,
        req: NewChannelRequest,
    ) -> Result<ChannelMainNode>;

    async fn register_to_domain_node(
        &self,
        peer: &PeerAddr,
        req: RegisterToDomainRequest,
    ) -> Result<RegisterAccepted>;

    async fn register_to_cluster_node(
        &self,
        peer: &PeerAddr,
        req: RegisterToClusterRequest,
    ) -> Result<RegisterAccepted>;

    async fn register_to_channel_node(
        &self,
        peer: &PeerAddr,
        req: RegisterToChannelRequest,
    ) -> Result<RegisterAccepted>;

    async fn register_confirmed(&self, peer: &PeerAddr, req: RegisterConfirmed) -> Result<Ack>;

    async fn add_new_node(&self, peer: &PeerAddr, req: AddNewNode) -> Result<Ack>;
}
