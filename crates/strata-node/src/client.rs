//! HTTP carrier for peer RPCs.
//!
//! Every operation is `POST {peer}/rpc/{operation}` with a JSON body; the
//! answer is the shared `{success, error?, ...}` envelope.

use crate::error::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use strata_overlay::{
    Ack, AddNewNode, ChannelMainNode, ClusterMainNode, Error as OverlayError, NewChannelRequest,
    NewClusterRequest, PeerAddr, PeerClient, RegisterAccepted, RegisterConfirmed,
    RegisterToChannelRequest, RegisterToClusterRequest, RegisterToDomainRequest, RpcOperation,
    RpcResponse,
};
use tracing::debug;

/// [`PeerClient`] over HTTP.
#[derive(Clone)]
pub struct HttpPeerClient {
    client: Client,
}

impl HttpPeerClient {
    /// Create a client whose calls fail with a transport error after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn call<Req, Resp>(
        &self,
        peer: &PeerAddr,
        op: RpcOperation,
        req: &Req,
    ) -> strata_overlay::Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = rpc_url(peer, op);
        debug!(op = %op, url = %url, "Sending peer RPC");

        let resp = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| OverlayError::Transport(format!("{} to {}: {}", op, peer, e)))?;
        let status = resp.status();

        match resp.json::<RpcResponse<Resp>>().await {
            Ok(envelope) => envelope.into_result(),
            Err(e) if status.is_client_error() => Err(OverlayError::Rejected(format!(
                "{} returned {}: {}",
                op, status, e
            ))),
            Err(e) => Err(OverlayError::Transport(format!(
                "{} returned {}: {}",
                op, status, e
            ))),
        }
    }
}

fn rpc_url(peer: &PeerAddr, op: RpcOperation) -> String {
    format!("{}/rpc/{}", peer.as_str().trim_end_matches('/'), op.name())
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn new_cluster_node(
        &self,
        peer: &PeerAddr,
        req: NewClusterRequest,
    ) -> strata_overlay::Result<ClusterMainNode> {
        self.call(peer, RpcOperation::NewClusterNode, &req).await
    }

    async fn new_channel_node(
        &self,
        peer: &PeerAddr,
        req: NewChannelRequest,
    ) -> strata_overlay::Result<ChannelMainNode> {
        self.call(peer, RpcOperation::NewChannelNode, &req).await
    }

    async fn register_to_domain_node(
        &self,
        peer: &PeerAddr,
        req: RegisterToDomainRequest,
    ) -> strata_overlay::Result<RegisterAccepted> {
        self.call(peer, RpcOperation::RegisterToDomainNode, &req).await
    }

    async fn register_to_cluster_node(
        &self,
        peer: &PeerAddr,
        req: RegisterToClusterRequest,
    ) -> strata_overlay::Result<RegisterAccepted> {
        self.call(peer, RpcOperation::RegisterToClusterNode, &req).await
    }

    async fn register_to_channel_node(
        &self,
        peer: &PeerAddr,
        req: RegisterToChannelRequest,
    ) -> strata_overlay::Result<RegisterAccepted> {
        self.call(peer, RpcOperation::RegisterToChannelNode, &req).await
    }

    async fn register_confirmed(
        &self,
        peer: &PeerAddr,
        req: RegisterConfirmed,
    ) -> strata_overlay::Result<Ack> {
        self.call(peer, RpcOperation::RegisterConfirmed, &req).await
    }

    async fn add_new_node(&self, peer: &PeerAddr, req: AddNewNode) -> strata_overlay::Result<Ack> {
        self.call(peer, RpcOperation::AddNewNode, &req).await
    }
}
