//! HTTP surface: peer RPC endpoints plus status queries.

use crate::node::NodeState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use strata_overlay::{
    Ack, AddNewNode, ChannelMainNode, ClusterMainNode, JoinId, JoinSnapshot, LocalPlacement,
    NewChannelRequest, NewClusterRequest, NodeId, PeerAddr, RegisterAccepted, RegisterConfirmed,
    RegisterToChannelRequest, RegisterToClusterRequest, RegisterToDomainRequest, RpcOperation,
    RpcResponse,
};
use tower_http::trace::TraceLayer;
use tracing::debug;

type AppState = Arc<NodeState>;

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(health))
        // Peer RPC
        .route(&rpc_path(RpcOperation::NewClusterNode), post(new_cluster_node))
        .route(&rpc_path(RpcOperation::NewChannelNode), post(new_channel_node))
        .route(&rpc_path(RpcOperation::RegisterToDomainNode), post(register_to_domain_node))
        .route(&rpc_path(RpcOperation::RegisterToClusterNode), post(register_to_cluster_node))
        .route(&rpc_path(RpcOperation::RegisterToChannelNode), post(register_to_channel_node))
        .route(&rpc_path(RpcOperation::RegisterConfirmed), post(register_confirmed))
        .route(&rpc_path(RpcOperation::AddNewNode), post(add_new_node))
        // Status
        .route("/api/v1/placement", get(get_placement))
        .route("/api/v1/joins", get(list_joins))
        .route("/api/v1/joins/:id", get(get_join))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn rpc_path(op: RpcOperation) -> String {
    format!("/rpc/{}", op.name())
}

fn envelope<T>(op: RpcOperation, result: strata_overlay::Result<T>) -> Json<RpcResponse<T>> {
    if let Err(e) = &result {
        debug!(op = %op, error = %e, "Rejecting peer RPC");
    }
    Json(RpcResponse::from_result(result))
}

// --- Health ---

async fn health() -> &'static str {
    "OK"
}

// --- Peer RPC ---

async fn new_cluster_node(
    State(state): State<AppState>,
    Json(req): Json<NewClusterRequest>,
) -> Json<RpcResponse<ClusterMainNode>> {
    let result = state.manager.new_cluster_node(&state.ctx, req).await;
    envelope(RpcOperation::NewClusterNode, result)
}

async fn new_channel_node(
    State(state): State<AppState>,
    Json(req): Json<NewChannelRequest>,
) -> Json<RpcResponse<ChannelMainNode>> {
    let result = state.manager.new_channel_node(&state.ctx, req).await;
    envelope(RpcOperation::NewChannelNode, result)
}

async fn register_to_domain_node(
    State(state): State<AppState>,
    Json(req): Json<RegisterToDomainRequest>,
) -> Json<RpcResponse<RegisterAccepted>> {
    let result = state.manager.register_to_domain_node(&state.ctx, req).await;
    envelope(RpcOperation::RegisterToDomainNode, result)
}

async fn register_to_cluster_node(
    State(state): State<AppState>,
    Json(req): Json<RegisterToClusterRequest>,
) -> Json<RpcResponse<RegisterAccepted>> {
    let result = state.manager.register_to_cluster_node(&state.ctx, req).await;
    envelope(RpcOperation::RegisterToClusterNode, result)
}

async fn register_to_channel_node(
    State(state): State<AppState>,
    Json(req): Json<RegisterToChannelRequest>,
) -> Json<RpcResponse<RegisterAccepted>> {
    let result = state.manager.register_to_channel_node(&state.ctx, req).await;
    envelope(RpcOperation::RegisterToChannelNode, result)
}

async fn register_confirmed(
    State(state): State<AppState>,
    Json(req): Json<RegisterConfirmed>,
) -> Json<RpcResponse<Ack>> {
    let result = state.manager.register_confirmed(&state.ctx, req).await;
    envelope(RpcOperation::RegisterConfirmed, result)
}

async fn add_new_node(
    State(state): State<AppState>,
    Json(req): Json<AddNewNode>,
) -> Json<RpcResponse<Ack>> {
    let result = state.manager.add_new_node(&state.ctx, req).await;
    envelope(RpcOperation::AddNewNode, result)
}

// --- Status ---

#[derive(Debug, Serialize)]
struct PlacementResponse {
    node_id: NodeId,
    addr: Option<PeerAddr>,
    #[serde(flatten)]
    placement: LocalPlacement,
}

async fn get_placement(
    State(state): State<AppState>,
) -> Result<Json<PlacementResponse>, StatusCode> {
    let placement = state
        .manager
        .placement(&state.ctx)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(PlacementResponse {
        node_id: state.ctx.node_id.clone(),
        addr: state.ctx.addr.clone(),
        placement,
    }))
}

async fn list_joins(State(state): State<AppState>) -> Json<Vec<JoinSnapshot>> {
    Json(state.manager.joins())
}

async fn get_join(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JoinSnapshot>, StatusCode> {
    state
        .manager
        .join_status(&JoinId::new(id))
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
