//! Strata Node - the daemon entry point.
//!
//! Architecture:
//! - Single daemon process with a RocksDB Node Store
//! - HTTP server answering peer RPCs and status queries
//! - Background placement: bootstrap a private domain, or join the
//!   configured one, once the server is accepting confirmations

use crate::api;
use crate::client::HttpPeerClient;
use crate::config::{JoinTarget, NodeConfig};
use crate::error::Result;
use crate::storage::{compute_node_id, RocksStore};
use std::sync::Arc;
use strata_overlay::{spawn_heartbeat, NodeContext, NodeManager, StaticDirectory};

/// Shared state for API handlers.
pub struct NodeState {
    pub manager: NodeManager,
    /// Identity every handler acts as.
    pub ctx: NodeContext,
}

/// A Strata node instance.
pub struct StrataNode {
    config: NodeConfig,
    store: Arc<RocksStore>,
    state: Arc<NodeState>,
}

impl StrataNode {
    /// Open storage, load the node identity and wire up the Node Manager.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = Arc::new(RocksStore::open(&config.data_dir)?);

        let signing_key = store.get_or_create_node_key()?;
        let node_id = compute_node_id(&signing_key.verifying_key());
        let ctx = NodeContext::new(node_id).with_addr(config.advertise_addr.as_str());

        let directory = Arc::new(StaticDirectory::with_peers(config.peers.clone()));
        let client = Arc::new(HttpPeerClient::new(config.rpc_timeout)?);
        let manager = NodeManager::new(config.overlay.clone(), store.clone(), client, directory);

        Ok(Self {
            config,
            store,
            state: Arc::new(NodeState { manager, ctx }),
        })
    }

    pub fn ctx(&self) -> &NodeContext {
        &self.state.ctx
    }

    pub fn manager(&self) -> &NodeManager {
        &self.state.manager
    }

    /// Run the node (starts the heartbeat, HTTP server and placement).
    pub async fn run(self) -> Result<()> {
        tracing::info!("Strata node starting");
        tracing::info!("  Node: {}", self.state.ctx.node_id);
        tracing::info!("  API: http://{}", self.config.api_addr);
        tracing::info!("  Advertise: {}", self.config.advertise_addr);
        tracing::info!("  Data: {:?}", self.config.data_dir);

        let _heartbeat = spawn_heartbeat(self.store.clone(), self.config.heartbeat_interval);

        let app = api::build_router(self.state.clone());
        let listener = tokio::net::TcpListener::bind(self.config.api_addr).await?;
        tracing::info!("HTTP server listening on {}", self.config.api_addr);

        let state = self.state.clone();
        let join = self.config.join.clone();
        tokio::spawn(async move {
            if let Err(e) = place(&state, join).await {
                tracing::error!("Placement failed: {}", e);
            }
        });

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Put this node into the overlay unless it already holds a placement.
pub async fn place(state: &NodeState, join: Option<JoinTarget>) -> strata_overlay::Result<()> {
    let manager = &state.manager;
    let ctx = &state.ctx;

    if let Some(member) = manager.placement(ctx)?.member {
        tracing::info!(channel_id = %member.channel_id, "Already placed, keeping existing placement");
        return Ok(());
    }

    match join {
        None => {
            let member = manager.bootstrap(ctx).await?;
            tracing::info!(
                domain_id = %member.domain_id,
                cluster_id = %member.cluster_id,
                channel_id = %member.channel_id,
                "Bootstrapped own domain"
            );
        }
        Some(target) => {
            let join_id = manager.join(ctx, target.domain_id, target.domain_main).await?;
            let phase = manager.wait_for_placement(&join_id).await?;
            if phase.is_placed() {
                tracing::info!(join_id = %join_id, "Joined domain");
            } else {
                tracing::warn!(join_id = %join_id, phase = %phase, "Join did not complete");
            }
        }
    }
    Ok(())
}
