//! Strata Overlay - Capacity-Bounded Placement Protocol
//!
//! A three-tier overlay (domain → cluster → channel) into which nodes are
//! placed by a multi-step, asynchronously confirmed join.
//!
//! # Architecture
//!
//! - **Types**: identifiers, tier levels, main-node and member rows
//! - **Store**: the Node Store trait and an in-memory implementation
//! - **Allocation**: first-fit tier selection under a capacity ceiling
//! - **Confirmation**: per-join state machine, strictly level-ordered
//! - **Escalator**: confirmation timers and the retry/escalation policy
//! - **RPC**: wire types and the carrier-agnostic `PeerClient` trait
//! - **Manager**: the façade that serves peers and drives joins
//! - **Loopback**: in-process carrier for simulations and tests
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use strata_overlay::{
//!     LoopbackNetwork, MemoryStore, NodeContext, NodeManager, OverlayConfig, StaticDirectory,
//! };
//!
//! #[tokio::main]
//! async fn main() -> strata_overlay::Result<()> {
//!     let network = Arc::new(LoopbackNetwork::new());
//!     let manager = NodeManager::new(
//!         OverlayConfig::default(),
//!         Arc::new(MemoryStore::new()),
//!         network.clone(),
//!         Arc::new(StaticDirectory::new()),
//!     );
//!     let ctx = NodeContext::new("a").with_addr("mem://a");
//!     network.attach(manager.clone(), ctx.clone())?;
//!     let member = manager.bootstrap(&ctx).await?;
//!     println!("placed in channel {}", member.channel_id);
//!     Ok(())
//! }
//! ```

pub mod allocation;
pub mod confirmation;
pub mod directory;
pub mod error;
pub mod escalator;
pub mod heartbeat;
pub mod loopback;
pub mod manager;
pub mod rpc;
pub mod store;
pub mod supervisor;
pub mod types;

pub use allocation::{Allocator, DEFAULT_TIER_CAPACITY};
pub use confirmation::{ConfirmationStep, JoinPhase, JoinProgress, JoinSnapshot};
pub use directory::{PeerDirectory, StaticDirectory};
pub use error::{Error, Result};
pub use escalator::{ConfirmationTimers, RetryDecision, RetryPolicy};
pub use heartbeat::spawn_heartbeat;
pub use loopback::{LoopbackNetwork, CALL_LOG_LIMIT};
pub use manager::{LocalPlacement, NodeManager, OverlayConfig, DEFAULT_FINISHED_JOIN_RETENTION};
pub use rpc::{
    Ack, AddNewNode, NewChannelRequest, NewClusterRequest, PeerClient, RegisterAccepted,
    RegisterConfirmed, RegisterToChannelRequest, RegisterToClusterRequest,
    RegisterToDomainRequest, RpcOperation, RpcResponse,
};
pub use store::{MemoryStore, NodeStore};
pub use supervisor::TaskSupervisor;
pub use types::{
    ChannelId, ChannelMainNode, ChannelNode, ClusterId, ClusterMainNode, DomainId,
    DomainMainNode, JoinId, MainNodeRecord, NodeContext, NodeId, PeerAddr, PeerTarget,
    TierLevel,
};
