//! Strata Node - Overlay Daemon
//!
//! Runs one Node Manager behind an HTTP server so peers on other hosts can
//! allocate, register and confirm placements.
//!
//! # Architecture
//!
//! - **Config**: `STRATA_*` environment variables
//! - **Storage**: RocksDB-backed Node Store and persistent node identity
//! - **Client**: reqwest carrier for outgoing peer RPCs
//! - **API**: axum endpoints for incoming peer RPCs and status queries
//!
//! # Example
//!
//! ```no_run
//! use strata_node::{NodeConfig, StrataNode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::from_env()?;
//!     let node = StrataNode::new(config).await?;
//!     node.run().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod node;
pub mod storage;

pub use client::HttpPeerClient;
pub use config::{JoinTarget, NodeConfig};
pub use error::{Error, Result};
pub use node::{NodeState, StrataNode};
pub use storage::{compute_node_id, RocksStore};
