//! Strata Node binary
//!
//! A daemon hosting one member of the domain/cluster/channel overlay.

use strata_node::{NodeConfig, StrataNode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strata_node=info,strata_overlay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Strata Node");

    let config = NodeConfig::from_env()?;

    let node = StrataNode::new(config).await?;
    node.run().await?;

    Ok(())
}
