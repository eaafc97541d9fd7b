//! Cluster - Incentivised Storage Overlay Node in Rust
//!
//! A P2P storage node core: Kademlia topology, hive discovery,
//! per-peer accounting with time-based settlement, and feed lookup.

use cluster_core::{run_node, Config};
use std::error::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Parse CLI arguments and build config
    let config = Config::from_cli()?;

    // Initialize logging
    init_logging(&config.log_level);

    tracing::info!("Starting Cluster node...");

    // Run the node
    run_node(config).await?;

    Ok(())
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
