//! REFDATA node entry point
//!
//! Loads configuration from the environment, starts a single-process node
//! and runs until Ctrl-C.

use refdata_core::{RefdataConfig, RefdataResult};
use refdata_node::{init_tracing, RefdataNode};

#[tokio::main]
async fn main() -> RefdataResult<()> {
    if let Err(e) = init_tracing() {
        eprintln!("tracing subscriber not installed: {e}");
    }

    let config = RefdataConfig::from_env();
    config.validate()?;
    if config.dictionaries.is_empty() {
        tracing::warn!("No dictionaries configured; set REFDATA_DICTIONARIES");
    }

    let node = RefdataNode::new(config)?;
    node.start();

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    } else {
        tracing::info!("Shutdown signal received");
    }

    node.shutdown().await;
    Ok(())
}
