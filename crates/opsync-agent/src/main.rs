//! # opsync Agent
//!
//! Runs one device: drains the offline queue to the remote store, exchanges
//! operations with peers over MQTT and applies what arrives.

use anyhow::Result;
use opsync_agent::{Agent, AgentConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting opsync agent");

    let config = AgentConfig::from_env()?;
    let agent = Agent::new(config)?;

    tracing::info!(device = %agent.device(), pending = agent.queue().len(), "Agent initialized");

    agent.run().await?;

    Ok(())
}
