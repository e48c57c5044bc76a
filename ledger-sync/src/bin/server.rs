//! Ledger sync server binary
//!
//! Usage: `ledger-sync-server [config.toml]`; without a path the config is
//! read from `LEDGER_SYNC_CONFIG` or from `LEDGER_SYNC_*` variables alone.

use anyhow::Context;
use ledger_sync::{metrics, Config, RpcChainClient, SyncEngine};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting ledger sync server");

    // Load configuration
    let config = match std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LEDGER_SYNC_CONFIG").ok())
    {
        Some(path) => {
            let mut config = Config::from_file(&path)
                .with_context(|| format!("loading config from {}", path))?;
            config.apply_env()?;
            config.validate()?;
            config
        }
        None => Config::from_env()?,
    };

    let chain = RpcChainClient::connect(&config.chain)
        .await
        .context("connecting to chain")?;

    let engine = SyncEngine::open(&config, Arc::new(chain)).context("opening sync engine")?;
    engine.start().await?;
    tracing::info!(status = ?engine.status().await?, "Sync engine started");

    tokio::signal::ctrl_c().await?;

    engine.shutdown().await?;
    tracing::debug!(metrics = %metrics::gather_text()?, "Final metrics");
    tracing::info!("Shutting down ledger sync server");
    Ok(())
}
