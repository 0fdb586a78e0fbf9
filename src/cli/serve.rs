//! CLI `serve` command: run the background scheduler until Ctrl-C.

use anyhow::{Context, Result};

use crate::config::TierMemConfig;
use crate::system::TierMem;

pub async fn serve(config: TierMemConfig) -> Result<()> {
    let system = TierMem::open(config)?;
    if !system.config.scheduler.enabled {
        anyhow::bail!("scheduler is disabled; set `scheduler.enabled = true` to run the daemon");
    }

    let scheduler = system.start_scheduler();
    tracing::info!("tiermem running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");

    scheduler.shutdown().await;
    Ok(())
}
