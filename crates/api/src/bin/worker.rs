//! Standalone pipeline worker: consumes the analysis queue without serving HTTP.
//!
//! Needs the same persistent stores as the API process to be useful.

use canopy_infra::CanopyConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    canopy_observability::init();

    let config = CanopyConfig::from_env()?;
    if !config.use_persistent_stores {
        tracing::warn!("worker running with in-memory stores; it will only see its own jobs");
    }

    let services = canopy_api::app::services::build_services(&config).await?;
    let worker = services.spawn_worker();
    tracing::info!(
        concurrency = config.worker.concurrency,
        "pipeline worker started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    worker.shutdown().await;
    Ok(())
}
