use canopy_infra::CanopyConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    canopy_observability::init();

    let config = CanopyConfig::from_env()?;
    let (app, services) = canopy_api::app::build_app(&config).await?;

    let worker = if config.worker.embedded {
        tracing::info!(
            concurrency = config.worker.concurrency,
            "starting embedded pipeline worker"
        );
        Some(services.spawn_worker())
    } else {
        None
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(worker) = worker {
        worker.shutdown().await;
    }
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
