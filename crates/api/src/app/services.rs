use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio::sync::mpsc::unbounded_channel;
use tokio_stream::wrappers::UnboundedReceiverStream;

use canopy_analysis::ProgressEvent;
use canopy_core::AnalysisId;
use canopy_infra::{
    CanopyConfig,
    cache::{InMemoryProgressStore, ProgressStore},
    jobs::{InMemoryJobStore, JobExecutorHandle, JobQueue},
    pipeline::{
        PipelineDeps, PipelineError, PipelineOrchestrator, PipelineSettings,
        spawn_pipeline_worker, worker_config,
    },
    processing::HttpProcessingClient,
    records::{AnalysisRepository, InMemoryAnalysisRepository},
};

#[cfg(feature = "redis")]
use canopy_infra::{
    cache::RedisProgressStore, jobs::PostgresJobStore, records::PostgresAnalysisRepository,
};
#[cfg(feature = "redis")]
use sqlx::PgPool;

/// Everything the handlers need, shared behind an `Arc`.
#[derive(Clone)]
pub struct AppServices {
    pub config: CanopyConfig,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub repository: Arc<dyn AnalysisRepository>,
    pub progress: Arc<dyn ProgressStore>,
    pub queue: JobQueue,
}

impl AppServices {
    /// Start consuming the analysis queue in this process.
    pub fn spawn_worker(&self) -> JobExecutorHandle {
        spawn_pipeline_worker(
            self.orchestrator.clone(),
            worker_config(&self.config.worker),
        )
    }

    fn assemble(
        config: &CanopyConfig,
        repository: Arc<dyn AnalysisRepository>,
        progress: Arc<dyn ProgressStore>,
        queue: JobQueue,
    ) -> anyhow::Result<Self> {
        let processing = Arc::new(HttpProcessingClient::from_settings(&config.processing)?);
        let orchestrator = Arc::new(PipelineOrchestrator::new(PipelineDeps {
            repository: repository.clone(),
            progress: progress.clone(),
            queue: queue.clone(),
            processing,
            settings: PipelineSettings::from_config(config),
        }));

        Ok(Self {
            config: config.clone(),
            orchestrator,
            repository,
            progress,
            queue,
        })
    }
}

pub async fn build_services(config: &CanopyConfig) -> anyhow::Result<AppServices> {
    if config.use_persistent_stores {
        #[cfg(feature = "redis")]
        {
            return build_persistent_services(config).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!(
                "USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory"
            );
            return build_in_memory_services(config);
        }
    }

    build_in_memory_services(config)
}

/// In-memory wiring (dev/test): a single process owns queue, cache and records.
pub fn build_in_memory_services(config: &CanopyConfig) -> anyhow::Result<AppServices> {
    let repository: Arc<InMemoryAnalysisRepository> = Arc::new(InMemoryAnalysisRepository::new());
    let progress: Arc<InMemoryProgressStore> = Arc::new(InMemoryProgressStore::new());
    let queue = JobQueue::new(InMemoryJobStore::arc());

    tracing::info!("using in-memory stores");
    AppServices::assemble(config, repository, progress, queue)
}

#[cfg(feature = "redis")]
async fn build_persistent_services(config: &CanopyConfig) -> anyhow::Result<AppServices> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set for persistent stores"))?;
    let redis_url = config
        .redis_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("REDIS_URL must be set for persistent stores"))?;

    let pool = PgPool::connect(database_url).await?;

    let jobs = PostgresJobStore::new(pool.clone());
    jobs.ensure_schema().await?;
    let repository = PostgresAnalysisRepository::new(pool);
    repository.ensure_schema().await?;
    let progress = RedisProgressStore::connect(redis_url).await?;

    tracing::info!("using postgres + redis stores");
    AppServices::assemble(
        config,
        Arc::new(repository),
        Arc::new(progress),
        JobQueue::new(Arc::new(jobs)),
    )
}

/// Live progress of one analysis as Server-Sent Events.
///
/// The current snapshot is sent first so late subscribers start from the
/// latest state; the stream ends after the run's final event.
pub async fn analysis_sse_stream(
    services: Arc<AppServices>,
    id: AnalysisId,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>>, PipelineError> {
    // Subscribe before reading the snapshot so nothing falls in between.
    let mut subscription = services.progress.subscribe(id).await?;
    let snapshot = services.orchestrator.get_progress(id).await?;

    let (tx, rx) = unbounded_channel::<Result<SseEvent, Infallible>>();
    tokio::spawn(async move {
        let initial = ProgressEvent::progress(&snapshot);
        if tx.send(Ok(to_sse(&initial))).is_err() || snapshot.stage.is_terminal() {
            return;
        }

        while let Some(event) = subscription.recv().await {
            if tx.send(Ok(to_sse(&event))).is_err() || event.is_final() {
                break;
            }
        }
    });

    Ok(Sse::new(UnboundedReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn to_sse(event: &ProgressEvent) -> SseEvent {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default().event(event.kind()).data(data)
}
