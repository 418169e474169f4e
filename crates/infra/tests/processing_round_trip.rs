//! End-to-end run against a mock processing service.
//!
//! The mock acknowledges the request and then reports progress through HTTP
//! callbacks, the way the real service does. A small callback endpoint feeds
//! those into the orchestrator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};

use canopy_analysis::{AnalysisStatus, CallbackPayload, ProgressEvent};
use canopy_core::{AnalysisId, UserId};
use canopy_events::Subscription;
use canopy_infra::cache::{InMemoryProgressStore, ProgressStore};
use canopy_infra::jobs::{InMemoryJobStore, JobExecutorConfig, JobQueue};
use canopy_infra::pipeline::{PipelineDeps, PipelineOrchestrator, PipelineSettings, spawn_pipeline_worker};
use canopy_infra::processing::HttpProcessingClient;
use canopy_infra::records::{AnalysisRecord, AnalysisRepository, InMemoryAnalysisRepository};

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Acknowledges every request, then walks the stages through callbacks.
async fn mock_pipeline(Json(request): Json<Value>) -> Json<Value> {
    let callback_url = request["callbackUrl"].as_str().unwrap().to_string();
    let analysis_id = request["analysisId"].clone();

    tokio::spawn(async move {
        let client = reqwest::Client::new();
        let steps = [
            json!({"stage": "ground_classification", "progress": 100, "message": "ground done"}),
            json!({"stage": "height_normalization", "progress": 100, "message": "heights done"}),
            json!({"stage": "tree_detection", "progress": 50, "message": "segmenting"}),
            json!({"stage": "metrics_extraction", "progress": 100, "message": "metrics done"}),
            json!({
                "stage": "completed",
                "progress": 100,
                "intermediateResults": {"treeCount": 120, "totalCarbon": 81.5}
            }),
        ];
        for mut step in steps {
            step["analysisId"] = analysis_id.clone();
            client.post(&callback_url).json(&step).send().await.unwrap();
        }
    });

    Json(json!({"success": true}))
}

async fn failing_pipeline() -> (StatusCode, Json<Value>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": "no GPU available"})),
    )
}

async fn callback(
    State(orchestrator): State<Arc<PipelineOrchestrator>>,
    Json(payload): Json<CallbackPayload>,
) -> StatusCode {
    match orchestrator.handle_callback(payload).await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

struct Running {
    orchestrator: Arc<PipelineOrchestrator>,
    repository: Arc<InMemoryAnalysisRepository>,
    progress: Arc<InMemoryProgressStore>,
}

async fn setup(service: Router) -> Running {
    let service_addr = serve(service).await;

    // Reserve the callback address first; the orchestrator needs it in its settings.
    let callback_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let callback_addr = callback_listener.local_addr().unwrap();

    let mut settings = PipelineSettings::default();
    settings.processing.service_url = format!("http://{service_addr}");
    settings.processing.callback_base_url = format!("http://{callback_addr}");
    settings.jobs.attempts = 1;

    let repository = Arc::new(InMemoryAnalysisRepository::new());
    let progress = Arc::new(InMemoryProgressStore::new());
    let orchestrator = Arc::new(PipelineOrchestrator::new(PipelineDeps {
        repository: repository.clone(),
        progress: progress.clone(),
        queue: JobQueue::new(InMemoryJobStore::arc()),
        processing: Arc::new(HttpProcessingClient::from_settings(&settings.processing).unwrap()),
        settings,
    }));

    let app = Router::new()
        .route("/pipeline/callback", post(callback))
        .with_state(orchestrator.clone());
    tokio::spawn(async move {
        let _ = axum::serve(callback_listener, app).await;
    });

    Running {
        orchestrator,
        repository,
        progress,
    }
}

async fn start(running: &Running) -> (AnalysisId, Subscription<ProgressEvent>) {
    let id = AnalysisId::new();
    running
        .repository
        .insert(AnalysisRecord::pending(id, None, None))
        .await
        .unwrap();
    let events = running.progress.subscribe(id).await.unwrap();
    running
        .orchestrator
        .start_pipeline(id, vec![], json!({"minTreeHeight": 2.0}), UserId::new())
        .await
        .unwrap();
    (id, events)
}

async fn final_event(events: &mut Subscription<ProgressEvent>) -> (ProgressEvent, Vec<f64>) {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event stream closed");
        if event.is_final() {
            return (event, seen);
        }
        if let ProgressEvent::Progress { progress, .. } = event {
            seen.push(progress);
        }
    }
}

fn worker_config() -> JobExecutorConfig {
    JobExecutorConfig::new(canopy_analysis::ANALYSIS_QUEUE).with_poll_interval(Duration::from_millis(20))
}

#[tokio::test]
async fn callbacks_drive_the_run_to_completion() {
    let running = setup(Router::new().route("/pipeline", post(mock_pipeline))).await;
    let worker = spawn_pipeline_worker(running.orchestrator.clone(), worker_config());
    let (id, mut events) = start(&running).await;

    let (last, progress) = final_event(&mut events).await;
    worker.shutdown().await;

    assert_eq!(last.kind(), "complete");
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {progress:?}");
    assert!(progress.contains(&55.0));

    let stored = running.repository.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, AnalysisStatus::Completed);
    assert_eq!(stored.progress, 100);
    let results = running.orchestrator.get_results(id).await.unwrap().unwrap();
    assert_eq!(results.get("treeCount"), Some(&json!(120)));
}

#[tokio::test]
async fn service_errors_fail_the_analysis() {
    let running = setup(Router::new().route("/pipeline", post(failing_pipeline))).await;
    let worker = spawn_pipeline_worker(running.orchestrator.clone(), worker_config());
    let (id, mut events) = start(&running).await;

    let (last, _) = final_event(&mut events).await;
    worker.shutdown().await;

    match last {
        ProgressEvent::Error { error, .. } => assert!(error.contains("no GPU available")),
        other => panic!("expected error event, got {other:?}"),
    }
    let stored = running.repository.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, AnalysisStatus::Failed);
}
