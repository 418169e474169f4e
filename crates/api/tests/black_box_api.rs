use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Value, json};

use canopy_api::app::{AppServices, build_router, services::build_in_memory_services};
use canopy_core::AnalysisId;
use canopy_infra::CanopyConfig;
use canopy_infra::records::AnalysisRecord;

const CALLBACK_TOKEN: &str = "test-callback-secret";

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CALLBACK_TOKEN", CALLBACK_TOKEN),
            // Nothing listens here; no worker runs in these tests.
            ("PROCESSING_SERVICE_URL", "http://127.0.0.1:9"),
            ("EMBEDDED_WORKER", "false"),
        ]);
        let config = CanopyConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()))
            .expect("valid test config");

        let services = Arc::new(build_in_memory_services(&config).unwrap());
        let app = build_router(services.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services,
            handle,
        }
    }

    /// Create the analysis row the way the upload flow would.
    async fn seed_analysis(&self) -> AnalysisId {
        let id = AnalysisId::new();
        self.services
            .repository
            .insert(AnalysisRecord::pending(id, None, None))
            .await
            .unwrap();
        id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn user_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

fn start_body() -> Value {
    json!({
        "files": [{
            "fileId": uuid::Uuid::now_v7(),
            "storagePath": "uploads/plot-7.laz",
            "fileType": "laz"
        }],
        "parameters": {"minTreeHeight": 2.0}
    })
}

async fn start(client: &reqwest::Client, server: &TestServer, id: AnalysisId) -> reqwest::Response {
    client
        .post(server.url(&format!("/analyses/{id}/start")))
        .header("x-user-id", user_id())
        .json(&start_body())
        .send()
        .await
        .unwrap()
}

async fn callback(client: &reqwest::Client, server: &TestServer, body: Value) -> reqwest::Response {
    client
        .post(server.url("/pipeline/callback"))
        .header("x-callback-token", CALLBACK_TOKEN)
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let server = TestServer::spawn().await;
    let res = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn start_requires_a_user_header() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = server.seed_analysis().await;

    let res = client
        .post(server.url(&format!("/analyses/{id}/start")))
        .json(&start_body())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .post(server.url(&format!("/analyses/{id}/start")))
        .header("x-user-id", "not-a-uuid")
        .json(&start_body())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn start_of_unknown_analysis_is_404() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = start(&client, &server, AnalysisId::new()).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn full_run_through_callbacks() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = server.seed_analysis().await;

    let res = start(&client, &server, id).await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["jobId"], format!("analysis-{id}"));

    let res = client
        .get(server.url(&format!("/analyses/{id}/progress")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["stage"], "queued");
    assert_eq!(body["progress"], 0.0);

    for stage in ["ground_classification", "height_normalization"] {
        let res = callback(
            &client,
            &server,
            json!({"analysisId": id, "stage": stage, "progress": 100, "message": "done"}),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    let body: Value = client
        .get(server.url(&format!("/analyses/{id}/progress")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["stage"], "height_normalization");
    assert_eq!(body["progress"], 40.0);

    // Late report from an earlier stage.
    let res = callback(
        &client,
        &server,
        json!({"analysisId": id, "stage": "ground_classification", "progress": 50}),
    )
    .await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ignored");

    let res = client
        .get(server.url(&format!("/analyses/{id}/results")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "processing");
    assert_eq!(body["progress"]["progress"], 40.0);

    let res = callback(
        &client,
        &server,
        json!({
            "analysisId": id,
            "stage": "completed",
            "progress": 100,
            "intermediateResults": {"treeCount": 120, "averageHeight": 18.4}
        }),
    )
    .await;
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .get(server.url(&format!("/analyses/{id}/progress")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["stage"], "completed");
    assert_eq!(body["progress"], 100.0);

    let res = client
        .get(server.url(&format!("/analyses/{id}/results")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["treeCount"], 120);
    assert!(body["processingTime"].is_number());

    // A completed analysis cannot be restarted.
    let res = start(&client, &server, id).await;
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn callbacks_require_the_shared_token() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = server.seed_analysis().await;

    let res = client
        .post(server.url("/pipeline/callback"))
        .json(&json!({"analysisId": id, "stage": "tree_detection", "progress": 10}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn callbacks_with_unknown_stage_are_rejected() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = server.seed_analysis().await;

    let res = callback(
        &client,
        &server,
        json!({"analysisId": id, "stage": "voxelization", "progress": 10}),
    )
    .await;
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn failed_callback_marks_the_run_failed() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = server.seed_analysis().await;
    assert_eq!(start(&client, &server, id).await.status(), StatusCode::ACCEPTED);

    let res = callback(
        &client,
        &server,
        json!({"analysisId": id, "stage": "failed", "progress": 0, "message": "corrupt LAS header"}),
    )
    .await;
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .get(server.url(&format!("/analyses/{id}/progress")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["stage"], "failed");
    assert_eq!(body["message"], "corrupt LAS header");

    let res = client
        .get(server.url(&format!("/analyses/{id}/results")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_stops_a_queued_run() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = server.seed_analysis().await;
    assert_eq!(start(&client, &server, id).await.status(), StatusCode::ACCEPTED);

    let res = client
        .post(server.url(&format!("/analyses/{id}/cancel")))
        .header("x-user-id", user_id())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["cancelled"], true);

    let res = client
        .get(server.url(&format!("/jobs/analysis-{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let body: Value = client
        .get(server.url(&format!("/analyses/{id}/progress")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["stage"], "failed");
    assert_eq!(body["message"], "Analysis cancelled by user");

    // Cancelled analyses may be started again.
    assert_eq!(start(&client, &server, id).await.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn event_stream_starts_with_the_snapshot() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = server.seed_analysis().await;
    assert_eq!(start(&client, &server, id).await.status(), StatusCode::ACCEPTED);

    let mut res = client
        .get(server.url(&format!("/analyses/{id}/events")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(
        res.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let chunk = tokio::time::timeout(Duration::from_secs(5), res.chunk())
        .await
        .expect("no event within timeout")
        .unwrap()
        .expect("stream closed");
    let text = String::from_utf8_lossy(&chunk);
    assert!(text.contains("event: progress"), "unexpected frame: {text}");
    assert!(text.contains("\"stage\":\"queued\""), "unexpected frame: {text}");
}

#[tokio::test]
async fn queue_introspection() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = server.seed_analysis().await;
    assert_eq!(start(&client, &server, id).await.status(), StatusCode::ACCEPTED);

    let job: Value = client
        .get(server.url(&format!("/jobs/analysis-{id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["state"], "waiting");
    assert_eq!(job["name"], "full-pipeline");
    assert_eq!(job["priority"], 1);

    let stats: Value = client
        .get(server.url("/jobs/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["waiting"], 1);

    let jobs: Value = client
        .get(server.url("/jobs?state=waiting"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(jobs.as_array().unwrap().len(), 1);

    let res = client
        .get(server.url("/jobs/analysis-missing"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
