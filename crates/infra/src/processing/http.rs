//! reqwest client for `POST {base}/pipeline`.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::ProcessingSettings;

use super::{PipelineRequest, PipelineResponse, ProcessingError, ProcessingService};

#[derive(Debug, Clone)]
pub struct HttpProcessingClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpProcessingClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProcessingError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProcessingError::external(None, format!("failed to build client: {e}")))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    pub fn from_settings(settings: &ProcessingSettings) -> Result<Self, ProcessingError> {
        Self::new(settings.service_url.clone(), settings.request_timeout)
    }

    fn pipeline_url(&self) -> String {
        format!("{}/pipeline", self.base_url.trim_end_matches('/'))
    }

    async fn send(&self, request: &PipelineRequest) -> Result<PipelineResponse, ProcessingError> {
        let response = self
            .client
            .post(self.pipeline_url())
            .json(request)
            .send()
            .await
            .map_err(|e| ProcessingError::external(None, format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProcessingError::external(
                Some(status.as_u16()),
                failure_message(&body),
            ));
        }

        let body: PipelineResponse = response.json().await.map_err(|e| {
            ProcessingError::external(Some(status.as_u16()), format!("invalid response: {e}"))
        })?;

        if !body.success {
            let message = body
                .error
                .clone()
                .unwrap_or_else(|| "Pipeline execution failed".to_string());
            return Err(ProcessingError::external(Some(status.as_u16()), message));
        }
        Ok(body)
    }
}

/// Leads with the `error`/`message` field when the body carries one; the raw
/// body is always kept.
fn failure_message(body: &str) -> String {
    let summary = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        });
    match summary {
        Some(summary) => format!("{summary} (body: {body})"),
        None if body.is_empty() => "empty response body".to_string(),
        None => body.to_string(),
    }
}

#[async_trait]
impl ProcessingService for HttpProcessingClient {
    #[instrument(skip_all, fields(analysis_id = %request.analysis_id, files = request.files.len()))]
    async fn run_pipeline(
        &self,
        request: PipelineRequest,
        cancel: CancellationToken,
    ) -> Result<PipelineResponse, ProcessingError> {
        debug!(url = %self.pipeline_url(), "submitting pipeline request");
        tokio::select! {
            // Dropping the request future aborts the in-flight HTTP call.
            _ = cancel.cancelled() => {
                warn!("pipeline request aborted by cancellation");
                Err(ProcessingError::Cancelled)
            }
            result = self.send(&request) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use canopy_core::AnalysisId;
    use serde_json::{Value, json};

    use crate::config::StorageConfig;

    async fn spawn_server(status: StatusCode, body: Value, delay: Duration) -> String {
        let app = Router::new().route(
            "/pipeline",
            post(move || {
                let body = body.clone();
                async move {
                    tokio::time::sleep(delay).await;
                    (status, axum::Json(body))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn request() -> PipelineRequest {
        PipelineRequest {
            analysis_id: AnalysisId::new(),
            files: vec![],
            parameters: json!({}),
            callback_url: "http://localhost/pipeline/callback".to_string(),
            storage_config: StorageConfig::default(),
        }
    }

    #[tokio::test]
    async fn synchronous_results_are_returned() {
        let url = spawn_server(
            StatusCode::OK,
            json!({"success": true, "results": {"treeCount": 120}}),
            Duration::ZERO,
        )
        .await;
        let client = HttpProcessingClient::new(url, Duration::from_secs(5)).unwrap();

        let response = client
            .run_pipeline(request(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.synchronous_results(), Some(&json!({"treeCount": 120})));
    }

    #[tokio::test]
    async fn non_success_status_is_external_error() {
        let url = spawn_server(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "out of memory"}),
            Duration::ZERO,
        )
        .await;
        let client = HttpProcessingClient::new(url, Duration::from_secs(5)).unwrap();

        let err = client
            .run_pipeline(request(), CancellationToken::new())
            .await
            .unwrap_err();
        let ProcessingError::ExternalService { status, message } = err else {
            panic!("expected external error, got {err:?}");
        };
        assert_eq!(status, Some(500));
        assert!(message.starts_with("out of memory"));
        assert!(message.contains(r#"{"error":"out of memory"}"#));
    }

    #[tokio::test]
    async fn error_body_without_summary_field_is_kept_whole() {
        let body = json!({"detail": "tile 7 unreadable", "code": 42});
        let url = spawn_server(StatusCode::BAD_GATEWAY, body.clone(), Duration::ZERO).await;
        let client = HttpProcessingClient::new(url, Duration::from_secs(5)).unwrap();

        let err = client
            .run_pipeline(request(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, ProcessingError::external(Some(502), body.to_string()));
    }

    #[tokio::test]
    async fn request_timeout_is_enforced() {
        let url = spawn_server(StatusCode::OK, json!({"success": true}), Duration::from_secs(30)).await;
        let client = HttpProcessingClient::new(url, Duration::from_millis(200)).unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            client.run_pipeline(request(), CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, ProcessingError::ExternalService { status: None, .. }));
    }

    #[tokio::test]
    async fn success_false_is_external_error() {
        let url = spawn_server(
            StatusCode::OK,
            json!({"success": false, "error": "bad tile"}),
            Duration::ZERO,
        )
        .await;
        let client = HttpProcessingClient::new(url, Duration::from_secs(5)).unwrap();

        let err = client
            .run_pipeline(request(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::ExternalService { status: Some(200), .. }));
    }

    #[tokio::test]
    async fn unreachable_service_has_no_status() {
        let client = HttpProcessingClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = client
            .run_pipeline(request(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::ExternalService { status: None, .. }));
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_request() {
        let url = spawn_server(StatusCode::OK, json!({"success": true}), Duration::from_secs(30)).await;
        let client = HttpProcessingClient::new(url, Duration::from_secs(60)).unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(5), client.run_pipeline(request(), cancel))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, ProcessingError::Cancelled);
    }
}
