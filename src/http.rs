//! HTTP binding: JSON endpoints plus a server-sent event stream per job

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tracing::error;

use crate::core::languages::LanguageSummary;
use crate::error::{RejectReason, ServiceError};
use crate::jobs::{JobEvent, JobId, JobSnapshot, QueueStatus, SubmissionRequest};
use crate::service::ExecutionService;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

pub fn router(service: Arc<ExecutionService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/languages", get(list_languages))
        .route("/api/queue", get(queue_status))
        .route("/api/executions", post(submit_execution))
        .route(
            "/api/executions/{id}",
            get(execution_status).delete(cancel_execution),
        )
        .route("/api/executions/{id}/events", get(execution_events))
        .with_state(service)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    job_id: JobId,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<RejectReason>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Rejected(RejectReason::PayloadTooLarge { .. }) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            ServiceError::Rejected(
                RejectReason::UnsupportedLanguage { .. } | RejectReason::EmptySource,
            ) => StatusCode::BAD_REQUEST,
            ServiceError::Rejected(
                RejectReason::UnsafeConstruct { .. } | RejectReason::PossibleInfiniteLoop,
            ) => StatusCode::UNPROCESSABLE_ENTITY,
        };

        let error = self.to_string();
        let reason = match self {
            ServiceError::Rejected(reason) => Some(reason),
            ServiceError::NotFound(_) => None,
        };
        (status, Json(ErrorResponse { error, reason })).into_response()
    }
}

/// GET /health
async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /api/languages
async fn list_languages(State(service): State<Arc<ExecutionService>>) -> Json<Vec<LanguageSummary>> {
    Json(service.languages())
}

/// GET /api/queue
async fn queue_status(State(service): State<Arc<ExecutionService>>) -> Json<QueueStatus> {
    Json(service.queue_status())
}

/// POST /api/executions - Submit source code for execution
async fn submit_execution(
    State(service): State<Arc<ExecutionService>>,
    Json(request): Json<SubmissionRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let job_id = service.submit(request)?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

/// GET /api/executions/{id}
async fn execution_status(
    State(service): State<Arc<ExecutionService>>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, ServiceError> {
    service.status(&JobId::from(id)).map(Json)
}

/// DELETE /api/executions/{id}
async fn cancel_execution(
    State(service): State<Arc<ExecutionService>>,
    Path(id): Path<String>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: service.cancel(&JobId::from(id)),
    })
}

/// GET /api/executions/{id}/events - Server-sent events until the job ends
async fn execution_events(
    State(service): State<Arc<ExecutionService>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServiceError> {
    let events = service.stream(&JobId::from(id))?;
    let stream = events.map(|event| Ok(to_sse_event(&event)));

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(SSE_KEEP_ALIVE)
            .text("keep-alive"),
    ))
}

fn to_sse_event(event: &JobEvent) -> Event {
    match Event::default().event(event.name()).json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            error!("Failed to serialize {} event: {}", event.name(), e);
            Event::default()
                .event("error")
                .data("failed to serialize event")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::core::languages::LanguageRegistry;
    use crate::core::outcome::{ExecutionResult, FailureKind, OutputChunk};
    use crate::engine::runner::{RunPhase, RunRequest, RunSink, Runner};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    /// Prints its source code back
    struct EchoRunner;

    #[async_trait]
    impl Runner for EchoRunner {
        async fn run(
            &self,
            request: &RunRequest,
            sink: &dyn RunSink,
            _cancel: &CancellationToken,
        ) -> ExecutionResult {
            sink.phase(RunPhase::Running);
            sink.output(OutputChunk::stdout(request.source_code.clone()));
            ExecutionResult {
                success: true,
                stdout: request.source_code.clone(),
                exit_code: Some(0),
                failure: None,
                message: "Execution completed".into(),
                ..ExecutionResult::failed(FailureKind::RuntimeError, "")
            }
        }
    }

    fn app() -> Router {
        let registry = Arc::new(LanguageRegistry::builtin().unwrap());
        let service = ExecutionService::with_runner(
            &ServiceConfig::default(),
            registry,
            Arc::new(EchoRunner),
        );
        router(Arc::new(service))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let (status, body) = send(app, request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    async fn submit(app: &Router, language: &str, source: &str) -> (StatusCode, Value) {
        send_json(
            app,
            post_json(
                "/api/executions",
                serde_json::json!({ "language": language, "sourceCode": source }),
            ),
        )
        .await
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = send(&app(), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK");
    }

    #[tokio::test]
    async fn test_languages_and_queue() {
        let app = app();
        let (status, languages) = send_json(&app, get("/api/languages")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(languages
            .as_array()
            .unwrap()
            .iter()
            .any(|l| l["id"] == "python" && l["needsCompile"] == false));

        let (status, queue) = send_json(&app, get("/api/queue")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(queue["maxConcurrent"], 5);
        assert_eq!(queue["queued"], 0);
    }

    #[tokio::test]
    async fn test_submit_then_poll() {
        let app = app();
        let (status, body) = submit(&app, "python", "print('hi')").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let job_id = body["jobId"].as_str().unwrap().to_string();

        let uri = format!("/api/executions/{}", job_id);
        let mut snapshot = Value::Null;
        for _ in 0..200 {
            let (status, body) = send_json(&app, get(&uri)).await;
            assert_eq!(status, StatusCode::OK);
            snapshot = body;
            if snapshot["status"] == "completed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(snapshot["status"], "completed");
        assert_eq!(snapshot["progress"], 100);
        assert_eq!(snapshot["outputSoFar"], "print('hi')");
        assert_eq!(snapshot["result"]["success"], true);
    }

    #[tokio::test]
    async fn test_event_stream() {
        let app = app();
        let (_, body) = submit(&app, "python", "print(1)").await;
        let job_id = body["jobId"].as_str().unwrap();

        let (status, body) = send(&app, get(&format!("/api/executions/{}/events", job_id))).await;
        assert_eq!(status, StatusCode::OK);

        let text = String::from_utf8(body).unwrap();
        let names: Vec<&str> = text
            .lines()
            .filter_map(|line| line.strip_prefix("event:"))
            .map(str::trim)
            .collect();
        assert_eq!(names.first(), Some(&"status"));
        assert!(names.contains(&"output"));
        assert_eq!(names.last(), Some(&"finished"));
        assert!(text.contains("\"status\":\"completed\""));
    }

    #[tokio::test]
    async fn test_rejections_map_to_status_codes() {
        let app = app();

        let (status, body) = submit(&app, "python", &"#".repeat(200_000)).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["reason"]["kind"], "payload_too_large");

        let (status, body) = submit(&app, "cobol", "DISPLAY 'HI'.").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["reason"]["kind"], "unsupported_language");

        let (status, body) = submit(&app, "python", "import subprocess\n").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["reason"]["kind"], "unsafe_construct");
        assert!(body["error"].as_str().unwrap().contains("disallowed"));

        let (_, queue) = send_json(&app, get("/api/queue")).await;
        assert_eq!(queue["active"], 0);
        assert_eq!(queue["queued"], 0);
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let app = app();
        let (status, body) = send_json(&app, get("/api/executions/missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "execution missing not found");

        let (status, _) = send(&app, get("/api/executions/missing/events")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let request = Request::delete("/api/executions/missing")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], false);
    }
}
