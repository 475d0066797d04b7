//! HttpProcessingClient against an in-process model runner

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pixelrelay::config::{ProcessingConfig, ProcessingMode};
use pixelrelay::processing::OutputShape;
use pixelrelay::prelude::*;

#[derive(Default)]
struct Runner {
    status_polls: AtomicUsize,
    authorizations: Mutex<Vec<String>>,
    received: Mutex<Vec<Value>>,
}

impl Runner {
    fn record(&self, headers: &HeaderMap) {
        let key = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        self.authorizations.lock().unwrap().push(key);
    }
}

type Shared = Arc<Runner>;

async fn run_sync(
    State(runner): State<Shared>,
    headers: HeaderMap,
    Json(arguments): Json<Value>,
) -> (StatusCode, Json<Value>) {
    runner.record(&headers);
    runner.received.lock().unwrap().push(arguments.clone());
    let url = arguments["image_url"].as_str().unwrap_or_default();
    if url.contains("fail") {
        return (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({"detail": "bad image"})));
    }
    (
        StatusCode::OK,
        Json(json!({"image": {"url": format!("{}.out", url), "width": 1024}})),
    )
}

async fn submit(
    State(runner): State<Shared>,
    headers: HeaderMap,
    Json(arguments): Json<Value>,
) -> Json<Value> {
    runner.record(&headers);
    runner.received.lock().unwrap().push(arguments);
    Json(json!({"request_id": "req-1"}))
}

async fn status(
    State(runner): State<Shared>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    assert_eq!(id, "req-1");
    assert_eq!(query.get("logs").map(String::as_str), Some("1"));
    let polls = runner.status_polls.fetch_add(1, Ordering::SeqCst);
    match polls {
        0 => Json(json!({"status": "IN_QUEUE"})),
        1 => Json(json!({"status": "IN_PROGRESS", "logs": [{"message": "loading"}]})),
        _ => Json(json!({
            "status": "COMPLETED",
            "logs": [{"message": "loading"}, {"message": "done"}],
        })),
    }
}

async fn response(Path(id): Path<String>) -> Json<Value> {
    assert_eq!(id, "req-1");
    Json(json!({"images": [{"url": "https://x/b.png"}, {"url": "https://x/c.png"}]}))
}

async fn spawn_runner() -> (SocketAddr, Shared) {
    let runner: Shared = Arc::new(Runner::default());
    let app = Router::new()
        .route("/sync/fal-ai/birefnet/v2", post(run_sync))
        .route("/queue/fal-ai/bria/background/replace", post(submit))
        .route(
            "/queue/fal-ai/bria/background/replace/requests/{id}/status",
            get(status),
        )
        .route(
            "/queue/fal-ai/bria/background/replace/requests/{id}",
            get(response),
        )
        .with_state(runner.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, runner)
}

fn client(addr: SocketAddr, mode: ProcessingMode) -> HttpProcessingClient {
    let config = ProcessingConfig {
        mode,
        base_url: format!("http://{}/sync/", addr),
        queue_url: format!("http://{}/queue", addr),
        api_key: Some("secret".to_string()),
        status_interval_ms: 5,
        ..ProcessingConfig::default()
    };
    HttpProcessingClient::new(HttpSession::new().unwrap(), &config)
}

#[tokio::test]
async fn test_sync_call_returns_output_image() {
    let (addr, runner) = spawn_runner().await;
    let client = client(addr, ProcessingMode::Sync);

    let result = client
        .call("fal-ai/birefnet/v2", json!({"image_url": "https://x/a.png"}))
        .await
        .unwrap();

    assert_eq!(result.output_url(OutputShape::Single), Some("https://x/a.png.out"));
    assert_eq!(result.result.image.unwrap().width, Some(1024));
    assert_eq!(*runner.authorizations.lock().unwrap(), vec!["Key secret"]);
}

#[tokio::test]
async fn test_sync_call_failure_status() {
    let (addr, _runner) = spawn_runner().await;
    let client = client(addr, ProcessingMode::Sync);

    let err = client
        .call("fal-ai/birefnet/v2", json!({"image_url": "https://x/fail.png"}))
        .await
        .unwrap_err();

    match err {
        Error::Processing { endpoint, status, body } => {
            assert_eq!(endpoint, "fal-ai/birefnet/v2");
            assert_eq!(status, 422);
            assert!(body.contains("bad image"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_queued_call_polls_until_completed() {
    let (addr, runner) = spawn_runner().await;
    let client = client(addr, ProcessingMode::Queue);

    let arguments = json!({"image_url": "https://x/a.png", "prompt": "marble surface"});
    let result = client
        .call("fal-ai/bria/background/replace", arguments.clone())
        .await
        .unwrap();

    assert_eq!(result.output_url(OutputShape::Multi), Some("https://x/b.png"));
    let logs: Vec<&str> = result.logs.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(logs, vec!["loading", "done"]);
    assert_eq!(runner.status_polls.load(Ordering::SeqCst), 3);
    assert_eq!(*runner.received.lock().unwrap(), vec![arguments]);
}

#[tokio::test]
async fn test_closed_session_refuses_calls() {
    let (addr, runner) = spawn_runner().await;
    let session = HttpSession::new().unwrap();
    let config = ProcessingConfig {
        mode: ProcessingMode::Sync,
        base_url: format!("http://{}/sync", addr),
        ..ProcessingConfig::default()
    };
    let client = HttpProcessingClient::new(session.clone(), &config);

    assert!(session.close());
    assert!(!session.close());
    let err = client
        .call("fal-ai/birefnet/v2", json!({"image_url": "https://x/a.png"}))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SessionClosed));
    assert!(runner.received.lock().unwrap().is_empty());
}
