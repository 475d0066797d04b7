use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use pixelrelay::ingress::{router, IngressState};
use pixelrelay::prelude::*;

struct EchoProcessor;

#[async_trait]
impl ProcessingClient for EchoProcessor {
    async fn call(&self, endpoint: &str, arguments: Value) -> Result<StageResult> {
        let image_url = arguments["image_url"].as_str().unwrap_or_default();
        if image_url.contains("fail") {
            return Err(Error::processing(endpoint, 422, "unsupported image"));
        }
        let output = format!("{}?by={}", image_url, endpoint);
        let body = json!({
            "result": {"image": {"url": output}, "images": [{"url": output}]},
            "logs": [{"message": "done"}],
        });
        StageResult::from_body(body, Vec::new())
    }
}

fn state(broker: &MemoryBroker) -> IngressState {
    let publisher = AsyncPublisher::new(
        Arc::new(broker.clone()),
        OffloadPool::new(2),
        Duration::from_secs(1),
    );
    IngressState::new(publisher, Arc::new(EchoProcessor), StageModels::default())
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health() {
    let broker = MemoryBroker::new();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = router(state(&broker)).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"status": "ok"}));
}

#[tokio::test]
async fn test_process_image_queues_every_url() {
    let broker = MemoryBroker::new();
    let request = post(
        "/process-image",
        json!({"images": ["https://x/a.png", "https://x/b.png"]}),
    );
    let response = router(state(&broker)).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({"status": "success", "message": "Successfully queued 2 images"})
    );
    assert_eq!(
        broker.published_values("remove-background-start"),
        vec!["https://x/a.png", "https://x/b.png"]
    );
}

#[tokio::test]
async fn test_process_image_reports_broker_failure() {
    let broker = MemoryBroker::new();
    broker.set_fail_sends(true);
    let request = post("/process-image", json!({"images": ["https://x/a.png"]}));
    let response = router(state(&broker)).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert!(body["detail"].as_str().unwrap().contains("rejected"));
}

#[tokio::test]
async fn test_replace_background_forwards_to_upscale() {
    let broker = MemoryBroker::new();
    let request = post("/replace-background", json!({"image_url": "https://x/a.png"}));
    let response = router(state(&broker)).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let expected = "https://x/a.png?by=fal-ai/bria/background/replace";
    assert_eq!(body["url"], expected);
    assert_eq!(body["forwarded_to"], "upscale-start");
    assert_eq!(body["logs"][0]["message"], "done");
    assert_eq!(broker.published_values("upscale-start"), vec![expected]);
}

#[tokio::test]
async fn test_upscale_is_terminal() {
    let broker = MemoryBroker::new();
    let request = post("/upscale-image", json!({"image_url": "https://x/a.png"}));
    let response = router(state(&broker)).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["forwarded_to"], Value::Null);
    for topic in Topic::ALL {
        assert!(broker.published(topic.as_str()).is_empty());
    }
}

#[tokio::test]
async fn test_stage_failure_is_surfaced() {
    let broker = MemoryBroker::new();
    let request = post("/remove-background", json!({"image_url": "https://x/fail.png"}));
    let response = router(state(&broker)).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert!(body["detail"].as_str().unwrap().contains("422"));
    assert!(broker.published("replace-background-start").is_empty());
}
