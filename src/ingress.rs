//! HTTP ingress.
//!
//! `/process-image` queues images onto the first stage's topic. The
//! per-stage endpoints run one stage inline and forward its output, which
//! is handy for driving a single step by hand.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;

use crate::config::IngressConfig;
use crate::error::{Error, Result};
use crate::processing::ProcessingClient;
use crate::publisher::AsyncPublisher;
use crate::stage::{Stage, StageModels};
use crate::topic::Topic;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRequest {
    pub image_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessImages {
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedResponse {
    pub status: String,
    pub message: String,
}

/// Handles shared by every request
#[derive(Clone)]
pub struct IngressState {
    publisher: AsyncPublisher,
    processor: Arc<dyn ProcessingClient>,
    models: StageModels,
}

impl IngressState {
    pub fn new(
        publisher: AsyncPublisher,
        processor: Arc<dyn ProcessingClient>,
        models: StageModels,
    ) -> Self {
        Self {
            publisher,
            processor,
            models,
        }
    }
}

/// Any ingress failure, reported as a 500 with a `detail` field
pub struct IngressError(Error);

impl From<Error> for IngressError {
    fn from(e: Error) -> Self {
        IngressError(e)
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": self.0.to_string() })),
        )
            .into_response()
    }
}

pub fn router(state: IngressState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/process-image", post(process_image))
        .route("/remove-background", post(remove_background))
        .route("/replace-background", post(replace_background))
        .route("/upscale-image", post(upscale_image))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves
pub async fn serve<F>(config: &IngressConfig, state: IngressState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "ingress listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn process_image(
    State(state): State<IngressState>,
    Json(request): Json<ProcessImages>,
) -> std::result::Result<Json<QueuedResponse>, IngressError> {
    let publishes = request
        .images
        .iter()
        .map(|image| state.publisher.publish(Topic::RemoveBackground, image));
    try_join_all(publishes).await?;

    Ok(Json(QueuedResponse {
        status: "success".to_string(),
        message: format!("Successfully queued {} images", request.images.len()),
    }))
}

async fn remove_background(
    State(state): State<IngressState>,
    Json(request): Json<ImageRequest>,
) -> std::result::Result<Json<serde_json::Value>, IngressError> {
    run_stage(&state, Stage::RemoveBackground, &request.image_url).await
}

async fn replace_background(
    State(state): State<IngressState>,
    Json(request): Json<ImageRequest>,
) -> std::result::Result<Json<serde_json::Value>, IngressError> {
    run_stage(&state, Stage::ReplaceBackground, &request.image_url).await
}

async fn upscale_image(
    State(state): State<IngressState>,
    Json(request): Json<ImageRequest>,
) -> std::result::Result<Json<serde_json::Value>, IngressError> {
    run_stage(&state, Stage::Upscale, &request.image_url).await
}

async fn run_stage(
    state: &IngressState,
    stage: Stage,
    image_url: &str,
) -> std::result::Result<Json<serde_json::Value>, IngressError> {
    tracing::info!(stage = stage.name(), "running stage inline");
    let (result, url) = state
        .models
        .invoke(state.processor.as_ref(), stage, image_url)
        .await?;

    match stage.next_topic() {
        Some(topic) => state.publisher.publish(topic, &url).await?,
        None => {
            tracing::info!(stage = stage.name(), url = %url, "pipeline completed");
        }
    }

    Ok(Json(json!({
        "status": "success",
        "url": url,
        "forwarded_to": stage.next_topic().map(Topic::as_str),
        "logs": result.logs,
    })))
}
