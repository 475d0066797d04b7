//! External image-processing calls.
//!
//! The pipeline treats model inference as an opaque remote call: a JSON
//! argument object in, a result carrying one or more image URLs out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ProcessingConfig, ProcessingMode};
use crate::error::{Error, Result};

/// A reference to an image produced by a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Model output, in either the single-image or multi-image shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageRef>,
}

/// Which response shape a stage expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    /// `{"image": {"url": ...}}`
    Single,
    /// `{"images": [{"url": ...}, ...]}`
    Multi,
}

/// A progress line reported while a request runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub message: String,
}

/// Response of one processing call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageResult {
    pub result: ImageOutput,
    pub logs: Vec<LogLine>,
}

impl StageResult {
    /// The follow-on image URL, preferring `shape` and falling back to the other
    pub fn output_url(&self, shape: OutputShape) -> Option<&str> {
        let single = self.result.image.as_ref().map(|image| image.url.as_str());
        let first = self.result.images.first().map(|image| image.url.as_str());
        match shape {
            OutputShape::Single => single.or(first),
            OutputShape::Multi => first.or(single),
        }
    }

    /// Build a result from a response body.
    ///
    /// Accepts either a `{result, logs}` envelope or the bare model output.
    pub fn from_body(body: Value, logs: Vec<LogLine>) -> Result<Self> {
        if body.get("result").is_some_and(Value::is_object) {
            let mut parsed: StageResult = serde_json::from_value(body)?;
            if parsed.logs.is_empty() {
                parsed.logs = logs;
            }
            return Ok(parsed);
        }
        Ok(Self {
            result: serde_json::from_value(body)?,
            logs,
        })
    }
}

/// A remote model runner.
#[async_trait]
pub trait ProcessingClient: Send + Sync {
    /// Run `endpoint` with `arguments` and wait for its result.
    ///
    /// There is no caller-imposed deadline; a stuck call waits indefinitely.
    async fn call(&self, endpoint: &str, arguments: Value) -> Result<StageResult>;
}

/// The HTTP client session shared by every handler.
///
/// Closing it makes every later call fail with [`Error::SessionClosed`].
#[derive(Debug, Clone)]
pub struct HttpSession {
    client: reqwest::Client,
    closed: Arc<AtomicBool>,
}

impl HttpSession {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pixelrelay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self {
            client,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn client(&self) -> Result<&reqwest::Client> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        Ok(&self.client)
    }

    /// Close the session. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Deserialize)]
struct QueueSubmission {
    request_id: String,
    #[serde(default)]
    status_url: Option<String>,
    #[serde(default)]
    response_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueueStatus {
    status: String,
    #[serde(default)]
    logs: Option<Vec<LogLine>>,
}

/// Processing client speaking the hosted model runner's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpProcessingClient {
    session: HttpSession,
    mode: ProcessingMode,
    base_url: String,
    queue_url: String,
    api_key: Option<String>,
    status_interval: Duration,
}

impl HttpProcessingClient {
    pub fn new(session: HttpSession, config: &ProcessingConfig) -> Self {
        Self {
            session,
            mode: config.mode,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            queue_url: config.queue_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            status_interval: config.status_interval(),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(reqwest::header::AUTHORIZATION, format!("Key {}", key)),
            None => request,
        }
    }

    async fn read_json(endpoint: &str, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body = response.text().await?;
        if status.as_u16() >= 400 {
            tracing::error!(endpoint, status = status.as_u16(), "API call failed");
            return Err(Error::processing(endpoint, status.as_u16(), body));
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn call_sync(&self, endpoint: &str, arguments: &Value) -> Result<StageResult> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let request = self.session.client()?.post(url).json(arguments);
        let response = self.authorize(request).send().await?;
        let body = Self::read_json(endpoint, response).await?;
        StageResult::from_body(body, Vec::new())
    }

    async fn call_queued(&self, endpoint: &str, arguments: &Value) -> Result<StageResult> {
        let submit_url = format!("{}/{}", self.queue_url, endpoint);
        let request = self.session.client()?.post(&submit_url).json(arguments);
        let response = self.authorize(request).send().await?;
        let submission: QueueSubmission =
            serde_json::from_value(Self::read_json(endpoint, response).await?)?;
        tracing::debug!(endpoint, request_id = %submission.request_id, "request queued");

        let request_url = format!("{}/requests/{}", submit_url, submission.request_id);
        let status_url = submission
            .status_url
            .unwrap_or_else(|| format!("{}/status", request_url));
        let response_url = submission.response_url.unwrap_or(request_url);

        let mut logs = Vec::new();
        loop {
            let request = self
                .session
                .client()?
                .get(&status_url)
                .query(&[("logs", "1")]);
            let response = self.authorize(request).send().await?;
            let status: QueueStatus =
                serde_json::from_value(Self::read_json(endpoint, response).await?)?;

            // Each report carries the full log so far
            if let Some(latest) = status.logs {
                for line in latest.iter().skip(logs.len()) {
                    tracing::debug!(endpoint, message = %line.message, "progress");
                }
                logs = latest;
            }

            match status.status.as_str() {
                "COMPLETED" => break,
                "IN_QUEUE" | "IN_PROGRESS" => tokio::time::sleep(self.status_interval).await,
                other => {
                    return Err(Error::custom(format!(
                        "request {} to {} reported status {}",
                        submission.request_id, endpoint, other
                    )))
                }
            }
        }

        let request = self.session.client()?.get(&response_url);
        let response = self.authorize(request).send().await?;
        let body = Self::read_json(endpoint, response).await?;
        StageResult::from_body(body, logs)
    }
}

#[async_trait]
impl ProcessingClient for HttpProcessingClient {
    async fn call(&self, endpoint: &str, arguments: Value) -> Result<StageResult> {
        match self.mode {
            ProcessingMode::Sync => self.call_sync(endpoint, &arguments).await,
            ProcessingMode::Queue => self.call_queued(endpoint, &arguments).await,
        }
    }
}
