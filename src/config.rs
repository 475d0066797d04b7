//! Runtime configuration.
//!
//! Every field has a default, so an empty (or missing) YAML file yields a
//! working local setup. CLI flags are applied on top by the binary.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::gate::DEFAULT_CONCURRENCY_LIMIT;
use crate::pool::DEFAULT_OFFLOAD_WORKERS;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub broker: BrokerConfig,
    pub consumer: ConsumerConfig,
    pub publisher: PublisherConfig,
    pub processing: ProcessingConfig,
    pub ingress: IngressConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// In-process broker, for local runs and tests
    Memory,
    /// Kafka cluster
    Kafka,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    pub bootstrap_servers: Vec<String>,
    /// Shared by every pipeline instance so deliveries fan out
    pub group_id: String,
    pub auto_offset_reset: String,
    pub auto_commit_interval_ms: u64,
}

impl BrokerConfig {
    pub fn auto_commit_interval(&self) -> Duration {
        Duration::from_millis(self.auto_commit_interval_ms)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Memory,
            bootstrap_servers: vec!["localhost:9092".to_string()],
            group_id: "data_processing_group".to_string(),
            auto_offset_reset: "earliest".to_string(),
            auto_commit_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// In-flight handler invocations allowed per topic
    pub concurrency_limit: usize,
    /// Blocking workers for broker calls
    pub offload_workers: usize,
    pub poll_timeout_ms: u64,
    /// Pause between polls
    pub idle_interval_ms: u64,
}

impl ConsumerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            offload_workers: DEFAULT_OFFLOAD_WORKERS,
            poll_timeout_ms: 1000,
            idle_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub delivery_timeout_ms: u64,
}

impl PublisherConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// Single blocking request per call
    Sync,
    /// Submit, poll status with logs, then fetch the result
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub mode: ProcessingMode,
    /// Base URL for `sync` mode
    pub base_url: String,
    /// Base URL for `queue` mode
    pub queue_url: String,
    pub api_key: Option<String>,
    pub status_interval_ms: u64,
    pub remove_background_model: String,
    pub replace_background_model: String,
    /// Style prompt attached to every replace-background call
    pub replace_background_prompt: String,
    pub upscale_model: String,
}

impl ProcessingConfig {
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            mode: ProcessingMode::Queue,
            base_url: "https://fal.run".to_string(),
            queue_url: "https://queue.fal.run".to_string(),
            api_key: None,
            status_interval_ms: 500,
            remove_background_model: "fal-ai/birefnet/v2".to_string(),
            replace_background_model: "fal-ai/bria/background/replace".to_string(),
            replace_background_prompt: "marble surface".to_string(),
            upscale_model: "fal-ai/aura-sr".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    pub host: String,
    pub port: u16,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl PipelineConfig {
    /// Parse configuration from YAML text
    pub fn from_yaml(contents: &str) -> Result<Self> {
        // serde_yaml rejects an empty document for a struct
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Check invariants the pipeline relies on
    pub fn validate(&self) -> Result<()> {
        if self.consumer.concurrency_limit == 0 {
            return Err(Error::config("consumer.concurrency_limit must be at least 1"));
        }
        if self.consumer.offload_workers == 0 {
            return Err(Error::config("consumer.offload_workers must be at least 1"));
        }
        if self.broker.group_id.trim().is_empty() {
            return Err(Error::config("broker.group_id must not be empty"));
        }
        if self.broker.backend == BrokerBackend::Kafka && self.broker.bootstrap_servers.is_empty()
        {
            return Err(Error::config("broker.bootstrap_servers must not be empty"));
        }
        let models = [
            ("remove_background_model", &self.processing.remove_background_model),
            ("replace_background_model", &self.processing.replace_background_model),
            ("upscale_model", &self.processing.upscale_model),
        ];
        for (name, endpoint) in models {
            if endpoint.trim().is_empty() {
                return Err(Error::config(format!("processing.{} must not be empty", name)));
            }
        }
        Ok(())
    }
}
