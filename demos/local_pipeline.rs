//! Run all three stages against the in-memory broker with a stand-in model runner.
//!
//! ```sh
//! cargo run --example local_pipeline
//! ```

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use pixelrelay::config::{LoggingConfig, PipelineConfig};
use pixelrelay::logging::init_logging;
use pixelrelay::prelude::*;

/// Appends the model name to the image URL after a short delay
struct StandInRunner;

#[async_trait]
impl ProcessingClient for StandInRunner {
    async fn call(&self, endpoint: &str, arguments: Value) -> Result<StageResult> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let url = format!(
            "{}+{}",
            arguments["image_url"].as_str().unwrap_or_default(),
            endpoint.rsplit('/').next().unwrap_or(endpoint)
        );
        StageResult::from_body(
            json!({"image": {"url": url}, "images": [{"url": url}]}),
            Vec::new(),
        )
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_logging(&LoggingConfig {
        level: "info".to_string(),
        json: false,
    });

    let config = PipelineConfig::default();
    let broker = MemoryBroker::new();
    let connector = BrokerConnector::Memory(broker.clone());
    let resources = SharedResources::new(config.consumer.offload_workers)?;
    let consumer =
        PipelineConsumer::with_processor(&config, &connector, resources, Arc::new(StandInRunner))?;

    let ingress = AsyncPublisher::new(
        connector.producer()?,
        OffloadPool::new(2),
        config.publisher.delivery_timeout(),
    );
    let images = ["https://x/cat.png", "https://x/dog.png", "https://x/owl.png"];

    let shutdown = consumer.shutdown_handle();
    let driver = async {
        for image in images {
            ingress.publish(Topic::RemoveBackground, image).await?;
        }
        while broker.published(Topic::Upscale.as_str()).len() < images.len() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Give the upscale stage time to finish the last call
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.shutdown();
        Ok::<_, Error>(())
    };

    let (consumed, driven) = tokio::join!(consumer.run(), driver);
    consumed?;
    driven?;

    for url in broker.published_values(Topic::Upscale.as_str()) {
        println!("upscaled from {}", url);
    }
    Ok(())
}
