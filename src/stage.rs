//! Pipeline stages and their handler.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::ProcessingConfig;
use crate::error::{Error, Result};
use crate::gate::TopicGates;
use crate::processing::{OutputShape, ProcessingClient, StageResult};
use crate::publisher::{AsyncPublisher, PublishOutcome};
use crate::topic::Topic;

/// One step of the image pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    RemoveBackground,
    ReplaceBackground,
    Upscale,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::RemoveBackground, Stage::ReplaceBackground, Stage::Upscale];

    /// The stage consuming `topic`
    pub const fn for_topic(topic: Topic) -> Self {
        match topic {
            Topic::RemoveBackground => Stage::RemoveBackground,
            Topic::ReplaceBackground => Stage::ReplaceBackground,
            Topic::Upscale => Stage::Upscale,
        }
    }

    /// Inbound topic
    pub const fn topic(self) -> Topic {
        match self {
            Stage::RemoveBackground => Topic::RemoveBackground,
            Stage::ReplaceBackground => Topic::ReplaceBackground,
            Stage::Upscale => Topic::Upscale,
        }
    }

    /// Where a successful result is forwarded; `None` for the terminal stage
    pub const fn next_topic(self) -> Option<Topic> {
        match self {
            Stage::RemoveBackground => Some(Topic::ReplaceBackground),
            Stage::ReplaceBackground => Some(Topic::Upscale),
            Stage::Upscale => None,
        }
    }

    pub const fn output_shape(self) -> OutputShape {
        match self {
            Stage::ReplaceBackground => OutputShape::Multi,
            Stage::RemoveBackground | Stage::Upscale => OutputShape::Single,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Stage::RemoveBackground => "remove-background",
            Stage::ReplaceBackground => "replace-background",
            Stage::Upscale => "upscale",
        }
    }
}

/// The model endpoint and fixed arguments of every stage.
#[derive(Debug, Clone)]
pub struct StageModels {
    remove_background: String,
    replace_background: String,
    replace_prompt: String,
    upscale: String,
}

impl StageModels {
    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self {
            remove_background: config.remove_background_model.clone(),
            replace_background: config.replace_background_model.clone(),
            replace_prompt: config.replace_background_prompt.clone(),
            upscale: config.upscale_model.clone(),
        }
    }

    pub fn endpoint(&self, stage: Stage) -> &str {
        match stage {
            Stage::RemoveBackground => &self.remove_background,
            Stage::ReplaceBackground => &self.replace_background,
            Stage::Upscale => &self.upscale,
        }
    }

    /// Request arguments for `image_url`; extras never depend on the message
    pub fn arguments(&self, stage: Stage, image_url: &str) -> Value {
        match stage {
            Stage::ReplaceBackground => json!({
                "image_url": image_url,
                "prompt": self.replace_prompt,
            }),
            Stage::RemoveBackground | Stage::Upscale => json!({ "image_url": image_url }),
        }
    }

    /// Run `stage` on `image_url` and extract the output URL
    pub async fn invoke(
        &self,
        processor: &dyn ProcessingClient,
        stage: Stage,
        image_url: &str,
    ) -> Result<(StageResult, String)> {
        let endpoint = self.endpoint(stage);
        let result = processor
            .call(endpoint, self.arguments(stage, image_url))
            .await?;
        let url = result
            .output_url(stage.output_shape())
            .ok_or_else(|| Error::MissingOutput {
                endpoint: endpoint.to_string(),
            })?
            .to_string();
        Ok((result, url))
    }
}

impl Default for StageModels {
    fn default() -> Self {
        Self::from_config(&ProcessingConfig::default())
    }
}

/// What a handled message led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The output was handed to the next stage's topic
    Forwarded {
        topic: Topic,
        url: String,
        publish: PublishOutcome,
    },
    /// The terminal stage produced the final image
    Completed { url: String },
}

/// Runs stages under their topic gates and forwards results.
#[derive(Clone)]
pub struct StageHandler {
    models: StageModels,
    processor: Arc<dyn ProcessingClient>,
    publisher: AsyncPublisher,
    gates: TopicGates,
}

impl StageHandler {
    pub fn new(
        models: StageModels,
        processor: Arc<dyn ProcessingClient>,
        publisher: AsyncPublisher,
        gates: TopicGates,
    ) -> Self {
        Self {
            models,
            processor,
            publisher,
            gates,
        }
    }

    /// Handle one image URL for `stage`.
    ///
    /// The gate permit covers the external call only and is released before
    /// the follow-on publish. Publishing is best effort.
    pub async fn handle(&self, stage: Stage, image_url: &str) -> Result<StageOutcome> {
        let (result, url) = {
            let _permit = self.gates.acquire(stage.topic()).await?;
            tracing::info!(stage = stage.name(), "calling stage");
            self.models
                .invoke(self.processor.as_ref(), stage, image_url)
                .await?
        };

        for line in &result.logs {
            tracing::debug!(stage = stage.name(), message = %line.message, "model log");
        }

        match stage.next_topic() {
            Some(topic) => {
                let publish = self.publisher.publish_best_effort(topic, &url).await;
                Ok(StageOutcome::Forwarded {
                    topic,
                    url,
                    publish,
                })
            }
            None => {
                tracing::info!(stage = stage.name(), url = %url, "pipeline completed");
                Ok(StageOutcome::Completed { url })
            }
        }
    }

    pub fn gates(&self) -> &TopicGates {
        &self.gates
    }

    pub fn models(&self) -> &StageModels {
        &self.models
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_chain() {
        assert_eq!(Stage::RemoveBackground.next_topic(), Some(Topic::ReplaceBackground));
        assert_eq!(Stage::ReplaceBackground.next_topic(), Some(Topic::Upscale));
        assert_eq!(Stage::Upscale.next_topic(), None);
        for stage in Stage::ALL {
            assert_eq!(Stage::for_topic(stage.topic()), stage);
        }
    }

    #[test]
    fn test_replace_background_attaches_fixed_prompt() {
        let models = StageModels::default();
        let args = models.arguments(Stage::ReplaceBackground, "https://x/a.png");
        assert_eq!(
            args,
            json!({"image_url": "https://x/a.png", "prompt": "marble surface"})
        );
        let args = models.arguments(Stage::Upscale, "https://x/a.png");
        assert_eq!(args, json!({"image_url": "https://x/a.png"}));
    }

    #[test]
    fn test_default_endpoints() {
        let models = StageModels::default();
        assert_eq!(models.endpoint(Stage::RemoveBackground), "fal-ai/birefnet/v2");
        assert_eq!(
            models.endpoint(Stage::ReplaceBackground),
            "fal-ai/bria/background/replace"
        );
        assert_eq!(models.endpoint(Stage::Upscale), "fal-ai/aura-sr");
    }
}
