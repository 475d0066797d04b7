//! Non-blocking publishing over a blocking broker producer.
//!
//! Both the send and the wait for the delivery report run on the offload
//! pool, so awaiting a publish never stalls the scheduler.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::{encode_value, BlockingProducer};
use crate::error::Result;
use crate::pool::OffloadPool;
use crate::topic::Topic;

/// Result of a best-effort publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker confirmed delivery
    Delivered,
    /// The publish failed; the failure was logged and not propagated
    Dropped,
}

/// Publishes JSON-encoded values to pipeline topics.
#[derive(Clone)]
pub struct AsyncPublisher {
    producer: Arc<dyn BlockingProducer>,
    pool: OffloadPool,
    delivery_timeout: Duration,
}

impl AsyncPublisher {
    pub fn new(
        producer: Arc<dyn BlockingProducer>,
        pool: OffloadPool,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            producer,
            pool,
            delivery_timeout,
        }
    }

    /// Publish `value` and wait for the delivery confirmation.
    ///
    /// Returns once the broker has confirmed the write, or with the first
    /// serialization, send or confirmation error.
    pub async fn publish<T: Serialize + ?Sized>(&self, topic: Topic, value: &T) -> Result<()> {
        let result = self.send_and_confirm(topic, value).await;
        crate::telemetry::record_publish(topic, result.is_ok());
        result
    }

    async fn send_and_confirm<T: Serialize + ?Sized>(&self, topic: Topic, value: &T) -> Result<()> {
        let payload = encode_value(value)?;

        let producer = self.producer.clone();
        let receipt = self
            .pool
            .run(move || producer.send(topic.as_str(), payload))
            .await??;

        let timeout = self.delivery_timeout;
        self.pool.run(move || receipt.wait(timeout)).await??;

        tracing::debug!(topic = %topic, "message delivered");
        Ok(())
    }

    /// Publish `value`, logging and swallowing any failure.
    ///
    /// Callers never see an error from this method; inspect the returned
    /// outcome when the difference matters.
    pub async fn publish_best_effort<T: Serialize + ?Sized>(
        &self,
        topic: Topic,
        value: &T,
    ) -> PublishOutcome {
        match self.publish(topic, value).await {
            Ok(()) => PublishOutcome::Delivered,
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "error sending message");
                PublishOutcome::Dropped
            }
        }
    }

    pub fn delivery_timeout(&self) -> Duration {
        self.delivery_timeout
    }
}
