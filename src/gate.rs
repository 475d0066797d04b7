//! Per-topic concurrency gates.
//!
//! Each topic gets its own semaphore so a burst on one stage can never starve
//! or overload another. Callers past the limit wait for a free slot; there is
//! no timeout and no priority.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};
use crate::topic::Topic;

/// Default number of in-flight handler invocations per topic
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 5;

/// Bounded-concurrency gates keyed by [`Topic`].
#[derive(Debug, Clone)]
pub struct TopicGates {
    gates: [Arc<Semaphore>; 3],
    limit: usize,
}

/// A slot on one topic's gate. Released when dropped.
#[derive(Debug)]
pub struct GatePermit {
    topic: Topic,
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

impl TopicGates {
    /// Create gates allowing `limit` concurrent holders on every topic
    pub fn new(limit: usize) -> Self {
        Self {
            gates: std::array::from_fn(|_| Arc::new(Semaphore::new(limit))),
            limit,
        }
    }

    /// Wait for a slot on `topic`'s gate
    pub async fn acquire(&self, topic: Topic) -> Result<GatePermit> {
        let permit = self.gates[topic.index()]
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::custom(format!("gate for {} is closed", topic)))?;
        Ok(GatePermit {
            topic,
            _permit: permit,
        })
    }

    /// Number of permits currently held for `topic`
    pub fn in_flight(&self, topic: Topic) -> usize {
        self.limit - self.gates[topic.index()].available_permits()
    }

    /// The per-topic limit
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for TopicGates {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permits_are_counted_per_topic() {
        let gates = TopicGates::new(2);
        let a = gates.acquire(Topic::Upscale).await.unwrap();
        let _b = gates.acquire(Topic::Upscale).await.unwrap();
        assert_eq!(gates.in_flight(Topic::Upscale), 2);
        assert_eq!(gates.in_flight(Topic::RemoveBackground), 0);

        drop(a);
        assert_eq!(gates.in_flight(Topic::Upscale), 1);
    }

    #[tokio::test]
    async fn test_full_gate_blocks_only_its_topic() {
        let gates = TopicGates::new(1);
        let _held = gates.acquire(Topic::RemoveBackground).await.unwrap();

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            gates.acquire(Topic::RemoveBackground),
        )
        .await;
        assert!(blocked.is_err());

        let other = gates.acquire(Topic::ReplaceBackground).await.unwrap();
        assert_eq!(other.topic(), Topic::ReplaceBackground);
    }

    #[tokio::test]
    async fn test_permit_released_on_error_path() {
        let gates = TopicGates::new(1);

        async fn failing(gates: &TopicGates) -> Result<()> {
            let _permit = gates.acquire(Topic::Upscale).await?;
            Err(Error::custom("boom"))
        }

        assert!(failing(&gates).await.is_err());
        assert_eq!(gates.in_flight(Topic::Upscale), 0);
    }
}
