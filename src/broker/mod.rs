//! Broker boundary.
//!
//! The pipeline only needs a blocking consumer that polls batches and a
//! blocking producer whose sends can be confirmed. Offset storage, partition
//! assignment and delivery guarantees belong to the broker itself.

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BrokerBackend, BrokerConfig};
use crate::error::{Error, Result};

pub use memory::{MemoryBroker, MemorySubscription};

/// A record received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    partition: i32,
    offset: i64,
    payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset: 0,
            payload,
        }
    }

    /// Build a message whose payload is `value` encoded as JSON
    pub fn json<T: Serialize + ?Sized>(topic: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::new(topic, encode_value(value)?))
    }

    pub fn with_position(mut self, partition: i32, offset: i64) -> Self {
        self.partition = partition;
        self.offset = offset;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload as a JSON string (the image URL)
    pub fn decode_value(&self) -> Result<String> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Encode a value into the UTF-8 JSON bytes the broker carries
pub fn encode_value<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Gather one batch from a client that yields one record per call.
///
/// Only the first call waits up to `timeout`; later calls take what is
/// already buffered. An error after some records were gathered ends the batch
/// early and those records are returned, because their offsets are already
/// stored. An error before any record is returned as is.
#[cfg_attr(not(feature = "kafka"), allow(dead_code))]
pub(crate) fn drain_records<F>(
    timeout: Duration,
    max_records: usize,
    mut next: F,
) -> Result<Vec<Message>>
where
    F: FnMut(Duration) -> Option<Result<Message>>,
{
    let mut batch = Vec::new();
    let mut wait = timeout;
    while batch.len() < max_records {
        match next(wait) {
            Some(Ok(message)) => {
                batch.push(message);
                wait = Duration::ZERO;
            }
            Some(Err(e)) if batch.is_empty() => return Err(e),
            Some(Err(e)) => {
                tracing::warn!(
                    error = %e,
                    gathered = batch.len(),
                    "poll failed mid-batch, dispatching what was gathered"
                );
                break;
            }
            None => break,
        }
    }
    Ok(batch)
}

/// A broker subscription with a blocking poll.
///
/// Offsets are committed by the broker independently of how the polled
/// messages are later handled.
pub trait BlockingConsumer: Send + Sync + 'static {
    /// Wait up to `timeout` for new messages on any subscribed topic
    fn poll(&self, timeout: Duration) -> Result<Vec<Message>>;

    /// Leave the consumer group and release the connection
    fn close(&self);
}

/// A broker producer with a blocking send.
pub trait BlockingProducer: Send + Sync + 'static {
    /// Hand a payload to the client for delivery
    fn send(&self, topic: &str, payload: Vec<u8>) -> Result<Box<dyn DeliveryReceipt>>;
}

/// Pending confirmation for one sent payload.
pub trait DeliveryReceipt: Send + 'static {
    /// Block until the broker confirms delivery or `timeout` elapses
    fn wait(self: Box<Self>, timeout: Duration) -> Result<()>;
}

/// Receipt for a delivery that is already settled.
#[derive(Debug)]
pub struct SettledReceipt(pub(crate) std::result::Result<(), String>);

impl DeliveryReceipt for SettledReceipt {
    fn wait(self: Box<Self>, _timeout: Duration) -> Result<()> {
        self.0.map_err(Error::Broker)
    }
}

/// Opens consumers and producers for the configured backend.
#[derive(Clone)]
pub enum BrokerConnector {
    Memory(MemoryBroker),
    #[cfg(feature = "kafka")]
    Kafka(kafka::KafkaSettings),
}

impl BrokerConnector {
    /// Select a backend from configuration.
    ///
    /// The memory backend is process-local, so `serve` and `consume` must run
    /// in the same process to talk to each other.
    pub fn from_config(config: &BrokerConfig) -> Result<Self> {
        match config.backend {
            BrokerBackend::Memory => {
                tracing::warn!(
                    "memory broker retains every record in process; development use only"
                );
                Ok(BrokerConnector::Memory(MemoryBroker::new()))
            }
            #[cfg(feature = "kafka")]
            BrokerBackend::Kafka => Ok(BrokerConnector::Kafka(kafka::KafkaSettings::from_config(
                config,
            ))),
            #[cfg(not(feature = "kafka"))]
            BrokerBackend::Kafka => Err(Error::config(
                "the kafka backend requires building with the `kafka` feature",
            )),
        }
    }

    /// Subscribe to `topics` under `group_id`
    pub fn subscribe(&self, group_id: &str, topics: &[&str]) -> Result<Arc<dyn BlockingConsumer>> {
        match self {
            BrokerConnector::Memory(broker) => {
                let subscription: Arc<dyn BlockingConsumer> = broker.subscribe(group_id, topics);
                Ok(subscription)
            }
            #[cfg(feature = "kafka")]
            BrokerConnector::Kafka(settings) => {
                let subscription: Arc<dyn BlockingConsumer> =
                    Arc::new(kafka::KafkaSubscription::connect(settings, group_id, topics)?);
                Ok(subscription)
            }
        }
    }

    pub fn producer(&self) -> Result<Arc<dyn BlockingProducer>> {
        let producer: Arc<dyn BlockingProducer> = match self {
            BrokerConnector::Memory(broker) => Arc::new(broker.clone()),
            #[cfg(feature = "kafka")]
            BrokerConnector::Kafka(settings) => Arc::new(kafka::KafkaProducer::connect(settings)?),
        };
        Ok(producer)
    }
}
