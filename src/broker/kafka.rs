//! Kafka backend built on `rdkafka`.
//!
//! The consumer auto-commits on a fixed interval, so a polled message counts
//! as consumed whether or not its handler later succeeds.

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{BaseRecord, DeliveryResult, ProducerContext, ThreadedProducer};
use rdkafka::ClientContext;
use rdkafka::Message as _;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Mutex;
use std::time::Duration;

use super::{drain_records, BlockingConsumer, BlockingProducer, DeliveryReceipt, Message};
use crate::config::BrokerConfig;
use crate::error::{Error, Result};

/// Upper bound on records gathered by one poll
const MAX_POLL_RECORDS: usize = 500;

/// Connection settings shared by consumers and producers.
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub bootstrap_servers: String,
    pub auto_offset_reset: String,
    pub auto_commit_interval: Duration,
}

impl KafkaSettings {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            bootstrap_servers: config.bootstrap_servers.join(","),
            auto_offset_reset: config.auto_offset_reset.clone(),
            auto_commit_interval: config.auto_commit_interval(),
        }
    }
}

impl From<KafkaError> for Error {
    fn from(e: KafkaError) -> Self {
        Error::broker(e)
    }
}

/// A group member subscribed to the pipeline topics.
pub struct KafkaSubscription {
    consumer: Mutex<Option<BaseConsumer>>,
}

impl KafkaSubscription {
    pub fn connect(settings: &KafkaSettings, group_id: &str, topics: &[&str]) -> Result<Self> {
        let consumer: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", &settings.bootstrap_servers)
            .set("group.id", group_id)
            .set("auto.offset.reset", &settings.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                settings.auto_commit_interval.as_millis().to_string(),
            )
            .create()?;
        consumer.subscribe(topics)?;
        tracing::info!(group_id, ?topics, "subscribed to kafka topics");

        Ok(Self {
            consumer: Mutex::new(Some(consumer)),
        })
    }
}

impl BlockingConsumer for KafkaSubscription {
    fn poll(&self, timeout: Duration) -> Result<Vec<Message>> {
        let guard = self
            .consumer
            .lock()
            .map_err(|_| Error::broker("consumer lock poisoned"))?;
        let consumer = guard
            .as_ref()
            .ok_or_else(|| Error::broker("subscription is closed"))?;

        drain_records(timeout, MAX_POLL_RECORDS, |wait| {
            consumer.poll(wait).map(|polled| {
                polled.map_err(Error::from).map(|record| {
                    Message::new(record.topic(), record.payload().unwrap_or_default().to_vec())
                        .with_position(record.partition(), record.offset())
                })
            })
        })
    }

    fn close(&self) {
        if let Ok(mut guard) = self.consumer.lock() {
            if let Some(consumer) = guard.take() {
                consumer.unsubscribe();
            }
        }
    }
}

type DeliverySender = SyncSender<std::result::Result<(), String>>;

/// Routes each delivery report back to the receipt waiting for it.
pub struct ReceiptContext;

impl ClientContext for ReceiptContext {}

impl ProducerContext for ReceiptContext {
    type DeliveryOpaque = Box<DeliverySender>;

    fn delivery(&self, result: &DeliveryResult<'_>, opaque: Self::DeliveryOpaque) {
        let outcome = match result {
            Ok(_) => Ok(()),
            Err((e, _)) => Err(e.to_string()),
        };
        // The receipt may have timed out and gone away
        let _ = opaque.send(outcome);
    }
}

/// Producer whose delivery reports are served by a background thread.
pub struct KafkaProducer {
    producer: ThreadedProducer<ReceiptContext>,
}

impl KafkaProducer {
    pub fn connect(settings: &KafkaSettings) -> Result<Self> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", &settings.bootstrap_servers)
            .create_with_context(ReceiptContext)?;
        Ok(Self { producer })
    }
}

impl BlockingProducer for KafkaProducer {
    fn send(&self, topic: &str, payload: Vec<u8>) -> Result<Box<dyn DeliveryReceipt>> {
        let (tx, rx) = mpsc::sync_channel(1);
        let record: BaseRecord<'_, (), [u8], Box<DeliverySender>> =
            BaseRecord::with_opaque_to(topic, Box::new(tx)).payload(payload.as_slice());
        self.producer
            .send(record)
            .map_err(|(e, _)| Error::broker(e))?;
        Ok(Box::new(KafkaReceipt { rx }))
    }
}

struct KafkaReceipt {
    rx: Receiver<std::result::Result<(), String>>,
}

impl DeliveryReceipt for KafkaReceipt {
    fn wait(self: Box<Self>, timeout: Duration) -> Result<()> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => outcome.map_err(Error::Broker),
            Err(RecvTimeoutError::Timeout) => Err(Error::delivery_timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::broker("producer dropped the delivery report"))
            }
        }
    }
}
