//! The pipeline consumer: poll loop, topic-keyed dispatch and teardown.
//!
//! Lifecycle is `Initializing -> Running -> Draining -> Stopped`. Offsets
//! are committed by the broker on its own schedule, not after a handler
//! succeeds, so a message whose handler fails is not redelivered.

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::broker::{BlockingConsumer, BrokerConnector, Message};
use crate::config::{ConsumerConfig, PipelineConfig};
use crate::error::{Error, Result};
use crate::gate::TopicGates;
use crate::pool::OffloadPool;
use crate::processing::{HttpProcessingClient, HttpSession, ProcessingClient};
use crate::publisher::{AsyncPublisher, PublishOutcome};
use crate::stage::{Stage, StageHandler, StageModels, StageOutcome};
use crate::telemetry::{self, DispatchOutcome};
use crate::topic::Topic;

/// Lifecycle of a [`PipelineConsumer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Initializing,
    Running,
    Draining,
    Stopped,
}

/// Requests a graceful stop. Cloneable; repeated calls are harmless.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// The HTTP session and offload pool shared by every handler.
#[derive(Debug, Clone)]
pub struct SharedResources {
    session: HttpSession,
    pool: OffloadPool,
}

impl SharedResources {
    pub fn new(offload_workers: usize) -> Result<Self> {
        Ok(Self {
            session: HttpSession::new()?,
            pool: OffloadPool::new(offload_workers),
        })
    }

    pub fn from_parts(session: HttpSession, pool: OffloadPool) -> Self {
        Self { session, pool }
    }

    pub fn session(&self) -> &HttpSession {
        &self.session
    }

    pub fn pool(&self) -> &OffloadPool {
        &self.pool
    }
}

/// Per-outcome counts for one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub forwarded: usize,
    pub publish_dropped: usize,
    pub completed: usize,
    pub failed: usize,
    pub unroutable: usize,
}

impl BatchSummary {
    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Forwarded => self.forwarded += 1,
            DispatchOutcome::PublishDropped => self.publish_dropped += 1,
            DispatchOutcome::Completed => self.completed += 1,
            DispatchOutcome::Failed => self.failed += 1,
            DispatchOutcome::Unroutable => self.unroutable += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.forwarded + self.publish_dropped + self.completed + self.failed + self.unroutable
    }
}

/// Consumes every pipeline topic and dispatches messages to their stage.
pub struct PipelineConsumer {
    subscription: Arc<dyn BlockingConsumer>,
    resources: SharedResources,
    handler: StageHandler,
    poll_timeout: Duration,
    idle_interval: Duration,
    shutdown: CancellationToken,
    state: watch::Sender<ConsumerState>,
    torn_down: AtomicBool,
}

impl PipelineConsumer {
    /// Set up shared resources and subscribe, calling models over HTTP
    pub fn new(config: &PipelineConfig, connector: &BrokerConnector) -> Result<Self> {
        let resources = SharedResources::new(config.consumer.offload_workers)?;
        let processor = Arc::new(HttpProcessingClient::new(
            resources.session().clone(),
            &config.processing,
        ));
        Self::with_processor(config, connector, resources, processor)
    }

    /// Set up with a caller-supplied processing client
    pub fn with_processor(
        config: &PipelineConfig,
        connector: &BrokerConnector,
        resources: SharedResources,
        processor: Arc<dyn ProcessingClient>,
    ) -> Result<Self> {
        config.validate()?;
        let subscription = connector.subscribe(&config.broker.group_id, &Topic::names())?;
        let publisher = AsyncPublisher::new(
            connector.producer()?,
            resources.pool().clone(),
            config.publisher.delivery_timeout(),
        );
        let handler = StageHandler::new(
            StageModels::from_config(&config.processing),
            processor,
            publisher,
            TopicGates::new(config.consumer.concurrency_limit),
        );
        tracing::info!(
            group_id = %config.broker.group_id,
            concurrency_limit = config.consumer.concurrency_limit,
            "pipeline consumer initialized"
        );
        Ok(Self::from_parts(subscription, resources, handler, &config.consumer))
    }

    /// Assemble from already-built pieces
    pub fn from_parts(
        subscription: Arc<dyn BlockingConsumer>,
        resources: SharedResources,
        handler: StageHandler,
        settings: &ConsumerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Initializing);
        Self {
            subscription,
            resources,
            handler,
            poll_timeout: settings.poll_timeout(),
            idle_interval: settings.idle_interval(),
            shutdown: CancellationToken::new(),
            state,
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn handler(&self) -> &StageHandler {
        &self.handler
    }

    /// Run the poll loop until shutdown or a poll failure, then tear down.
    ///
    /// Returns the poll error that ended the loop, if any. A consumer runs
    /// once; later calls fail with [`Error::Stopped`].
    pub async fn run(&self) -> Result<()> {
        let started = self.state.send_if_modified(|state| {
            if *state == ConsumerState::Initializing {
                *state = ConsumerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(Error::Stopped);
        }

        tracing::info!("starting data processing service");
        let result = self.consume().await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "consumer error");
        }
        self.teardown();
        result
    }

    async fn consume(&self) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let batch = self.poll_batch().await?;
            if !batch.is_empty() {
                let summary = self.process_batch(batch).await;
                tracing::debug!(?summary, "batch processed");
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.idle_interval) => {}
            }
        }
        tracing::info!("shutdown requested");
        Ok(())
    }

    /// Poll once on the offload pool; the backend flattens partitions
    async fn poll_batch(&self) -> Result<Vec<Message>> {
        let subscription = self.subscription.clone();
        let timeout = self.poll_timeout;
        self.resources
            .pool()
            .run(move || subscription.poll(timeout))
            .await?
    }

    /// Dispatch every message of `batch` concurrently and wait for all of them.
    ///
    /// Failures stay inside their own dispatch. Once the consumer has been
    /// torn down the batch is dropped untouched.
    pub async fn process_batch(&self, batch: Vec<Message>) -> BatchSummary {
        let mut summary = BatchSummary::default();
        if self.torn_down.load(Ordering::SeqCst) {
            tracing::warn!(size = batch.len(), "consumer stopped, dropping batch");
            return summary;
        }

        let outcomes = join_all(batch.iter().map(|message| self.dispatch(message))).await;
        for outcome in outcomes {
            summary.record(outcome);
        }
        summary
    }

    async fn dispatch(&self, message: &Message) -> DispatchOutcome {
        let value = String::from_utf8_lossy(message.payload());
        tracing::info!(topic = message.topic(), value = %value, "processing message");

        let outcome = match message.topic().parse::<Topic>() {
            Ok(topic) => self.dispatch_to(Stage::for_topic(topic), message).await,
            Err(_) => {
                tracing::warn!(topic = message.topic(), "no handler defined for topic");
                DispatchOutcome::Unroutable
            }
        };
        telemetry::record_dispatch(message.topic(), outcome);
        outcome
    }

    async fn dispatch_to(&self, stage: Stage, message: &Message) -> DispatchOutcome {
        let image_url = match message.decode_value() {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(topic = message.topic(), error = %e, "undecodable payload");
                return DispatchOutcome::Failed;
            }
        };

        match self.handler.handle(stage, &image_url).await {
            Ok(StageOutcome::Forwarded {
                publish: PublishOutcome::Delivered,
                ..
            }) => DispatchOutcome::Forwarded,
            Ok(StageOutcome::Forwarded {
                publish: PublishOutcome::Dropped,
                ..
            }) => DispatchOutcome::PublishDropped,
            Ok(StageOutcome::Completed { .. }) => DispatchOutcome::Completed,
            Err(e) => {
                tracing::error!(
                    topic = message.topic(),
                    value = %image_url,
                    error = %e,
                    "handler error"
                );
                DispatchOutcome::Failed
            }
        }
    }

    /// Release shared resources: HTTP session, then subscription, then pool.
    ///
    /// Runs at most once; returns `true` for the call that did the work.
    pub fn teardown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.cancel();
        self.state.send_replace(ConsumerState::Draining);

        self.resources.session().close();
        self.subscription.close();
        self.resources.pool().shutdown();

        self.state.send_replace(ConsumerState::Stopped);
        tracing::info!("pipeline consumer stopped");
        true
    }
}

impl Drop for PipelineConsumer {
    fn drop(&mut self) {
        self.teardown();
    }
}
