//! # Broker-driven image processing pipeline
//!
//! Images move through three stages, each bound to one broker topic:
//!
//! - **remove-background** (`remove-background-start`)
//! - **replace-background** (`replace-background-start`)
//! - **upscale** (`upscale-start`, terminal)
//!
//! ## Core Concepts
//!
//! - **AsyncPublisher**: publishes over a blocking producer without stalling the scheduler
//! - **TopicGates**: one bounded-concurrency gate per topic
//! - **StageHandler**: runs a stage's external call and forwards its output
//! - **PipelineConsumer**: polls, dispatches batches concurrently, tears down once
//!
//! Offsets are auto-committed by the broker, so delivery is at-most-once for
//! messages whose handler fails. Failed messages are logged and dropped.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pixelrelay::prelude::*;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<()> {
//!     let config = PipelineConfig::default();
//!     let connector = BrokerConnector::from_config(&config.broker)?;
//!     let consumer = PipelineConsumer::new(&config, &connector)?;
//!
//!     let shutdown = consumer.shutdown_handle();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.shutdown();
//!     });
//!
//!     consumer.run().await
//! }
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod gate;
pub mod ingress;
pub mod logging;
pub mod pool;
pub mod processing;
pub mod publisher;
pub mod stage;
pub mod telemetry;
pub mod topic;

// Re-export commonly used items
pub mod prelude {
    pub use crate::broker::{
        BlockingConsumer, BlockingProducer, BrokerConnector, MemoryBroker, Message,
    };
    pub use crate::config::PipelineConfig;
    pub use crate::consumer::{ConsumerState, PipelineConsumer, SharedResources, ShutdownHandle};
    pub use crate::error::{Error, Result};
    pub use crate::gate::TopicGates;
    pub use crate::pool::OffloadPool;
    pub use crate::processing::{
        HttpProcessingClient, HttpSession, ProcessingClient, StageResult,
    };
    pub use crate::publisher::{AsyncPublisher, PublishOutcome};
    pub use crate::stage::{Stage, StageHandler, StageModels, StageOutcome};
    pub use crate::topic::Topic;
}

// Re-export main error type
pub use error::{Error, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
