//! pixelrelay - image pipeline consumer and ingress

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use pixelrelay::broker::BrokerConnector;
use pixelrelay::config::{BrokerBackend, PipelineConfig, ProcessingMode};
use pixelrelay::consumer::PipelineConsumer;
use pixelrelay::ingress::{self, IngressState};
use pixelrelay::logging::init_logging;
use pixelrelay::pool::OffloadPool;
use pixelrelay::processing::{HttpProcessingClient, HttpSession};
use pixelrelay::publisher::AsyncPublisher;
use pixelrelay::stage::StageModels;
use pixelrelay::Result;

#[derive(Parser, Debug)]
#[command(name = "pixelrelay")]
#[command(about = "Staged image processing over a message broker", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, env = "PIXELRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Broker backend
    #[arg(long, global = true, value_enum)]
    broker: Option<BrokerBackend>,

    /// Comma-separated broker addresses
    #[arg(long, global = true, value_delimiter = ',')]
    bootstrap_servers: Option<Vec<String>>,

    /// Consumer group shared by all pipeline instances
    #[arg(long, global = true)]
    group_id: Option<String>,

    /// In-flight handler invocations allowed per topic
    #[arg(long, global = true)]
    concurrency_limit: Option<usize>,

    /// API key for the processing service
    #[arg(long, global = true, env = "FAL_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// How processing calls are made
    #[arg(long, global = true, value_enum)]
    processing_mode: Option<ProcessingMode>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume the pipeline topics and run the stages
    Consume,
    /// Serve the HTTP ingress
    Serve(ServeArgs),
    /// Run the ingress and the consumer in one process
    Run(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Port to bind
    #[arg(long)]
    port: Option<u16>,
}

impl Cli {
    fn load_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_file(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(backend) = self.broker {
            config.broker.backend = backend;
        }
        if let Some(servers) = &self.bootstrap_servers {
            config.broker.bootstrap_servers = servers.clone();
        }
        if let Some(group_id) = &self.group_id {
            config.broker.group_id = group_id.clone();
        }
        if let Some(limit) = self.concurrency_limit {
            config.consumer.concurrency_limit = limit;
        }
        if let Some(key) = &self.api_key {
            config.processing.api_key = Some(key.clone());
        }
        if let Some(mode) = self.processing_mode {
            config.processing.mode = mode;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.log_json {
            config.logging.json = true;
        }
        if let Command::Serve(args) | Command::Run(args) = &self.command {
            if let Some(host) = &args.host {
                config.ingress.host = host.clone();
            }
            if let Some(port) = args.port {
                config.ingress.port = port;
            }
        }

        config.validate()?;
        Ok(config)
    }
}

fn ingress_state(config: &PipelineConfig, connector: &BrokerConnector) -> Result<IngressState> {
    let publisher = AsyncPublisher::new(
        connector.producer()?,
        OffloadPool::new(config.consumer.offload_workers),
        config.publisher.delivery_timeout(),
    );
    let processor = HttpProcessingClient::new(HttpSession::new()?, &config.processing);
    Ok(IngressState::new(
        publisher,
        Arc::new(processor),
        StageModels::from_config(&config.processing),
    ))
}

async fn execute(command: Command, config: PipelineConfig) -> Result<()> {
    let connector = BrokerConnector::from_config(&config.broker)?;
    let stop = CancellationToken::new();
    let on_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received");
        }
        on_signal.cancel();
    });

    match command {
        Command::Consume => {
            let consumer = PipelineConsumer::new(&config, &connector)?;
            let shutdown = consumer.shutdown_handle();
            tokio::spawn(async move {
                stop.cancelled().await;
                shutdown.shutdown();
            });
            consumer.run().await
        }
        Command::Serve(_) => {
            let state = ingress_state(&config, &connector)?;
            ingress::serve(&config.ingress, state, async move { stop.cancelled().await }).await
        }
        Command::Run(_) => {
            let consumer = PipelineConsumer::new(&config, &connector)?;
            let state = ingress_state(&config, &connector)?;

            let shutdown = consumer.shutdown_handle();
            let watch_stop = stop.clone();
            tokio::spawn(async move {
                watch_stop.cancelled().await;
                shutdown.shutdown();
            });

            let serve_stop = stop.clone();
            let served = async {
                let result = ingress::serve(&config.ingress, state, async move {
                    serve_stop.cancelled().await
                })
                .await;
                stop.cancel();
                result
            };

            let consumed = async {
                let result = consumer.run().await;
                stop.cancel();
                result
            };

            let (consumed, served) = tokio::join!(consumed, served);
            consumed.and(served)
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.logging);

    match execute(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "pixelrelay exited with an error");
            ExitCode::FAILURE
        }
    }
}
