//! Keystats Monitor - keystroke usage aggregation and delivery.
//!
//! This binary finalizes keystroke aggregates produced by an editor integration
//! and delivers them to the ingestion API.
//!
//! # Commands
//!
//! - `keystats-monitor submit [--now]`: Finalize an aggregate read from stdin
//! - `keystats-monitor flush`: Send all stored payloads once
//! - `keystats-monitor status`: Show the pending store
//! - `keystats-monitor run`: Drain the pending store periodically
//!
//! # Environment Variables
//!
//! See the [`config`] module for available configuration options.

use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use keystats_monitor::accumulator::FileTimeAccumulator;
use keystats_monitor::batcher::PayloadBatcher;
use keystats_monitor::clock::{Clock, SystemClock};
use keystats_monitor::config::Config;
use keystats_monitor::error::MonitorError;
use keystats_monitor::finalizer::PayloadFinalizer;
use keystats_monitor::keystrokes::KeystrokeStats;
use keystats_monitor::queue::EventHandler;
use keystats_monitor::sender::{RetryPolicy, Sender, SenderConfig};
use keystats_monitor::store::PayloadStore;
use keystats_monitor::tracker::SessionTracker;
use keystats_monitor::types::EnvironmentTags;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Keystats Monitor - keystroke usage aggregation and delivery.
///
/// Finalizes keystroke aggregates from an editor integration and delivers
/// them to the ingestion API, buffering locally until acknowledged.
#[derive(Parser, Debug)]
#[command(name = "keystats-monitor")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    KEYSTATS_API_URL                 Ingestion API URL (required)
    KEYSTATS_API_TOKEN               Bearer token
    KEYSTATS_DATA_DIR                Data directory (default: ~/.keystats)
    KEYSTATS_PLUGIN_ID               Plugin id stamped on payloads (default: 2)
    KEYSTATS_BATCH_INTERVAL_SECS     Seconds between drains (default: 60)
    KEYSTATS_RETRY_LIMIT             Send attempts per batch, 1-10 (default: 3)
    KEYSTATS_SESSION_THRESHOLD_SECS  New-session gap (default: 900)

EXAMPLES:
    # Store an aggregate for batched delivery
    keystats-monitor submit < window.json

    # Send an aggregate right away
    keystats-monitor submit --now < window.json

    # Drain stored payloads every minute
    export KEYSTATS_API_URL=https://api.example.com
    keystats-monitor run
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Finalize a keystroke aggregate read from stdin as JSON.
    ///
    /// The aggregate is stored for batched delivery unless --now is given.
    Submit {
        /// Send immediately instead of storing (single attempt).
        #[arg(long)]
        now: bool,
    },

    /// Send all stored payloads once.
    Flush,

    /// Show how many payloads are waiting for delivery.
    Status,

    /// Drain stored payloads periodically until interrupted.
    Run,
}

/// Components assembled from configuration.
struct Pipeline {
    config: Config,
    clock: Arc<SystemClock>,
    store: Arc<PayloadStore>,
    sender: Sender,
}

impl Pipeline {
    async fn build() -> keystats_monitor::Result<Self> {
        let config = Config::from_env()?;
        debug!(
            api_url = %config.api_url,
            data_dir = %config.data_dir.display(),
            "Configuration loaded"
        );

        let store = PayloadStore::open(config.pending_path()).await?;

        let retry_policy =
            RetryPolicy::default().with_max_attempts(u32::from(config.retry_limit));
        let sender_config = SenderConfig::new(config.api_url.clone(), config.api_token.clone())
            .with_retry_policy(retry_policy);

        Ok(Self {
            clock: Arc::new(SystemClock::new()),
            store: Arc::new(store),
            sender: Sender::new(sender_config),
            config,
        })
    }

    fn batcher(&self) -> PayloadBatcher {
        PayloadBatcher::new(self.store.clone(), self.sender.clone())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(run(cli.command))
}

/// Loads configuration, assembles the pipeline and runs one command.
async fn run(command: Command) -> Result<()> {
    let pipeline = Pipeline::build()
        .await
        .context("Failed to initialize monitor")?;

    match command {
        Command::Submit { now } => run_submit(&pipeline, now).await,
        Command::Flush => run_flush(&pipeline)
            .await
            .context("Failed to send stored payloads"),
        Command::Status => run_status(&pipeline)
            .await
            .context("Failed to read pending store"),
        Command::Run => run_drain(&pipeline).await,
    }
}

/// Reads a keystroke aggregate JSON document from stdin.
fn read_aggregate() -> keystats_monitor::Result<KeystrokeStats> {
    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;
    Ok(serde_json::from_str(&input)?)
}

/// Reads an aggregate from stdin and posts it.
async fn run_submit(pipeline: &Pipeline, send_now: bool) -> Result<()> {
    let mut stats = read_aggregate().context("Failed to read keystroke aggregate")?;

    stats.fill_missing_tags(&EnvironmentTags::current(pipeline.config.plugin_id));
    if stats.start == 0 {
        let now = pipeline.clock.now();
        stats.start = now.now_in_sec;
        stats.local_start = now.local_now_in_sec;
    }

    if !stats.has_data() {
        info!("Aggregate has no keystroke data, nothing to send");
        return Ok(());
    }

    let handler = Arc::new(EventHandler::new(
        pipeline.sender.clone(),
        pipeline.store.clone(),
    ));
    let clock: Arc<dyn Clock> = pipeline.clock.clone();
    let finalizer = PayloadFinalizer::new(
        clock.clone(),
        Arc::new(FileTimeAccumulator::new(
            pipeline.config.time_data_path(),
            clock.clone(),
        )),
        Arc::new(SessionTracker::open(
            pipeline.config.session_path(),
            clock,
            pipeline.config.session_threshold_secs,
        )),
        handler.clone(),
    );

    let payload = finalizer
        .post_data(&stats, send_now)
        .await
        .context("Failed to post keystroke payload")?;

    info!(
        keystrokes = payload.keystrokes,
        files = payload.source.len(),
        project = %payload.project.name,
        send_now,
        "Payload posted"
    );

    let unfinished = handler
        .shutdown(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS))
        .await;
    if unfinished > 0 {
        error!(unfinished, "Immediate send did not complete");
    }
    Ok(())
}

/// Sends all stored payloads once.
async fn run_flush(pipeline: &Pipeline) -> Result<(), MonitorError> {
    let sent = pipeline.batcher().flush().await?;
    println!("Sent {sent} payload(s)");
    Ok(())
}

/// Prints the pending store summary.
async fn run_status(pipeline: &Pipeline) -> Result<(), MonitorError> {
    let pending = pipeline.store.len().await?;
    println!("Pending payloads: {pending}");
    println!("Store: {}", pipeline.store.path().display());
    Ok(())
}

/// Drains the store until a shutdown signal arrives.
async fn run_drain(pipeline: &Pipeline) -> Result<()> {
    let interval = Duration::from_secs(pipeline.config.batch_interval_secs);
    info!(
        interval_secs = pipeline.config.batch_interval_secs,
        store = %pipeline.store.path().display(),
        "Monitor running. Press Ctrl+C to stop."
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let drain = tokio::spawn(pipeline.batcher().run(interval, async move {
        let _ = shutdown_rx.await;
    }));

    wait_for_shutdown().await;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());

    // Bound the final flush.
    if tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), drain)
        .await
        .is_err()
    {
        error!("Timeout while flushing stored payloads during shutdown");
    }

    info!("Monitor stopped");
    Ok(())
}

/// Initializes the logging subsystem.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .with_level(true)
        .init();
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
