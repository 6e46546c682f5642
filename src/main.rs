//! Meterflow CLI
//!
//! Windowed aggregation of smart meter batch files.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use meterflow::{
    checkpoint::{CheckpointStore, FileCheckpointStore},
    config::{parse_duration, Config},
    core::{Engine, EARLIEST},
    sink::JsonlSink,
    source::{BatchPoller, DirectorySource},
    stats::{create_shared_stats, StatsSnapshot},
    VERSION,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meterflow")]
#[command(version = VERSION)]
#[command(about = "Event-time windowed aggregation of smart meter batches", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume batch files and emit windowed aggregates
    Run(RunArgs),

    /// Show checkpoint and processing statistics
    Status,

    /// Show the effective configuration
    Config,
}

#[derive(Args)]
struct RunArgs {
    /// Directory that receives batch CSV files
    source: Option<PathBuf>,

    /// Directory where finalized windows are written
    sink: Option<PathBuf>,

    /// Directory for checkpoint state
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Minimum delay between polls (e.g. '30 seconds')
    #[arg(long, value_parser = duration_arg)]
    trigger_interval: Option<Duration>,

    /// Tumbling window length (e.g. '5 minutes')
    #[arg(long, value_parser = duration_arg)]
    window: Option<Duration>,

    /// Allowed lateness behind the latest event time (e.g. '2m')
    #[arg(long, value_parser = duration_arg)]
    lateness: Option<Duration>,

    /// Process the batches available now, then exit
    #[arg(long)]
    once: bool,
}

fn duration_arg(raw: &str) -> Result<Duration, String> {
    parse_duration(raw).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config_path = cli.config.clone().unwrap_or_else(Config::config_path);
    let config = Config::load_from(&config_path)
        .with_context(|| format!("could not load configuration from {config_path:?}"))?;

    match cli.command {
        Commands::Run(args) => cmd_run(config, args),
        Commands::Status => cmd_status(&config),
        Commands::Config => cmd_config(&config, &config_path),
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_run(mut config: Config, args: RunArgs) -> Result<()> {
    if let Some(source) = args.source {
        config.source_location = source;
    }
    if let Some(sink) = args.sink {
        config.sink_location = sink;
    }
    if let Some(checkpoint) = args.checkpoint {
        config.checkpoint_location = checkpoint;
    }
    if let Some(interval) = args.trigger_interval {
        config.trigger_interval = interval;
    }
    if let Some(window) = args.window {
        config.window_duration = window;
    }
    if let Some(lateness) = args.lateness {
        config.allowed_lateness = lateness;
    }

    let engine_config = config.engine_config().context("invalid configuration")?;
    config
        .ensure_directories()
        .context("could not create working directories")?;

    info!(
        version = VERSION,
        source = ?config.source_location,
        sink = ?config.sink_location,
        checkpoint = ?config.checkpoint_location,
        window_secs = config.window_duration.as_secs(),
        lateness_secs = config.allowed_lateness.as_secs(),
        "starting meterflow"
    );

    let stats = create_shared_stats(Some(config.stats_path()));
    let sink = JsonlSink::open(&config.sink_location)
        .with_context(|| format!("could not open sink in {:?}", config.sink_location))?;
    let checkpoints = FileCheckpointStore::new(&config.checkpoint_location);
    let mut engine = Engine::open(engine_config, sink, checkpoints, stats.clone())
        .context("could not start engine")?;
    info!(engine_id = %engine.id(), "engine ready");

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("could not install Ctrl+C handler")?;

    let mut poller = BatchPoller::start(
        DirectorySource::new(&config.source_location),
        engine.last_batch_id().map(str::to_string),
        config.poller_config(args.once),
        running.clone(),
    );

    // Cycles run to completion; the stop flag is only checked between them.
    let mut failure = None;
    while running.load(Ordering::SeqCst) {
        match poller.receiver().recv_timeout(Duration::from_millis(100)) {
            Ok(Ok(batch)) => {
                if let Err(e) = engine.process_batch(batch) {
                    failure = Some(e);
                    break;
                }
            }
            Ok(Err(e)) => warn!(error = %e, "batch source error, will retry on next poll"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("stopping");
    poller.stop();

    if let Err(e) = stats.save() {
        warn!(error = %e, "could not save stats");
    }
    info!("{}", stats.summary());

    if let Some(e) = failure {
        error!(error = %e, last_batch_id = ?engine.last_batch_id(), "halting on cycle failure");
        return Err(e).context("processing halted; restart resumes from the last checkpoint");
    }
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Meterflow Status");
    println!("================");
    println!();

    let store = FileCheckpointStore::new(&config.checkpoint_location);
    match store.load() {
        Ok(Some(checkpoint)) => {
            println!("Checkpoint: {:?}", store.path());
            println!(
                "  Last batch: {}",
                checkpoint.last_batch_id.as_deref().unwrap_or("(none)")
            );
            if checkpoint.watermark == EARLIEST {
                println!("  Watermark: (none)");
            } else {
                println!("  Watermark: {}", checkpoint.watermark.to_rfc3339());
            }
            println!("  Written at: {}", checkpoint.written_at.to_rfc3339());
            println!("  Open windows: {}", checkpoint.open_windows.len());
            for w in checkpoint.open_windows.iter().take(20) {
                println!(
                    "    {} [{} - {}) count={}",
                    w.device_id,
                    w.window_start.format("%Y-%m-%d %H:%M:%S"),
                    w.window_end.format("%H:%M:%S"),
                    w.count
                );
            }
            if checkpoint.open_windows.len() > 20 {
                println!("    ... and {} more", checkpoint.open_windows.len() - 20);
            }
        }
        Ok(None) => println!("No checkpoint found in {:?}.", config.checkpoint_location),
        Err(e) => bail!("checkpoint unreadable: {e}"),
    }
    println!();

    let stats_path = config.stats_path();
    if stats_path.exists() {
        let content = std::fs::read_to_string(&stats_path)
            .with_context(|| format!("could not read {stats_path:?}"))?;
        let stats: StatsSnapshot =
            serde_json::from_str(&content).with_context(|| format!("invalid {stats_path:?}"))?;
        println!("Cumulative Statistics:");
        println!("  Batches processed: {}", stats.batches_processed);
        println!(
            "  Records merged: {} ({} late)",
            stats.records_merged, stats.late_records_merged
        );
        println!("  Rows rejected: {}", stats.parse_errors);
        println!("  Late records dropped: {}", stats.dropped_late);
        println!("  Windows emitted: {}", stats.windows_emitted);
        println!("  Sink retries: {}", stats.sink_retries);
        println!("  Failed cycles: {}", stats.cycles_failed);
    } else {
        println!("No previous run statistics found.");
    }
    Ok(())
}

fn cmd_config(config: &Config, path: &std::path::Path) -> Result<()> {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {path:?}");
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
