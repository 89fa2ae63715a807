//! Ad-exchange stream aggregator CLI
//!
//! Runs the windowed aggregation pipelines and inspects their configuration
//! and checkpoints.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use processor::config::{ProcessorConfig, StateBackend};
use processor::pipeline::{pipeline_name, AggregatorRuntime};
use processor::state::{CheckpointStorage, FileCheckpointStorage};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "adstream",
    version,
    about = "Windowed event counts for ad-exchange Kafka streams"
)]
struct Cli {
    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "ADSTREAM_CONFIG",
        value_name = "FILE",
        help = "Path to YAML configuration file"
    )]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text", env = "ADSTREAM_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the aggregation pipelines until interrupted
    #[command(name = "run", about = "Run the enabled pipelines")]
    Run,

    /// Validate and print the effective configuration
    #[command(name = "validate", about = "Validate the configuration")]
    Validate,

    /// List stored checkpoints per pipeline
    #[command(name = "checkpoints", about = "List checkpoints")]
    Checkpoints,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.log_format);

    let config = ProcessorConfig::load(cli.config.as_deref()).context("invalid configuration")?;

    match cli.command {
        Commands::Run => run_pipelines(config).await,
        Commands::Validate => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Checkpoints => list_checkpoints(&config).await,
    }
}

async fn run_pipelines(config: ProcessorConfig) -> anyhow::Result<()> {
    let runtime = AggregatorRuntime::new(config)?;
    let (stop_tx, stop_rx) = watch::channel(false);

    tokio::spawn(async move {
        let signal = shutdown_signal().await;
        info!(signal, "Shutdown signal received, stopping pipelines");
        let _ = stop_tx.send(true);
    });

    let report = runtime.run(stop_rx).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    let failed: Vec<_> = report.failures().map(|p| p.pipeline).collect();
    if !failed.is_empty() {
        anyhow::bail!("pipelines failed: {}", failed.join(", "));
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM with the name of the signal
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        signal = ctrl_c => signal,
        signal = terminate => signal,
    }
}

async fn list_checkpoints(config: &ProcessorConfig) -> anyhow::Result<()> {
    if config.state.backend == StateBackend::Memory {
        anyhow::bail!("the memory state backend keeps no checkpoints between runs");
    }
    let root = config
        .state
        .storage_path
        .as_ref()
        .context("state.storage_path is not set")?;

    for kind in config.pipelines.enabled() {
        let name = pipeline_name(kind);
        let storage = FileCheckpointStorage::new(root.join(name), config.state.checkpoint_retention);
        let checkpoints = storage
            .list()
            .await
            .with_context(|| format!("failed to list checkpoints of {}", name))?;

        println!("{} ({})", name, storage.dir().display());
        if checkpoints.is_empty() {
            println!("  no checkpoints");
        }
        for meta in checkpoints {
            println!(
                "  #{:<6} {}  windows={} pending={} bytes={}",
                meta.checkpoint_id,
                meta.created_at.to_rfc3339(),
                meta.entry_count,
                meta.pending_count,
                meta.size_bytes
            );
        }
    }
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            tracing_subscriber::EnvFilter::new("processor=debug,adstream_cli=debug,info")
        } else {
            tracing_subscriber::EnvFilter::new("info")
        }
    });

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}
