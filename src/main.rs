//! QA Pipeline - Main Entry Point
//!
//! `run` starts every stage consumer and serves health endpoints until
//! SIGINT/SIGTERM. `import` extracts units from the trace log for a window.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use qa_pipeline::config::PipelineConfig;
use qa_pipeline::importer::ImportRequest;
use qa_pipeline::observability::{health::HealthServer, init_logging, metrics::metrics, LogSettings};
use qa_pipeline::runtime::PipelineRuntime;
use qa_pipeline::trace::TimeWindow;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// QA annotation pipeline
#[derive(Parser)]
#[command(name = "qa-pipeline")]
#[command(about = "Extract QA units from agent traces and run them through annotation")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all pipeline stages until interrupted
    Run,
    /// Import units from the trace log for a time window
    Import {
        /// Window start (RFC 3339)
        #[arg(long)]
        start: DateTime<Utc>,
        /// Window end (RFC 3339)
        #[arg(long)]
        end: DateTime<Utc>,
        /// Only count what the window holds
        #[arg(long)]
        preview: bool,
        /// Skip each root's sub-calls
        #[arg(long)]
        no_sub_nodes: bool,
        /// Maximum units to publish
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(&LogSettings::from_env().with_verbosity(cli.verbose));

    info!("Starting QA pipeline v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config).await {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_pipeline(config).await,
        Commands::Import {
            start,
            end,
            preview,
            no_sub_nodes,
            limit,
        } => run_import(config, start, end, preview, no_sub_nodes, limit).await,
        Commands::Config { show } => handle_config_command(config, show).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

async fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(PipelineConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = vec!["pipeline.toml", "config/pipeline.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(PipelineConfig::load_from_file(&path)?);
                }
            }

            warn!("No configuration file found, using defaults");
            Ok(PipelineConfig::from_toml_str("")?)
        }
    }
}

async fn run_pipeline(config: PipelineConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Pipeline starting with instance ID: {}",
        config.runtime.instance_id
    );

    let collector = metrics();
    collector.set_pipeline_state("initializing");

    let mut runtime = PipelineRuntime::build(config.clone()).await?;

    let health_server = if config.runtime.health_port != 0 {
        let server = Arc::new(HealthServer::new(
            config.runtime.instance_id.clone(),
            config.runtime.health_port,
            runtime.health_checks(),
        ));
        tokio::spawn(server.clone().start(runtime.shutdown_signal()));
        Some(server)
    } else {
        None
    };

    runtime.start().await?;
    if let Some(server) = &health_server {
        server.set_mq_connected(true);
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Pipeline is running and consuming stage topics...");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    if let Some(server) = &health_server {
        server.set_mq_connected(false);
    }
    if let Err(e) = runtime.shutdown().await {
        error!("Error during shutdown: {}", e);
        return Err(e.into());
    }
    Ok(())
}

async fn run_import(
    config: PipelineConfig,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    preview: bool,
    no_sub_nodes: bool,
    limit: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = PipelineRuntime::build(config.clone()).await?;
    let importer = runtime.importer()?;

    let mut request = ImportRequest::new(TimeWindow::new(start, end)?, &config.importer);
    if no_sub_nodes {
        request.include_sub_nodes = false;
    }
    if let Some(limit) = limit {
        request.limit = limit;
    }

    if preview {
        let preview = importer.preview(&request).await?;
        println!("{}", serde_json::to_string_pretty(&preview)?);
        return Ok(());
    }

    if config.mq.backend == "memory" {
        warn!("Memory backend selected; imported units only live as long as this process");
    }
    if config.store.backend == "memory" {
        warn!("Memory task store selected; later imports cannot see what this run stored");
    }

    let queue = runtime.queue();
    queue.connect().await?;
    let result = importer.execute(&request).await;
    if let Err(e) = queue.disconnect().await {
        warn!("Queue disconnect failed: {}", e);
    }

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn handle_config_command(
    config: PipelineConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current pipeline configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
