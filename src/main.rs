//! Driftsync - Distributed File Synchronization Coordinator
//!
//! Accepts uploads from registered nodes, replicates versions across the
//! fleet with delta synchronization, and audits everything under vector
//! clocks.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use driftsync::api::HttpServer;
use driftsync::config::CoordinatorConfig;
use driftsync::coordinator::Coordinator;
use driftsync::error::Result;

/// Driftsync - Distributed File Synchronization Coordinator
#[derive(Parser)]
#[command(name = "driftsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "driftsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "driftsync.toml")]
        output: PathBuf,

        /// Coordinator node id
        #[arg(long, default_value = "coordinator-1")]
        node_id: String,
    },

    /// Validate a configuration file
    Validate,

    /// Show the effective configuration
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the coordinator
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting driftsync coordinator...");

    let config = match CoordinatorConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(
                "Failed to load configuration from {:?}: {}",
                config_path,
                error
            );
            tracing::error!("Check that the config file exists and is valid TOML");
            return Err(error);
        }
    };

    let coordinator = Coordinator::new(config.clone()).await?;
    let monitor = coordinator.spawn_monitor();

    let server = HttpServer::new(config.api.clone(), coordinator.clone());
    let outcome = tokio::select! {
        result = server.start() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            Ok(())
        }
    };

    coordinator.shutdown();
    monitor.abort();
    outcome
}

/// Write a starter configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let template = format!(
        r#"[node]
id = "{node_id}"
data_dir = "./driftsync-data"

[storage]
chunk_size = 4096

[sync]
heartbeat_interval_ms = 5000
node_offline_after_ms = 15000
session_deadline_ms = 300000
chunk_deadline_ms = 30000
max_sessions_per_target = 1
max_sessions_total = 16

[api]
enabled = true
bind_address = "0.0.0.0:8000"

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, template)?;
    println!("Wrote configuration to {}", output.display());
    Ok(())
}

/// Validate a configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match CoordinatorConfig::from_file(&config_path) {
        Ok(_) => {
            println!("Configuration {} is valid", config_path.display());
            Ok(())
        }
        Err(error) => {
            eprintln!("Configuration {} is invalid: {}", config_path.display(), error);
            Err(error)
        }
    }
}

/// Show the effective configuration
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = CoordinatorConfig::from_file(&config_path)?;
    println!("node id:           {}", config.node.id);
    println!("data dir:          {}", config.node.data_dir.display());
    println!("chunk size:        {} bytes", config.storage.chunk_size);
    println!("heartbeat:         {:?}", config.heartbeat_interval());
    println!("offline after:     {:?}", config.node_offline_after());
    println!("session deadline:  {:?}", config.session_deadline());
    println!("api:               {}", config.api.bind_address);
    Ok(())
}
