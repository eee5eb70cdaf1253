//! FragStore - Fragmented MariaDB Simulator
//!
//! Runs the transaction coordinator and its HTTP API over one master and
//! two fragment databases.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fragstore::api::HttpServer;
use fragstore::config::{default_config_path, FragStoreConfig};
use fragstore::coordinator::TransactionCoordinator;
use fragstore::error::Result;
use fragstore::store::StoreSet;

/// FragStore - Fragmented MariaDB Simulator
#[derive(Parser)]
#[command(name = "fragstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults to fragstore.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator and HTTP API
    Start {
        /// Use in-process stores instead of MariaDB
        #[arg(long)]
        memory: bool,
    },

    /// Write a sample configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "fragstore.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate configuration file
    Validate,

    /// Show configuration summary
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Start { memory } => run_start(config_path, cli.log_level, memory).await,
        Commands::Init { output, force } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_init(output, force)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_validate(config_path)
        }
        Commands::Info => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_info(config_path)
        }
    }
}

/// Initialize logging. `RUST_LOG` wins over `level`.
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the coordinator
async fn run_start(config_path: PathBuf, log_level: Option<String>, memory: bool) -> Result<()> {
    let config = match FragStoreConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) if memory && !config_path.exists() => {
            // In-memory mode runs without a config file
            let config = FragStoreConfig::from_str(&FragStoreConfig::sample())?;
            init_logging(log_level.as_deref().unwrap_or(&config.logging.level), &config.logging.format);
            tracing::info!("No configuration at {:?} ({}), using defaults", config_path, e);
            return serve(config, true).await;
        }
        Err(e) => {
            init_logging(log_level.as_deref().unwrap_or("info"), "pretty");
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Run `fragstore init` to create one");
            return Err(e);
        }
    };

    init_logging(log_level.as_deref().unwrap_or(&config.logging.level), &config.logging.format);
    serve(config, memory).await
}

async fn serve(config: FragStoreConfig, memory: bool) -> Result<()> {
    tracing::info!("Starting FragStore...");

    let stores = if memory {
        tracing::info!("Using in-memory stores");
        StoreSet::in_memory(&config.fragmentation.key_column, &config.fragmentation.partition_column)
    } else {
        for (node, target) in config.describe() {
            tracing::info!("  {} -> {}", node, target);
        }
        StoreSet::connect(&config)?
    };

    let coordinator = Arc::new(TransactionCoordinator::new(&config, stores));
    tracing::info!(
        "Fragmentation: {}.{} split at {} (key {})",
        config.fragmentation.table,
        config.fragmentation.partition_column,
        coordinator.rule().boundary(),
        config.fragmentation.key_column
    );

    for (node, state) in coordinator.health().await {
        if state.reachable {
            tracing::info!("Node {} is reachable", node);
        } else {
            tracing::warn!(
                "Node {} is unreachable: {}",
                node,
                state.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    let monitor = coordinator.spawn_health_monitor();
    let server = HttpServer::new(config.api.clone(), Arc::clone(&coordinator));

    let result = tokio::select! {
        result = server.start() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            Ok(())
        }
    };

    monitor.abort();
    tracing::info!("FragStore stopped");
    result
}

/// Write a sample configuration file
fn run_init(output: PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        eprintln!("✗ {} already exists (use --force to overwrite)", output.display());
        return Err(fragstore::Error::Config(format!("{} already exists", output.display())));
    }

    std::fs::write(&output, FragStoreConfig::sample())?;
    println!("✓ Configuration written to {}", output.display());
    println!("  Edit the [nodes.*] sections, then run: fragstore start");
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match FragStoreConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            for (node, target) in config.describe() {
                println!("  {:<10} {}", node, target);
            }
            println!("  Boundary:  {}", config.fragmentation.boundary);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show configuration summary
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = FragStoreConfig::from_file(&config_path)?;

    println!("FragStore Configuration");
    println!("=======================");
    println!();
    println!("Nodes:");
    for (node, target) in config.describe() {
        println!("  {:<14}{}", node, target);
    }
    println!();
    println!("Fragmentation:");
    println!("  Table:          {}", config.fragmentation.table);
    println!("  Key Column:     {}", config.fragmentation.key_column);
    println!("  Partition:      {}", config.fragmentation.partition_column);
    println!("  Boundary:       {} (fragmentA before, fragmentB on/after)", config.fragmentation.boundary);
    println!();
    println!("Coordinator:");
    println!("  Lock Timeout:   {} ms", config.coordinator.lock_timeout_ms);
    println!("  Health Check:   {} ms", config.coordinator.health_check_interval_ms);
    println!("  Log Capacity:   {}", config.coordinator.max_log_entries);
    println!();
    println!("API:");
    println!("  Bind Address:   {}", config.api.bind_address);
    println!("  CORS:           {}", config.api.cors_enabled);

    Ok(())
}
