//! stint - a small background job scheduler.
//!
//! Usage:
//!   stint run [--config stint.yaml]       Serve the API and run the scheduler
//!   stint validate --config stint.yaml    Validate a configuration file

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use stint::api::{self, ApiConfig};
use stint::demo::{self, DemoHandlers};
use stint::{
    EventBus, HandlerRegistry, InMemoryStore, JobStore, SchedulerConfigBuilder, ServerConfig,
    StorageConfig, TracingHandler, YamlLoader,
};
use tracing::{error, info, warn};

/// stint - a small background job scheduler
#[derive(Parser)]
#[command(name = "stint")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API and run the scheduler
    Run {
        /// Path to the YAML configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Worker pool size
        #[arg(short = 'w', long)]
        workers: Option<usize>,

        /// SQLite database file (overrides the configured storage)
        #[arg(long, value_name = "FILE")]
        database: Option<PathBuf>,

        /// Address to bind the API to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind the API to
        #[arg(short, long)]
        port: Option<u16>,

        /// Do not register the per-minute print-time job
        #[arg(long)]
        no_recurring: bool,
    },

    /// Validate a configuration file without running
    Validate {
        /// Path to the YAML configuration file
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            workers,
            database,
            host,
            port,
            no_recurring,
        } => {
            let mut server_config = match config {
                Some(path) => {
                    info!("Loading configuration from: {}", path.display());
                    YamlLoader::load_server_config(&path)?
                }
                None => ServerConfig::default(),
            };
            if let Some(workers) = workers {
                server_config.workers = workers;
            }
            if let Some(database) = database {
                server_config.storage = StorageConfig::Sqlite {
                    path: database.display().to_string(),
                };
            }
            if let Some(host) = host {
                server_config.api.host = host;
            }
            if let Some(port) = port {
                server_config.api.port = port;
            }
            server_config.validate()?;

            run_server(server_config, !no_recurring).await?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
    }

    Ok(())
}

/// Open the configured store and run the server on it.
async fn run_server(
    config: ServerConfig,
    register_recurring: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    match &config.storage {
        StorageConfig::Memory => {
            warn!("Using in-memory storage; jobs are lost on exit");
            serve(&config, InMemoryStore::new(), register_recurring).await
        }
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            info!("Using SQLite storage at {}", path);
            let store = stint::SqliteStore::new(path).await?;
            serve(&config, store, register_recurring).await
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => {
            Err("SQLite storage requested but stint was built without the sqlite feature".into())
        }
    }
}

async fn serve<S: JobStore + 'static>(
    config: &ServerConfig,
    store: S,
    register_recurring: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut registry = HandlerRegistry::new();
    DemoHandlers::new().register(&mut registry);

    let event_bus = EventBus::new();
    event_bus.register(Arc::new(TracingHandler)).await;

    let scheduler = SchedulerConfigBuilder::build(config, Arc::new(store), registry)?
        .with_event_bus(event_bus);

    let client = scheduler.client();
    let recurring = scheduler.recurring();

    if register_recurring {
        let definition = recurring
            .add_or_update(demo::print_time_recurring())
            .await?;
        info!(
            "Recurring job '{}' next fires at {}",
            definition.key, definition.next_fire_at
        );
    }

    info!(
        "Starting scheduler ({} workers, queues: {})",
        config.workers,
        config.queues.join(", ")
    );
    let (handle, scheduler_task) = scheduler.start().await;

    let api_config: ApiConfig = config.api.clone();
    let state = api::create_api_state(handle.clone(), client, recurring);
    let server_task = match api::start_server(api_config, state).await {
        Ok(task) => task,
        Err(e) => {
            error!("Failed to start API server: {}", e);
            handle.shutdown().await?;
            return Err(e.into());
        }
    };
    info!("Press Ctrl+C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            server_task.abort();
            handle.shutdown().await?;
        }
        _ = scheduler_task => {
            info!("Scheduler stopped");
            server_task.abort();
        }
    }

    info!("Goodbye!");
    Ok(())
}

/// Validate a configuration file without running.
fn validate_config(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating configuration: {}", path.display());

    let config = match YamlLoader::load_server_config(&path) {
        Ok(config) => config,
        Err(e) => {
            error!("Validation failed: {}", e);
            return Err(e.into());
        }
    };

    let mut registry = HandlerRegistry::new();
    DemoHandlers::new().register(&mut registry);
    if let Err(e) = SchedulerConfigBuilder::apply_limits(&config, registry) {
        error!("Validation failed: {}", e);
        return Err(e.into());
    }

    info!("Configuration is valid:");
    info!("  queues: {}", config.queues.join(", "));
    info!("  workers: {}", config.workers);
    match &config.storage {
        StorageConfig::Memory => info!("  storage: memory"),
        StorageConfig::Sqlite { path } => info!("  storage: sqlite ({})", path),
    }
    info!("  api: {}:{}", config.api.host, config.api.port);
    for (job_type, limit) in &config.concurrency {
        info!(
            "  limit: {} max {} (timeout {}s)",
            job_type, limit.max_concurrent, limit.timeout_secs
        );
    }
    Ok(())
}
