//! NoETL Orchestrator
//!
//! Runs the orchestration loop and a pool of queue workers against
//! PostgreSQL, or submits a single execution.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use noetl_orchestrator::{
    config::{DatabaseConfig, OrchestratorConfig},
    db::{create_pool, health_check},
    services::{DirectoryCatalog, ExecutionService, PgStore},
    worker::Worker,
};
use noetl_tools::tools::create_default_registry;

#[derive(Parser)]
#[command(name = "noetl-orchestrator")]
#[command(version, about = "NoETL event-sourced orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestration loop and workers until interrupted
    Serve,

    /// Submit an execution of a playbook from the playbook directory
    Submit {
        /// Playbook reference, resolved as `{playbook_dir}/{reference}.yaml`
        reference: String,

        /// Workload as a JSON object
        #[arg(long, short)]
        workload: Option<String>,
    },

    /// Create the event, execution and queue tables
    InitDb,
}

/// Initialize tracing/logging.
fn init_tracing(config: &OrchestratorConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,noetl_orchestrator=debug".into());

    if config.json_logs() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn connect(db_config: &DatabaseConfig) -> anyhow::Result<PgStore> {
    tracing::info!(database = %db_config.redacted_url(), "Connecting to database");
    let pool = create_pool(db_config).await?;
    if !health_check(&pool).await {
        anyhow::bail!("Database at {} is not answering", db_config.redacted_url());
    }
    Ok(PgStore::new(pool))
}

fn service(store: &Arc<PgStore>, config: &OrchestratorConfig) -> ExecutionService {
    ExecutionService::new(
        store.clone(),
        store.clone(),
        Arc::new(DirectoryCatalog::new(&config.playbook_dir)),
    )
}

async fn serve(config: OrchestratorConfig, store: Arc<PgStore>) -> anyhow::Result<()> {
    store.init().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let registry = Arc::new(create_default_registry());
    tracing::info!(tools = ?registry.list(), "Tool registry ready");

    let mut tasks = Vec::with_capacity(config.worker_count + 1);

    let orchestrator = service(&store, &config);
    let interval = config.orchestrator_interval();
    let rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        orchestrator.run(interval, rx).await;
    }));

    for i in 0..config.worker_count {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let worker_id = format!("{}-{}-{}", config.worker_id_prefix, i, &suffix[..8]);
        let worker = Worker::new(worker_id, store.clone(), store.clone(), registry.clone())
            .with_config(&config);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            worker.run(rx).await;
        }));
    }

    tracing::info!(workers = config.worker_count, "Orchestrator running");

    shutdown_signal().await;
    shutdown_tx.send(true)?;

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Task ended abnormally");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn submit(
    config: OrchestratorConfig,
    store: Arc<PgStore>,
    reference: &str,
    workload: Option<String>,
) -> anyhow::Result<()> {
    let workload = match workload {
        Some(raw) => serde_json::from_str::<Value>(&raw)?,
        None => Value::Null,
    };

    let execution_id = service(&store, &config).submit(reference, workload).await?;
    println!("{}", execution_id);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = OrchestratorConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Failed to load orchestrator config, using defaults: {}", e);
        OrchestratorConfig::default()
    });
    init_tracing(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting NoETL Orchestrator"
    );

    let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load database config, using defaults");
        DatabaseConfig::default()
    });
    let store = Arc::new(connect(&db_config).await?);

    match cli.command {
        Commands::Serve => serve(config, store).await,
        Commands::Submit {
            reference,
            workload,
        } => submit(config, store, &reference, workload).await,
        Commands::InitDb => {
            store.init().await?;
            tracing::info!("Schema initialized");
            Ok(())
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
