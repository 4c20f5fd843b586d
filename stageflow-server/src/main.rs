//! stageflow-server entry point.
//!
//! Startup order:
//! 1. Initialise tracing.
//! 2. Load configuration from `STAGEFLOW_*` environment variables.
//! 3. Open the SQLite database and create the schema.
//! 4. Build the model client and start the worker (unless disabled).
//! 5. Serve the REST API until SIGINT/SIGTERM, then stop the worker.

use std::str::FromStr;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use stageflow::{build_model_client, EngineConfig, SqliteTaskStore, TaskService, WorkerBuilder};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "stageflow=info,stageflow_server=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();

    let config = EngineConfig::from_env()?;
    info!(version = env!("CARGO_PKG_VERSION"), "stageflow-server starting");

    let options = SqliteConnectOptions::from_str(&config.database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    let store = SqliteTaskStore::new(pool);
    store.run_migrations().await?;
    info!(database_url = %config.database_url, "Database ready");

    let service = Arc::new(TaskService::new(store));
    let client = build_model_client(&config.model)?;

    let worker = if config.worker.enabled {
        Some(
            WorkerBuilder::new(service.clone(), client)
                .config(&config.worker)
                .build()
                .spawn(),
        )
    } else {
        info!("Task worker disabled");
        None
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    stageflow_server::run_server(service, listener, shutdown_signal()).await?;

    if let Some(worker) = worker {
        worker.stop().await;
    }

    info!("stageflow-server stopped");
    Ok(())
}

/// Resolves on SIGINT (Ctrl-C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl-C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}
