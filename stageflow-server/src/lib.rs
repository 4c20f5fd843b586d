//! REST front end for stageflow.
//!
//! Exposes task creation and task polling over HTTP. Every response uses the
//! same envelope: `{"success": true, "data": ...}` on success and
//! `{"success": false, "code": ..., "message": ...}` on failure.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use stageflow::{SqliteTaskStore, TaskService};
//! use stageflow_server::create_router;
//! use std::sync::Arc;
//!
//! let service = Arc::new(TaskService::new(SqliteTaskStore::new(pool)));
//! let app = create_router(service);
//! axum::serve(listener, app).await?;
//! ```

mod error;
mod routes;

pub use error::{ApiError, ApiResponse};
pub use routes::create_router;

use std::future::Future;
use std::sync::Arc;

use stageflow::{TaskService, TaskStore};
use tokio::net::TcpListener;
use tracing::info;

/// Serve the REST API on `listener` until `shutdown` resolves.
pub async fn run_server<S, F>(
    service: Arc<TaskService<S>>,
    listener: TcpListener,
    shutdown: F,
) -> std::io::Result<()>
where
    S: TaskStore + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP server listening");
    }
    axum::serve(listener, create_router(service))
        .with_graceful_shutdown(shutdown)
        .await
}
