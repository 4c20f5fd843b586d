//! Periodic worker that drives tasks through the step pipeline.
//!
//! One tick scans the oldest runnable tasks and handles them one at a time:
//! PENDING tasks are started, RUNNING tasks have their remaining steps
//! dispatched to the model client in order until the pipeline drains or a step
//! fails. Ticks never overlap: the next one is scheduled only after the
//! previous one finished (fixed delay).

mod builder;
mod task_worker;

pub use builder::WorkerBuilder;
pub use task_worker::{TaskWorker, TickReport, WorkerHandle};

use std::time::Duration;

/// Task error message used when a PENDING task could not be started.
pub const START_FAILED_MESSAGE: &str = "Failed to start task";

/// Step and task error message for failures other than a model error.
pub const UNEXPECTED_ERROR_MESSAGE: &str = "Unexpected error";

/// Worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Whether the host process should start the worker at all.
    pub enabled: bool,
    /// Delay between the end of one tick and the start of the next.
    pub interval: Duration,
    /// Maximum number of tasks fetched per tick.
    pub scan_limit: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            scan_limit: 1020,
        }
    }
}
