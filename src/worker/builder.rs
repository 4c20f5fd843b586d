use std::sync::Arc;
use std::time::Duration;

use super::task_worker::TaskWorker;
use super::WorkerConfig;
use crate::model::ModelClient;
use crate::service::TaskService;
use crate::store::TaskStore;

/// Builder for configuring a TaskWorker.
pub struct WorkerBuilder<S: TaskStore> {
    service: Arc<TaskService<S>>,
    client: Arc<dyn ModelClient>,
    interval: Duration,
    scan_limit: usize,
}

impl<S: TaskStore + 'static> WorkerBuilder<S> {
    /// Create a builder with the default interval and scan limit.
    pub fn new(service: Arc<TaskService<S>>, client: Arc<dyn ModelClient>) -> Self {
        let defaults = WorkerConfig::default();
        Self {
            service,
            client,
            interval: defaults.interval,
            scan_limit: defaults.scan_limit,
        }
    }

    /// Apply interval and scan limit from a [`WorkerConfig`].
    pub fn config(self, config: &WorkerConfig) -> Self {
        self.interval(config.interval).scan_limit(config.scan_limit)
    }

    /// Set the delay between ticks.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set how many tasks one tick fetches at most.
    pub fn scan_limit(mut self, limit: usize) -> Self {
        self.scan_limit = limit.max(1);
        self
    }

    /// Build the worker.
    pub fn build(self) -> TaskWorker<S> {
        TaskWorker::new(self.service, self.client, self.interval, self.scan_limit)
    }
}
