use futures::FutureExt;
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{START_FAILED_MESSAGE, UNEXPECTED_ERROR_MESSAGE};
use crate::lifecycle::{self, StepCursor};
use crate::model::{ModelClient, ModelClientError, StepOutput};
use crate::service::{ServiceError, TaskService};
use crate::store::TaskStore;
use crate::task::{Task, TaskId, TaskStatus, TaskStep};

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Runnable tasks fetched.
    pub scanned: usize,
    /// Tasks moved PENDING -> RUNNING.
    pub started: usize,
    /// Tasks that reached SUCCESS.
    pub succeeded: usize,
    /// Tasks that reached FAILED.
    pub failed: usize,
    /// Tasks skipped because the store misbehaved; retried next tick.
    pub errored: usize,
}

/// What happened to one task during a tick.
enum TaskOutcome {
    Started,
    Succeeded,
    Failed,
}

/// Why a step did not complete.
enum DispatchError {
    /// The model client reported a failure.
    Model(ModelClientError),
    /// Anything else: store errors, illegal transitions, a panicking client.
    Unexpected(anyhow::Error),
}

/// Periodic worker that advances tasks through the pipeline.
pub struct TaskWorker<S: TaskStore> {
    service: Arc<TaskService<S>>,
    client: Arc<dyn ModelClient>,
    interval: Duration,
    scan_limit: usize,
}

impl<S: TaskStore> Clone for TaskWorker<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            client: self.client.clone(),
            interval: self.interval,
            scan_limit: self.scan_limit,
        }
    }
}

/// Handle to a spawned worker.
///
/// Dropping the handle without calling [`WorkerHandle::stop`] also stops the
/// worker once its current tick has finished.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Ask the worker to stop and wait until it has. A tick in flight runs to
    /// completion first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "Task worker terminated abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl<S: TaskStore + 'static> TaskWorker<S> {
    pub(crate) fn new(
        service: Arc<TaskService<S>>,
        client: Arc<dyn ModelClient>,
        interval: Duration,
        scan_limit: usize,
    ) -> Self {
        Self {
            service,
            client,
            interval,
            scan_limit,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn scan_limit(&self) -> usize {
        self.scan_limit
    }

    /// Run the worker on the tokio runtime. The first tick fires immediately.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown, rx) = watch::channel(false);
        let join = tokio::spawn(async move { self.run(rx).await });
        WorkerHandle { shutdown, join }
    }

    /// Tick until `shutdown` turns true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            scan_limit = self.scan_limit,
            client = self.client.name(),
            "Task worker started"
        );

        while !*shutdown.borrow() {
            self.guarded_tick().await;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Task worker stopped");
    }

    /// Run one tick on its own tokio task so that neither an error nor a panic
    /// escapes into the loop.
    async fn guarded_tick(&self) {
        let worker = self.clone();
        match tokio::spawn(async move { worker.tick().await }).await {
            Ok(Ok(report)) => debug!(
                scanned = report.scanned,
                started = report.started,
                succeeded = report.succeeded,
                failed = report.failed,
                errored = report.errored,
                "Worker tick finished"
            ),
            Ok(Err(e)) => error!(error = %e, "Worker scan failed"),
            Err(e) => error!(error = %e, "Worker tick aborted"),
        }
    }

    /// Scan runnable tasks once and process each of them in order.
    ///
    /// Fails only if the scan itself fails. A task whose processing breaks on a
    /// store error is logged, counted in [`TickReport::errored`] and picked up
    /// again next tick.
    pub async fn tick(&self) -> Result<TickReport, ServiceError> {
        let tasks = self.service.find_runnable_tasks(self.scan_limit).await?;
        let mut report = TickReport {
            scanned: tasks.len(),
            ..TickReport::default()
        };

        for task in &tasks {
            if task.status.is_terminal() {
                continue;
            }
            let outcome = if task.status == TaskStatus::Pending {
                self.process_pending(task).await
            } else {
                self.process_running(task).await
            };

            match outcome {
                Ok(TaskOutcome::Started) => report.started += 1,
                Ok(TaskOutcome::Succeeded) => report.succeeded += 1,
                Ok(TaskOutcome::Failed) => report.failed += 1,
                Err(e) => {
                    report.errored += 1;
                    error!(task_id = %task.id, error = %e, "Task processing failed");
                }
            }
        }

        Ok(report)
    }

    async fn process_pending(&self, task: &Task) -> Result<TaskOutcome, ServiceError> {
        match self.start_task(&task.id).await {
            Ok(first) => {
                info!(
                    task_id = %task.id,
                    first_step = first.as_ref().map(|s| s.step_key.as_str()).unwrap_or("none"),
                    "Task PENDING -> RUNNING"
                );
                Ok(TaskOutcome::Started)
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Failed to start task");
                self.service
                    .mark_task_failed(&task.id, START_FAILED_MESSAGE)
                    .await?;
                Ok(TaskOutcome::Failed)
            }
        }
    }

    async fn start_task(&self, id: &TaskId) -> Result<Option<TaskStep>, ServiceError> {
        self.service.mark_task_running(id).await?;
        self.service.mark_first_step_running(id).await
    }

    async fn process_running(&self, task: &Task) -> Result<TaskOutcome, ServiceError> {
        let snapshot = self.service.load_task(&task.id).await?;

        // A previous run may have stopped between failing a step and failing the task.
        if let StepCursor::Halted(step) = lifecycle::cursor(&snapshot.steps) {
            let reason = step.error_message.as_deref().unwrap_or(UNEXPECTED_ERROR_MESSAGE);
            warn!(task_id = %task.id, step = %step.step_key, "Found failed step on running task");
            self.service
                .mark_task_failed(&task.id, &format!("Step failed: {reason}"))
                .await?;
            return Ok(TaskOutcome::Failed);
        }

        // Seed with steps finished in earlier ticks so the result is complete.
        let mut accumulated: Map<String, Value> = lifecycle::collect_results(&snapshot.steps);

        loop {
            let Some(step) = self.service.get_next_pending_step(&task.id).await? else {
                self.service.mark_task_success(&task.id, accumulated).await?;
                info!(task_id = %task.id, "Task RUNNING -> SUCCESS");
                return Ok(TaskOutcome::Succeeded);
            };

            match self.dispatch(task, &step).await {
                Ok(output) => {
                    info!(task_id = %task.id, step = %step.step_key, "Step -> SUCCESS");
                    accumulated.insert(step.step_key.clone(), Value::Object(output));
                }
                Err(DispatchError::Model(e)) => {
                    error!(
                        task_id = %task.id,
                        step = %step.step_key,
                        code = %e.code,
                        message = %e.message,
                        snippet = e.snippet.as_deref().unwrap_or(""),
                        "Step failed"
                    );
                    self.fail(task, &step, &e.message, &format!("Step failed: {}", e.message))
                        .await?;
                    return Ok(TaskOutcome::Failed);
                }
                Err(DispatchError::Unexpected(e)) => {
                    error!(
                        task_id = %task.id,
                        step = %step.step_key,
                        error = ?e,
                        "Step failed with unexpected error"
                    );
                    self.fail(task, &step, UNEXPECTED_ERROR_MESSAGE, UNEXPECTED_ERROR_MESSAGE)
                        .await?;
                    return Ok(TaskOutcome::Failed);
                }
            }
        }
    }

    /// Start `step` if needed, call the model client and record success.
    async fn dispatch(&self, task: &Task, step: &TaskStep) -> Result<StepOutput, DispatchError> {
        let step = self
            .service
            .mark_step_running(step.id)
            .await
            .map_err(|e| DispatchError::Unexpected(e.into()))?;

        let call = self.client.run_step(&step.step_key, task, &step);
        let output = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(DispatchError::Model(e)),
            Err(_) => {
                return Err(DispatchError::Unexpected(anyhow::anyhow!(
                    "model client '{}' panicked",
                    self.client.name()
                )))
            }
        };

        self.service
            .mark_step_success(step.id, output.clone())
            .await
            .map_err(|e| DispatchError::Unexpected(e.into()))?;

        Ok(output)
    }

    async fn fail(
        &self,
        task: &Task,
        step: &TaskStep,
        step_message: &str,
        task_message: &str,
    ) -> Result<(), ServiceError> {
        // Fail the task even when the step write is lost, so the step is never
        // sent to the model a second time.
        if let Err(e) = self.service.mark_step_failed(step.id, step_message).await {
            error!(
                task_id = %task.id,
                step = %step.step_key,
                error = %e,
                "Could not record step failure"
            );
        }
        self.service.mark_task_failed(&task.id, task_message).await?;
        info!(task_id = %task.id, step = %step.step_key, "Task RUNNING -> FAILED");
        Ok(())
    }
}
