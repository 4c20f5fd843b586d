//! Task service: creation, lookups and the lifecycle-checked status writes the
//! worker drives tasks with.

use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::dto::{CreateTaskRequest, TaskDetail, DEFAULT_TASK_TYPE};
use crate::lifecycle::{self, StepCursor, TransitionError};
use crate::pipeline::StepPipeline;
use crate::store::{StepStatusUpdate, StoreError, TaskStatusUpdate, TaskStore};
use crate::task::{StepId, StepStatus, Task, TaskId, TaskStatus, TaskStep, TaskWithSteps};

/// Error type for service operations.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Bad input from the caller.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, id } => Self::NotFound(format!("{entity} not found: {id}")),
            other => Self::Store(other),
        }
    }
}

/// Owns the store and the step pipeline every task is created from.
pub struct TaskService<S: TaskStore> {
    store: Arc<S>,
    pipeline: StepPipeline,
}

impl<S: TaskStore> TaskService<S> {
    /// Service over `store` using the default six-step pipeline.
    pub fn new(store: S) -> Self {
        Self::with_pipeline(store, StepPipeline::default())
    }

    pub fn with_pipeline(store: S, pipeline: StepPipeline) -> Self {
        Self {
            store: Arc::new(store),
            pipeline,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn pipeline(&self) -> &StepPipeline {
        &self.pipeline
    }

    /// Validate the request and persist a PENDING task with its full step set.
    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<TaskDetail, ServiceError> {
        let user_id = request.user_id.as_deref().map(str::trim).unwrap_or_default();
        if user_id.is_empty() {
            return Err(ServiceError::Validation("userId is required".to_string()));
        }

        let task_type = match request.task_type.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => DEFAULT_TASK_TYPE.to_string(),
        };

        let created = self
            .store
            .create_task(&task_type, request.payload(), self.pipeline.steps())
            .await?;

        info!(
            task_id = %created.task.id,
            task_type = %task_type,
            steps = created.steps.len(),
            "Task created"
        );
        Ok(created.into())
    }

    pub async fn get_task(&self, id: &TaskId) -> Result<TaskDetail, ServiceError> {
        Ok(self.store.get_task(id).await?.into())
    }

    /// The raw task record with every step, including step results.
    pub async fn load_task(&self, id: &TaskId) -> Result<TaskWithSteps, ServiceError> {
        Ok(self.store.get_task(id).await?)
    }

    pub async fn get_step(&self, id: StepId) -> Result<TaskStep, ServiceError> {
        Ok(self.store.get_step(id).await?)
    }

    /// PENDING or RUNNING tasks, oldest first. `limit` is raised to at least 1.
    pub async fn find_runnable_tasks(&self, limit: usize) -> Result<Vec<Task>, ServiceError> {
        Ok(self.store.list_runnable(limit.max(1)).await?)
    }

    /// PENDING -> RUNNING. A task that is already RUNNING is returned as is.
    pub async fn mark_task_running(&self, id: &TaskId) -> Result<Task, ServiceError> {
        let current = self.store.get_task(id).await?.task;
        match current.status {
            TaskStatus::Running => return Ok(current),
            TaskStatus::Pending => {}
            other => lifecycle::check_task_transition(other, TaskStatus::Running)?,
        }

        if !self.store.claim_pending(id).await? {
            let now = self.store.get_task(id).await?.task.status;
            lifecycle::check_task_transition(now, TaskStatus::Running)?;
        }
        Ok(self.store.get_task(id).await?.task)
    }

    /// Move the first PENDING step (order 1 on a fresh task) to RUNNING.
    ///
    /// Returns `None` when the task has no PENDING step left.
    pub async fn mark_first_step_running(
        &self,
        task_id: &TaskId,
    ) -> Result<Option<TaskStep>, ServiceError> {
        let steps = self.store.get_task(task_id).await?.steps;
        let Some(first) = steps.iter().find(|s| s.status == StepStatus::Pending) else {
            return Ok(None);
        };
        Ok(Some(self.start_step(&steps, first).await?))
    }

    /// The lowest-order step that has not finished, or `None` once all steps
    /// succeeded.
    ///
    /// A RUNNING step is returned too: it was started but its outcome was never
    /// recorded, so it is dispatched again. Errors if the pipeline already
    /// halted on a failed step.
    pub async fn get_next_pending_step(
        &self,
        task_id: &TaskId,
    ) -> Result<Option<TaskStep>, ServiceError> {
        let steps = self.store.get_task(task_id).await?.steps;
        match lifecycle::cursor(&steps) {
            StepCursor::Next(step) => Ok(Some(step.clone())),
            StepCursor::Complete => Ok(None),
            StepCursor::Halted(step) => Err(TransitionError {
                entity: "step",
                from: step.status.as_str(),
                to: StepStatus::Running.as_str(),
            }
            .into()),
        }
    }

    /// PENDING -> RUNNING for a step whose predecessors all succeeded.
    /// A step that is already RUNNING is returned unchanged.
    pub async fn mark_step_running(&self, step_id: StepId) -> Result<TaskStep, ServiceError> {
        let step = self.store.get_step(step_id).await?;
        if step.status == StepStatus::Running {
            return Ok(step);
        }
        let steps = self.store.get_task(&step.task_id).await?.steps;
        self.start_step(&steps, &step).await
    }

    /// RUNNING -> SUCCESS, recording the step's output.
    pub async fn mark_step_success(
        &self,
        step_id: StepId,
        result: Map<String, Value>,
    ) -> Result<TaskStep, ServiceError> {
        let step = self.store.get_step(step_id).await?;
        lifecycle::check_step_transition(step.status, StepStatus::Success)?;

        self.store
            .write_step_status(step_id, StepStatusUpdate::success(Utc::now(), Value::Object(result)))
            .await?;
        debug!(task_id = %step.task_id, step = %step.step_key, "Step marked SUCCESS");
        Ok(self.store.get_step(step_id).await?)
    }

    /// PENDING/RUNNING -> FAILED with a message.
    pub async fn mark_step_failed(
        &self,
        step_id: StepId,
        message: &str,
    ) -> Result<TaskStep, ServiceError> {
        let step = self.store.get_step(step_id).await?;
        lifecycle::check_step_transition(step.status, StepStatus::Failed)?;

        self.store
            .write_step_status(step_id, StepStatusUpdate::failed(Utc::now(), message))
            .await?;
        debug!(task_id = %step.task_id, step = %step.step_key, "Step marked FAILED");
        Ok(self.store.get_step(step_id).await?)
    }

    /// RUNNING -> SUCCESS. Every step must have succeeded; `result` becomes the
    /// task result.
    pub async fn mark_task_success(
        &self,
        task_id: &TaskId,
        result: Map<String, Value>,
    ) -> Result<Task, ServiceError> {
        let current = self.store.get_task(task_id).await?;
        lifecycle::check_task_transition(current.task.status, TaskStatus::Success)?;

        if let StepCursor::Next(step) | StepCursor::Halted(step) = lifecycle::cursor(&current.steps) {
            return Err(TransitionError {
                entity: "task",
                from: current.task.status.as_str(),
                to: if step.status == StepStatus::Failed {
                    "SUCCESS (a step failed)"
                } else {
                    "SUCCESS (steps unfinished)"
                },
            }
            .into());
        }

        self.store
            .write_task_status(task_id, TaskStatusUpdate::success(Value::Object(result)))
            .await?;
        Ok(self.store.get_task(task_id).await?.task)
    }

    /// PENDING/RUNNING -> FAILED. The message replaces any earlier one and any
    /// stored result is cleared.
    pub async fn mark_task_failed(&self, task_id: &TaskId, message: &str) -> Result<Task, ServiceError> {
        let current = self.store.get_task(task_id).await?.task;
        lifecycle::check_task_transition(current.status, TaskStatus::Failed)?;

        self.store
            .write_task_status(task_id, TaskStatusUpdate::failed(message))
            .await?;
        Ok(self.store.get_task(task_id).await?.task)
    }

    async fn start_step(&self, steps: &[TaskStep], step: &TaskStep) -> Result<TaskStep, ServiceError> {
        lifecycle::check_step_transition(step.status, StepStatus::Running)?;
        if !lifecycle::may_start(steps, step) {
            return Err(TransitionError {
                entity: "step",
                from: step.status.as_str(),
                to: "RUNNING (earlier step unfinished)",
            }
            .into());
        }

        self.store
            .write_step_status(step.id, StepStatusUpdate::running(Utc::now()))
            .await?;
        debug!(task_id = %step.task_id, step = %step.step_key, "Step marked RUNNING");
        Ok(self.store.get_step(step.id).await?)
    }
}
