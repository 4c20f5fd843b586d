//! Task storage trait and types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::pipeline::StepTemplate;
use crate::task::{StepId, StepStatus, Task, TaskId, TaskStatus, TaskStep, TaskWithSteps};

/// Error type for store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl StoreError {
    pub fn task_not_found(id: &TaskId) -> Self {
        Self::NotFound {
            entity: "task",
            id: id.to_string(),
        }
    }

    pub fn step_not_found(id: StepId) -> Self {
        Self::NotFound {
            entity: "step",
            id: id.to_string(),
        }
    }
}

/// A status write for a task.
///
/// `error_message` and `result` replace whatever was stored before, so a write
/// never leaves a stale value from an earlier transition behind.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatusUpdate {
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl TaskStatusUpdate {
    pub fn running() -> Self {
        Self {
            status: TaskStatus::Running,
            error_message: None,
            result: None,
        }
    }

    pub fn success(result: serde_json::Value) -> Self {
        Self {
            status: TaskStatus::Success,
            error_message: None,
            result: Some(result),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            error_message: Some(message.into()),
            result: None,
        }
    }
}

/// A status write for a step.
///
/// `started_at` keeps the first value ever written, so re-entering RUNNING
/// after an interrupted dispatch does not move it. Other `None` fields keep
/// their stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct StepStatusUpdate {
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl StepStatusUpdate {
    pub fn running(at: DateTime<Utc>) -> Self {
        Self {
            status: StepStatus::Running,
            started_at: Some(at),
            finished_at: None,
            result: None,
            error_message: None,
        }
    }

    pub fn success(at: DateTime<Utc>, result: serde_json::Value) -> Self {
        Self {
            status: StepStatus::Success,
            started_at: None,
            finished_at: Some(at),
            result: Some(result),
            error_message: None,
        }
    }

    pub fn failed(at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            started_at: None,
            finished_at: Some(at),
            result: None,
            error_message: Some(message.into()),
        }
    }
}

/// Trait for task storage backends.
///
/// Writes are raw point updates: the store does not validate lifecycle
/// transitions, callers do.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new PENDING task and one PENDING step per template, atomically.
    async fn create_task(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        steps: &[StepTemplate],
    ) -> Result<TaskWithSteps, StoreError>;

    /// Fetch a task with its steps ordered by `step_order`.
    async fn get_task(&self, id: &TaskId) -> Result<TaskWithSteps, StoreError>;

    /// Fetch a single step.
    async fn get_step(&self, id: StepId) -> Result<TaskStep, StoreError>;

    /// Up to `limit` PENDING or RUNNING tasks, oldest first.
    async fn list_runnable(&self, limit: usize) -> Result<Vec<Task>, StoreError>;

    /// Overwrite the status, error message and result of a task.
    async fn write_task_status(
        &self,
        id: &TaskId,
        update: TaskStatusUpdate,
    ) -> Result<(), StoreError>;

    /// Update the status of a step.
    async fn write_step_status(&self, id: StepId, update: StepStatusUpdate)
        -> Result<(), StoreError>;

    /// Move a task from PENDING to RUNNING only if it is still PENDING.
    ///
    /// Returns `false` when the stored status was something else.
    /// Default implementation is a read followed by a write; override with a
    /// conditional update where the backend supports one.
    async fn claim_pending(&self, id: &TaskId) -> Result<bool, StoreError> {
        let current = self.get_task(id).await?;
        if current.task.status != TaskStatus::Pending {
            return Ok(false);
        }
        self.write_task_status(id, TaskStatusUpdate::running()).await?;
        Ok(true)
    }
}
