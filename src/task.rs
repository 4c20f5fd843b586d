//! Task and step records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Allocate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Unique identifier for a task step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub i64);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

/// Status of a single step within a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
}

/// Returned when a stored status string is not one of the four known values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid status value: {0}")]
pub struct ParseStatusError(pub String);

macro_rules! status_strings {
    ($ty:ident) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    Self::Pending => "PENDING",
                    Self::Running => "RUNNING",
                    Self::Success => "SUCCESS",
                    Self::Failed => "FAILED",
                }
            }

            /// SUCCESS and FAILED are terminal.
            pub fn is_terminal(&self) -> bool {
                matches!(self, Self::Success | Self::Failed)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseStatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    "PENDING" => Ok(Self::Pending),
                    "RUNNING" => Ok(Self::Running),
                    "SUCCESS" => Ok(Self::Success),
                    "FAILED" => Ok(Self::Failed),
                    other => Err(ParseStatusError(other.to_string())),
                }
            }
        }
    };
}

status_strings!(TaskStatus);
status_strings!(StepStatus);

/// A unit of work moving through the step pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    pub payload: serde_json::Value,
    /// Present only once the task reached SUCCESS.
    pub result: Option<serde_json::Value>,
    /// Present only once the task reached FAILED.
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// The `userId` captured in the payload at creation, if any.
    pub fn user_id(&self) -> Option<&str> {
        self.payload.get("userId").and_then(|v| v.as_str())
    }
}

/// One step of a task, created together with the task and never added or removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStep {
    pub id: StepId,
    pub task_id: TaskId,
    /// 1-based, contiguous within a task.
    pub step_order: u32,
    pub step_key: String,
    pub label: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

/// A task together with its full ordered step set.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskWithSteps {
    pub task: Task,
    /// Always sorted by `step_order` ascending.
    pub steps: Vec<TaskStep>,
}
