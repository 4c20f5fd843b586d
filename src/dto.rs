//! Request and response shapes exchanged with the REST layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{StepStatus, TaskId, TaskStatus, TaskWithSteps};

/// Task type used when a creation request does not name one.
pub const DEFAULT_TASK_TYPE: &str = "moments_optimize";

/// Body of a task creation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    /// Required and non-blank.
    pub user_id: Option<String>,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub input_text: Option<String>,
    pub image_urls: Option<Vec<String>>,
    pub options: Option<serde_json::Value>,
}

impl CreateTaskRequest {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    /// The payload captured on the task, verbatim from the request.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "userId": self.user_id,
            "type": self.task_type,
            "inputText": self.input_text,
            "imageUrls": self.image_urls,
            "options": self.options,
        })
    }
}

/// One step as shown in a task detail response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDetail {
    pub key: String,
    pub label: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Task detail response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetail {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub steps: Vec<StepDetail>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl From<TaskWithSteps> for TaskDetail {
    fn from(value: TaskWithSteps) -> Self {
        let TaskWithSteps { task, steps } = value;
        Self {
            id: task.id,
            task_type: task.task_type,
            status: task.status,
            created_at: task.created_at,
            updated_at: task.updated_at,
            steps: steps
                .into_iter()
                .map(|s| StepDetail {
                    key: s.step_key,
                    label: s.label,
                    status: s.status,
                    started_at: s.started_at,
                    finished_at: s.finished_at,
                })
                .collect(),
            result: task.result,
            error_message: task.error_message,
        }
    }
}
