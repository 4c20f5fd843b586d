use async_trait::async_trait;
use serde_json::{json, Value};

use super::{payload_object, ModelClient, ModelClientError, StepOutput};
use crate::task::{Task, TaskStep};

/// Deterministic local client that echoes the task payload and step metadata.
///
/// Used when no model service is configured.
#[derive(Debug, Clone, Default)]
pub struct StubModelClient;

impl StubModelClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ModelClient for StubModelClient {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn run_step(
        &self,
        step_key: &str,
        task: &Task,
        step: &TaskStep,
    ) -> Result<StepOutput, ModelClientError> {
        let payload = payload_object(task)?;

        let mut output = StepOutput::new();
        output.insert("stepKey".into(), json!(step_key));
        output.insert("message".into(), json!("stub"));
        output.insert("inputEcho".into(), Value::Object(payload));
        output.insert("taskType".into(), json!(task.task_type));
        output.insert("stepOrder".into(), json!(step.step_order));
        Ok(output)
    }
}
