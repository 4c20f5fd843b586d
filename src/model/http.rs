use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::{payload_object, ModelClient, ModelClientConfig, ModelClientError, StepOutput};
use crate::task::{Task, TaskStep};

const RUN_STEP_PATH: &str = "/internal/model/runStep";

/// Model client that posts each step to a remote model service.
///
/// Request body:
///
/// ```json
/// {"stepKey": "...", "taskId": "...", "taskType": "...", "userId": "...",
///  "stepOrder": 1, "payload": {...}, "options": {"timeoutMs": 5000}}
/// ```
///
/// The service answers `{"success": true, "data": {...}}` or
/// `{"success": false, "code": "...", "message": "..."}`.
pub struct HttpModelClient {
    client: Client,
    base_url: String,
    auth: Option<(String, String)>,
    timeout: Duration,
}

impl HttpModelClient {
    pub fn new(config: &ModelClientConfig) -> Result<Self, ModelClientError> {
        let client = Client::builder()
            .connect_timeout(config.timeout)
            .timeout(config.timeout)
            .build()
            .map_err(|e| ModelClientError::config(format!("failed to build HTTP client: {e}")))?;

        let auth = match (&config.auth_header, &config.auth_token) {
            (Some(header), Some(token)) if !header.trim().is_empty() && !token.trim().is_empty() => {
                Some((header.trim().to_string(), token.clone()))
            }
            _ => None,
        };

        Ok(Self {
            client,
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            auth,
            timeout: config.timeout,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, RUN_STEP_PATH)
    }

    fn request_body(
        &self,
        step_key: &str,
        task: &Task,
        step: &TaskStep,
    ) -> Result<Value, ModelClientError> {
        let payload = payload_object(task)?;
        Ok(json!({
            "stepKey": step_key,
            "taskId": task.id,
            "taskType": task.task_type,
            "userId": task.user_id(),
            "stepOrder": step.step_order,
            "payload": payload,
            "options": { "timeoutMs": self.timeout.as_millis() as u64 },
        }))
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn run_step(
        &self,
        step_key: &str,
        task: &Task,
        step: &TaskStep,
    ) -> Result<StepOutput, ModelClientError> {
        if self.base_url.is_empty() {
            return Err(ModelClientError::config("Model base URL is not configured"));
        }

        let body = self.request_body(step_key, task, step)?;
        let url = self.endpoint();
        debug!(task_id = %task.id, step = step_key, url = %url, "Calling model service");

        let mut request = self.client.post(&url).json(&body);
        if let Some((header, token)) = &self.auth {
            request = request.header(header.as_str(), token.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ModelClientError::http(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ModelClientError::http(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            warn!(task_id = %task.id, step = step_key, status = status.as_u16(), "Model service returned non-2xx");
            return Err(ModelClientError::http(format!(
                "Non-2xx from model service (status {})",
                status.as_u16()
            ))
            .with_snippet(&text));
        }

        decode_envelope(&text)
    }
}

/// Unpack the `{success, data}` / `{code, message}` envelope.
fn decode_envelope(text: &str) -> Result<StepOutput, ModelClientError> {
    let parsed: Map<String, Value> = serde_json::from_str(text).map_err(|_| {
        ModelClientError::parse("Failed to parse model response").with_snippet(text)
    })?;

    if parsed.get("success") == Some(&Value::Bool(true)) {
        return Ok(match parsed.get("data") {
            Some(Value::Object(data)) => data.clone(),
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("data".into(), other.cloned().unwrap_or(Value::Null));
                wrapped
            }
        });
    }

    let code = parsed
        .get("code")
        .map(value_text)
        .unwrap_or_else(|| "REMOTE_ERROR".to_string());
    let message = parsed
        .get("message")
        .map(value_text)
        .unwrap_or_else(|| "Remote model error".to_string());

    Err(ModelClientError::remote(message)
        .with_remote_code(code)
        .with_snippet(text))
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelClientKind, ModelErrorCode};

    #[test]
    fn test_decode_success_object() {
        let out = decode_envelope(r#"{"success": true, "data": {"summary": "ok"}}"#).unwrap();
        assert_eq!(out["summary"], "ok");
    }

    #[test]
    fn test_decode_success_wraps_non_object_data() {
        let out = decode_envelope(r#"{"success": true, "data": [1, 2]}"#).unwrap();
        assert_eq!(out["data"], json!([1, 2]));
    }

    #[test]
    fn test_decode_remote_failure() {
        let err = decode_envelope(r#"{"success": false, "code": "QUOTA", "message": "quota exceeded"}"#)
            .unwrap_err();
        assert_eq!(err.code, ModelErrorCode::Remote);
        assert_eq!(err.message, "quota exceeded");
        assert_eq!(err.remote_code.as_deref(), Some("QUOTA"));
        assert!(err.snippet.is_some());
    }

    #[test]
    fn test_decode_failure_defaults() {
        let err = decode_envelope(r#"{}"#).unwrap_err();
        assert_eq!(err.code, ModelErrorCode::Remote);
        assert_eq!(err.message, "Remote model error");
        assert_eq!(err.remote_code.as_deref(), Some("REMOTE_ERROR"));
    }

    #[test]
    fn test_decode_malformed_body() {
        let body = format!("<html>{}</html>", "a".repeat(500));
        let err = decode_envelope(&body).unwrap_err();
        assert_eq!(err.code, ModelErrorCode::Parse);
        assert_eq!(err.snippet.unwrap().chars().count(), 300);
    }

    #[test]
    fn test_endpoint_strips_trailing_slash() {
        let client = HttpModelClient::new(&ModelClientConfig {
            kind: ModelClientKind::Http,
            base_url: "http://models.local/".to_string(),
            ..ModelClientConfig::default()
        })
        .unwrap();
        assert_eq!(client.endpoint(), "http://models.local/internal/model/runStep");
    }

    #[test]
    fn test_auth_requires_header_and_token() {
        let client = HttpModelClient::new(&ModelClientConfig {
            kind: ModelClientKind::Http,
            base_url: "http://models.local".to_string(),
            auth_header: Some("X-Api-Key".to_string()),
            auth_token: Some("  ".to_string()),
            ..ModelClientConfig::default()
        })
        .unwrap();
        assert!(client.auth.is_none());
    }
}
