//! Model client: runs one pipeline step against the external compute service.
//!
//! Two implementations sit behind the [`ModelClient`] trait and one is picked
//! at startup from [`ModelClientConfig`]:
//!
//! - [`StubModelClient`] echoes the task payload back locally.
//! - [`HttpModelClient`] posts the step to a remote endpoint (feature `http`).

mod stub;

#[cfg(feature = "http")]
mod http;

pub use stub::StubModelClient;

#[cfg(feature = "http")]
pub use http::HttpModelClient;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::task::{Task, TaskStep};

/// Longest raw-response excerpt kept on an error.
pub const MAX_SNIPPET_CHARS: usize = 300;

/// Structured output of a single step.
pub type StepOutput = Map<String, Value>;

/// Failure family of a model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelErrorCode {
    /// Endpoint not configured.
    Config,
    /// Transport failure or non-2xx status.
    Http,
    /// Request or response body is not valid structured data.
    Parse,
    /// The remote reported failure in its envelope.
    Remote,
}

impl ModelErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "CONFIG_ERROR",
            Self::Http => "HTTP_ERROR",
            Self::Parse => "PARSE_ERROR",
            Self::Remote => "REMOTE_ERROR",
        }
    }
}

impl fmt::Display for ModelErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a model client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ModelClientError {
    pub code: ModelErrorCode,
    pub message: String,
    /// Error code reported by the remote envelope, if any.
    pub remote_code: Option<String>,
    /// At most [`MAX_SNIPPET_CHARS`] characters of the raw response.
    pub snippet: Option<String>,
}

impl ModelClientError {
    pub fn new(code: ModelErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            remote_code: None,
            snippet: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ModelErrorCode::Config, message)
    }

    pub fn http(message: impl Into<String>) -> Self {
        Self::new(ModelErrorCode::Http, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ModelErrorCode::Parse, message)
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(ModelErrorCode::Remote, message)
    }

    /// Attach a truncated excerpt of the raw response body.
    pub fn with_snippet(mut self, body: &str) -> Self {
        self.snippet = Some(truncate_snippet(body));
        self
    }

    pub fn with_remote_code(mut self, code: impl Into<String>) -> Self {
        self.remote_code = Some(code.into());
        self
    }
}

/// Cut `body` down to [`MAX_SNIPPET_CHARS`] characters.
pub fn truncate_snippet(body: &str) -> String {
    match body.char_indices().nth(MAX_SNIPPET_CHARS) {
        Some((cut, _)) => body[..cut].to_string(),
        None => body.to_string(),
    }
}

/// Executes one pipeline step against the compute service.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Run `step_key` for `task`. `step` is the step record being executed.
    async fn run_step(
        &self,
        step_key: &str,
        task: &Task,
        step: &TaskStep,
    ) -> Result<StepOutput, ModelClientError>;
}

/// The task payload as a JSON object. `null` counts as empty.
pub(crate) fn payload_object(task: &Task) -> Result<StepOutput, ModelClientError> {
    match &task.payload {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        _ => Err(ModelClientError::parse("Failed to parse task payload")),
    }
}

/// Which model client to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelClientKind {
    #[default]
    Stub,
    Http,
}

impl ModelClientKind {
    /// `"http"` (any case) selects the remote client; anything else the stub.
    pub fn parse_lenient(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("http") {
            Self::Http
        } else {
            Self::Stub
        }
    }
}

/// Settings for the model client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelClientConfig {
    pub kind: ModelClientKind,
    /// Base URL of the model service. May be empty, in which case every remote
    /// call fails with `CONFIG_ERROR`.
    pub base_url: String,
    /// Header name carrying the auth token. Sent only when both are non-blank.
    pub auth_header: Option<String>,
    pub auth_token: Option<String>,
    /// Connect and request timeout, also forwarded to the service as `timeoutMs`.
    pub timeout: Duration,
}

impl Default for ModelClientConfig {
    fn default() -> Self {
        Self {
            kind: ModelClientKind::Stub,
            base_url: String::new(),
            auth_header: None,
            auth_token: None,
            timeout: Duration::from_millis(5000),
        }
    }
}

/// Construct the configured model client.
pub fn build_model_client(
    config: &ModelClientConfig,
) -> Result<Arc<dyn ModelClient>, ModelClientError> {
    match config.kind {
        #[cfg(feature = "http")]
        ModelClientKind::Http => {
            info!(
                base_url_configured = !config.base_url.trim().is_empty(),
                timeout_ms = config.timeout.as_millis() as u64,
                "Using HTTP model client"
            );
            Ok(Arc::new(HttpModelClient::new(config)?))
        }
        #[cfg(not(feature = "http"))]
        ModelClientKind::Http => Err(ModelClientError::config(
            "HTTP model client requires the `http` feature",
        )),
        ModelClientKind::Stub => {
            info!("Using stub model client");
            Ok(Arc::new(StubModelClient::new()))
        }
    }
}
