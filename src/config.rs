//! Engine configuration, loaded from `STAGEFLOW_*` environment variables.
//!
//! Every setting has a default, so an empty environment yields a working
//! configuration: SQLite file database, worker on, stub model client.

use std::time::Duration;
use thiserror::Error;

use crate::model::{ModelClientConfig, ModelClientKind};
use crate::worker::WorkerConfig;

pub const DATABASE_URL: &str = "STAGEFLOW_DATABASE_URL";
pub const BIND_ADDR: &str = "STAGEFLOW_BIND_ADDR";
pub const WORKER_ENABLED: &str = "STAGEFLOW_WORKER_ENABLED";
pub const WORKER_INTERVAL_MS: &str = "STAGEFLOW_WORKER_INTERVAL_MS";
pub const WORKER_SCAN_LIMIT: &str = "STAGEFLOW_WORKER_SCAN_LIMIT";
pub const MODEL_CLIENT: &str = "STAGEFLOW_MODEL_CLIENT";
pub const MODEL_BASE_URL: &str = "STAGEFLOW_MODEL_BASE_URL";
pub const MODEL_AUTH_HEADER: &str = "STAGEFLOW_MODEL_AUTH_HEADER";
pub const MODEL_AUTH_TOKEN: &str = "STAGEFLOW_MODEL_AUTH_TOKEN";
pub const MODEL_TIMEOUT_MS: &str = "STAGEFLOW_MODEL_TIMEOUT_MS";

const DEFAULT_DATABASE_URL: &str = "sqlite://stageflow.db";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Error type for configuration loading.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime configuration of the engine and its host process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// sqlx connection string (default `sqlite://stageflow.db`).
    pub database_url: String,
    /// Address the REST server binds to (default `0.0.0.0:8080`).
    pub bind_addr: String,
    pub worker: WorkerConfig,
    pub model: ModelClientConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            worker: WorkerConfig::default(),
            model: ModelClientConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Build from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset and blank values take the
    /// default; values that are set but unparseable are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let worker = WorkerConfig {
            enabled: match get(WORKER_ENABLED) {
                Some(raw) => parse_bool(WORKER_ENABLED, &raw)?,
                None => defaults.worker.enabled,
            },
            interval: match get(WORKER_INTERVAL_MS) {
                Some(raw) => Duration::from_millis(parse_positive(WORKER_INTERVAL_MS, &raw)?),
                None => defaults.worker.interval,
            },
            scan_limit: match get(WORKER_SCAN_LIMIT) {
                Some(raw) => parse_positive(WORKER_SCAN_LIMIT, &raw)? as usize,
                None => defaults.worker.scan_limit,
            },
        };

        let model = ModelClientConfig {
            kind: get(MODEL_CLIENT)
                .map(|raw| ModelClientKind::parse_lenient(&raw))
                .unwrap_or_default(),
            base_url: get(MODEL_BASE_URL).unwrap_or_default(),
            auth_header: get(MODEL_AUTH_HEADER),
            auth_token: get(MODEL_AUTH_TOKEN),
            timeout: match get(MODEL_TIMEOUT_MS) {
                Some(raw) => Duration::from_millis(parse_positive(MODEL_TIMEOUT_MS, &raw)?),
                None => defaults.model.timeout,
            },
        };

        Ok(Self {
            database_url: get(DATABASE_URL).unwrap_or(defaults.database_url),
            bind_addr: get(BIND_ADDR).unwrap_or(defaults.bind_addr),
            worker,
            model,
        })
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn parse_positive(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: reason.to_string(),
    };
    let value: u64 = raw
        .trim()
        .parse()
        .map_err(|_| invalid("expected a positive integer"))?;
    if value == 0 {
        return Err(invalid("must be greater than zero"));
    }
    Ok(value)
}
