//! # Stageflow
//!
//! Durable step-pipeline task engine.
//!
//! A task is created with a fixed, ordered set of steps. A periodic worker
//! picks up runnable tasks, walks their steps in order through a pluggable
//! model client and records every transition in a task store, so progress
//! survives restarts and can be polled by clients.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stageflow::{
//!     build_model_client, CreateTaskRequest, ModelClientConfig, SqliteTaskStore, TaskService,
//!     WorkerBuilder,
//! };
//! use std::sync::Arc;
//!
//! let store = SqliteTaskStore::new(pool);
//! store.run_migrations().await?;
//!
//! let service = Arc::new(TaskService::new(store));
//! let client = build_model_client(&ModelClientConfig::default())?;
//!
//! let created = service.create_task(CreateTaskRequest::for_user("u1")).await?;
//!
//! let worker = WorkerBuilder::new(service.clone(), client).build().spawn();
//! // ... poll service.get_task(&created.id) ...
//! worker.stop().await;
//! ```
//!
//! ## Lifecycle
//!
//! Tasks and steps share one state machine: `PENDING -> RUNNING -> SUCCESS`,
//! with `FAILED` reachable from `PENDING` and `RUNNING`. Terminal states never
//! change again. A step runs only after every earlier step succeeded, and a
//! task succeeds only once all of its steps have.
//!
//! ## Feature Flags
//!
//! - `sqlite` - SQLite-backed task store
//! - `http` - HTTP model client

pub mod config;
pub mod dto;
pub mod lifecycle;
pub mod model;
pub mod pipeline;
pub mod service;
pub mod store;
pub mod task;
pub mod worker;

pub use config::{ConfigError, EngineConfig};
pub use dto::{CreateTaskRequest, StepDetail, TaskDetail, DEFAULT_TASK_TYPE};
pub use lifecycle::{StepCursor, TransitionError};
pub use model::{
    build_model_client, ModelClient, ModelClientConfig, ModelClientError, ModelClientKind,
    ModelErrorCode, StepOutput, StubModelClient, MAX_SNIPPET_CHARS,
};
pub use pipeline::{PipelineError, StepPipeline, StepTemplate, DEFAULT_STEPS};
pub use service::{ServiceError, TaskService};
pub use store::{StepStatusUpdate, StoreError, TaskStatusUpdate, TaskStore};
pub use task::{StepId, StepStatus, Task, TaskId, TaskStatus, TaskStep, TaskWithSteps};
pub use worker::{TaskWorker, TickReport, WorkerBuilder, WorkerConfig, WorkerHandle};

#[cfg(feature = "http")]
pub use model::HttpModelClient;

#[cfg(feature = "sqlite")]
pub use store::SqliteTaskStore;
