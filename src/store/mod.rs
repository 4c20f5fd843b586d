//! Durable task and step storage.

pub mod task_store;

#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use task_store::{StepStatusUpdate, StoreError, TaskStatusUpdate, TaskStore};

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteTaskStore;
