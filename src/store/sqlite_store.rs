//! SQLite implementation of TaskStore.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;

use super::task_store::{StepStatusUpdate, StoreError, TaskStatusUpdate, TaskStore};
use crate::pipeline::StepTemplate;
use crate::task::{StepId, StepStatus, Task, TaskId, TaskStatus, TaskStep, TaskWithSteps};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    task_type TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('PENDING', 'RUNNING', 'SUCCESS', 'FAILED')),
    payload_json TEXT NOT NULL,
    result_json TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_steps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES tasks(id),
    step_order INTEGER NOT NULL,
    step_key TEXT NOT NULL,
    step_label TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('PENDING', 'RUNNING', 'SUCCESS', 'FAILED')),
    started_at TEXT,
    finished_at TEXT,
    result_json TEXT,
    error_message TEXT,
    UNIQUE (task_id, step_order)
);

CREATE INDEX IF NOT EXISTS idx_tasks_status_created ON tasks(status, created_at);
CREATE INDEX IF NOT EXISTS idx_task_steps_task ON task_steps(task_id, step_order);
"#;

const TASK_COLUMNS: &str =
    "id, task_type, status, payload_json, result_json, error_message, created_at, updated_at";

const STEP_COLUMNS: &str = "id, task_id, step_order, step_key, step_label, status, started_at, \
     finished_at, result_json, error_message";

type TaskRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
);

type StepRow = (
    i64,
    String,
    i64,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

/// SQLite-backed task store.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Create a new SqliteTaskStore.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run migrations to create the task tables.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .map_err(storage)?;
            }
        }
        Ok(())
    }

    async fn fetch_steps(&self, task_id: &TaskId) -> Result<Vec<TaskStep>, StoreError> {
        let query = format!(
            "SELECT {STEP_COLUMNS} FROM task_steps WHERE task_id = ? ORDER BY step_order ASC"
        );
        let rows = sqlx::query_as::<_, StepRow>(&query)
            .bind(task_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        rows.into_iter().map(step_from_row).collect()
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_task(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        steps: &[StepTemplate],
    ) -> Result<TaskWithSteps, StoreError> {
        let payload_str = serde_json::to_string(&payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let id = TaskId::generate();
        let now = format_ts(Utc::now());

        let mut tx = self.pool.begin().await.map_err(storage)?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, task_type, status, payload_json, result_json, error_message, created_at, updated_at)
            VALUES (?, ?, 'PENDING', ?, NULL, NULL, ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(task_type)
        .bind(&payload_str)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO task_steps (task_id, step_order, step_key, step_label, status)
                VALUES (?, ?, ?, ?, 'PENDING')
                "#,
            )
            .bind(id.as_str())
            .bind(step.order as i64)
            .bind(step.key)
            .bind(step.label)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        // Dropping `tx` on an early return above rolls everything back.
        tx.commit().await.map_err(storage)?;

        self.get_task(&id).await
    }

    async fn get_task(&self, id: &TaskId) -> Result<TaskWithSteps, StoreError> {
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or_else(|| StoreError::task_not_found(id))?;

        let task = task_from_row(row)?;
        let steps = self.fetch_steps(id).await?;
        Ok(TaskWithSteps { task, steps })
    }

    async fn get_step(&self, id: StepId) -> Result<TaskStep, StoreError> {
        let query = format!("SELECT {STEP_COLUMNS} FROM task_steps WHERE id = ?");
        let row = sqlx::query_as::<_, StepRow>(&query)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or_else(|| StoreError::step_not_found(id))?;

        step_from_row(row)
    }

    async fn list_runnable(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        // rowid breaks ties between tasks created within the same microsecond
        let query = format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks
            WHERE status IN ('PENDING', 'RUNNING')
            ORDER BY created_at ASC, rowid ASC
            LIMIT ?
            "#
        );
        let rows = sqlx::query_as::<_, TaskRow>(&query)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        rows.into_iter().map(task_from_row).collect()
    }

    async fn write_task_status(
        &self,
        id: &TaskId,
        update: TaskStatusUpdate,
    ) -> Result<(), StoreError> {
        let result_str = update
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let outcome = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, error_message = ?, result_json = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.error_message)
        .bind(result_str)
        .bind(format_ts(Utc::now()))
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if outcome.rows_affected() == 0 {
            return Err(StoreError::task_not_found(id));
        }
        Ok(())
    }

    async fn write_step_status(
        &self,
        id: StepId,
        update: StepStatusUpdate,
    ) -> Result<(), StoreError> {
        let result_str = update
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let outcome = sqlx::query(
            r#"
            UPDATE task_steps
            SET status = ?,
                started_at = COALESCE(started_at, ?),
                finished_at = COALESCE(?, finished_at),
                result_json = COALESCE(?, result_json),
                error_message = COALESCE(?, error_message)
            WHERE id = ?
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.started_at.map(format_ts))
        .bind(update.finished_at.map(format_ts))
        .bind(result_str)
        .bind(update.error_message)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if outcome.rows_affected() == 0 {
            return Err(StoreError::step_not_found(id));
        }
        Ok(())
    }

    async fn claim_pending(&self, id: &TaskId) -> Result<bool, StoreError> {
        let outcome = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'RUNNING', error_message = NULL, result_json = NULL, updated_at = ?
            WHERE id = ? AND status = 'PENDING'
            "#,
        )
        .bind(format_ts(Utc::now()))
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(outcome.rows_affected() == 1)
    }
}

fn storage(e: sqlx::Error) -> StoreError {
    StoreError::Storage(e.to_string())
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Deserialization(format!("bad timestamp '{raw}': {e}")))
}

fn parse_json(raw: &str) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Deserialization(e.to_string()))
}

fn task_from_row(row: TaskRow) -> Result<Task, StoreError> {
    let (id, task_type, status, payload, result, error_message, created_at, updated_at) = row;
    Ok(Task {
        id: TaskId(id),
        task_type,
        status: status
            .parse::<TaskStatus>()
            .map_err(|e| StoreError::Deserialization(e.to_string()))?,
        payload: parse_json(&payload)?,
        result: result.as_deref().map(parse_json).transpose()?,
        error_message,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn step_from_row(row: StepRow) -> Result<TaskStep, StoreError> {
    let (
        id,
        task_id,
        step_order,
        step_key,
        label,
        status,
        started_at,
        finished_at,
        result,
        error_message,
    ) = row;
    Ok(TaskStep {
        id: StepId(id),
        task_id: TaskId(task_id),
        step_order: u32::try_from(step_order)
            .map_err(|_| StoreError::Deserialization(format!("bad step order {step_order}")))?,
        step_key,
        label,
        status: status
            .parse::<StepStatus>()
            .map_err(|e| StoreError::Deserialization(e.to_string()))?,
        started_at: started_at.as_deref().map(parse_ts).transpose()?,
        finished_at: finished_at.as_deref().map(parse_ts).transpose()?,
        result: result.as_deref().map(parse_json).transpose()?,
        error_message,
    })
}
