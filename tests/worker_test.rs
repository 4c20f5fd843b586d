//! Tests for the periodic task worker.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use stageflow::{
    CreateTaskRequest, ModelClient, ModelClientError, SqliteTaskStore, StepId, StepOutput,
    StepStatus, StepStatusUpdate, StepTemplate, StoreError, StubModelClient, Task, TaskId,
    TaskService, TaskStatus, TaskStatusUpdate, TaskStep, TaskStore, TaskWithSteps, TickReport,
    WorkerBuilder,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const STEP_KEYS: [&str; 6] = [
    "image_processing",
    "image_model_call",
    "image_result_saved",
    "prompt_building",
    "llm_call",
    "final_result",
];

async fn setup_store() -> SqliteTaskStore {
    // A single connection keeps the in-memory database consistent while a
    // spawned worker and the test poll it at the same time.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();
    let store = SqliteTaskStore::new(pool);
    store.run_migrations().await.unwrap();
    store
}

async fn setup_service() -> Arc<TaskService<SqliteTaskStore>> {
    Arc::new(TaskService::new(setup_store().await))
}

async fn create<S: TaskStore>(service: &TaskService<S>) -> TaskId {
    service
        .create_task(CreateTaskRequest {
            input_text: Some("hello".to_string()),
            ..CreateTaskRequest::for_user("u1")
        })
        .await
        .unwrap()
        .id
}

fn statuses(task: &TaskWithSteps) -> Vec<StepStatus> {
    task.steps.iter().map(|s| s.status).collect()
}

async fn wait_for_status<S: TaskStore>(service: &TaskService<S>, id: &TaskId, want: TaskStatus) {
    for _ in 0..500 {
        if service.load_task(id).await.unwrap().task.status == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} never reached {want}");
}

/// Fails one step with a remote error, delegates the rest to the stub.
struct FailingClient {
    fail_on: &'static str,
    stub: StubModelClient,
    attempts: AtomicUsize,
}

impl FailingClient {
    fn new(fail_on: &'static str) -> Self {
        Self {
            fail_on,
            stub: StubModelClient::new(),
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ModelClient for FailingClient {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn run_step(
        &self,
        step_key: &str,
        task: &Task,
        step: &TaskStep,
    ) -> Result<StepOutput, ModelClientError> {
        if step_key == self.fail_on {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            return Err(ModelClientError::remote("quota exceeded").with_remote_code("QUOTA"));
        }
        self.stub.run_step(step_key, task, step).await
    }
}

struct PanickingClient;

#[async_trait]
impl ModelClient for PanickingClient {
    fn name(&self) -> &'static str {
        "panicking"
    }

    async fn run_step(
        &self,
        _step_key: &str,
        _task: &Task,
        _step: &TaskStep,
    ) -> Result<StepOutput, ModelClientError> {
        panic!("model exploded");
    }
}

/// Records every step key it is asked to run.
#[derive(Default)]
struct RecordingClient {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl ModelClient for RecordingClient {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn run_step(
        &self,
        step_key: &str,
        _task: &Task,
        _step: &TaskStep,
    ) -> Result<StepOutput, ModelClientError> {
        self.calls.lock().unwrap().push(step_key.to_string());
        let mut out = Map::new();
        out.insert("ran".to_string(), json!(step_key));
        Ok(out)
    }
}

/// Store whose runnable scan fails a given number of times and which can
/// refuse to record failed steps.
struct FlakyStore {
    inner: SqliteTaskStore,
    failing_scans: AtomicUsize,
    reject_step_failures: bool,
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn create_task(
        &self,
        task_type: &str,
        payload: Value,
        steps: &[StepTemplate],
    ) -> Result<TaskWithSteps, StoreError> {
        self.inner.create_task(task_type, payload, steps).await
    }

    async fn get_task(&self, id: &TaskId) -> Result<TaskWithSteps, StoreError> {
        self.inner.get_task(id).await
    }

    async fn get_step(&self, id: StepId) -> Result<TaskStep, StoreError> {
        self.inner.get_step(id).await
    }

    async fn list_runnable(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        let failed = self
            .failing_scans
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::Storage("database is unavailable".to_string()));
        }
        self.inner.list_runnable(limit).await
    }

    async fn write_task_status(
        &self,
        id: &TaskId,
        update: TaskStatusUpdate,
    ) -> Result<(), StoreError> {
        self.inner.write_task_status(id, update).await
    }

    async fn write_step_status(
        &self,
        id: StepId,
        update: StepStatusUpdate,
    ) -> Result<(), StoreError> {
        if self.reject_step_failures && update.status == StepStatus::Failed {
            return Err(StoreError::Storage("disk I/O error".to_string()));
        }
        self.inner.write_step_status(id, update).await
    }

    async fn claim_pending(&self, id: &TaskId) -> Result<bool, StoreError> {
        self.inner.claim_pending(id).await
    }
}

#[tokio::test]
async fn test_stub_pipeline_completes_in_two_ticks() {
    let service = setup_service().await;
    let id = create(&service).await;

    let worker = WorkerBuilder::new(service.clone(), Arc::new(StubModelClient::new())).build();

    let report = worker.tick().await.unwrap();
    assert_eq!(
        report,
        TickReport {
            scanned: 1,
            started: 1,
            ..TickReport::default()
        }
    );

    let started = service.load_task(&id).await.unwrap();
    assert_eq!(started.task.status, TaskStatus::Running);
    assert_eq!(started.steps[0].status, StepStatus::Running);
    assert!(started.steps[1..].iter().all(|s| s.status == StepStatus::Pending));

    let report = worker.tick().await.unwrap();
    assert_eq!(report.succeeded, 1);

    let done = service.load_task(&id).await.unwrap();
    assert_eq!(done.task.status, TaskStatus::Success);
    assert_eq!(done.task.error_message, None);
    assert!(statuses(&done).iter().all(|s| *s == StepStatus::Success));
    for step in &done.steps {
        assert!(step.started_at.is_some());
        assert!(step.finished_at >= step.started_at);
    }

    let result = done.task.result.unwrap();
    let result = result.as_object().unwrap();
    assert_eq!(result.len(), 6);
    for (i, key) in STEP_KEYS.iter().enumerate() {
        assert_eq!(result[*key]["stepKey"], json!(key));
        assert_eq!(result[*key]["message"], json!("stub"));
        assert_eq!(result[*key]["stepOrder"], json!(i + 1));
        assert_eq!(result[*key]["taskType"], json!("moments_optimize"));
        assert_eq!(result[*key]["inputEcho"]["inputText"], json!("hello"));
    }

    // Nothing left to do
    let report = worker.tick().await.unwrap();
    assert_eq!(report, TickReport::default());
}

#[tokio::test]
async fn test_model_error_fails_step_and_task() {
    let service = setup_service().await;
    let id = create(&service).await;

    let client = Arc::new(FailingClient::new("prompt_building"));
    let worker = WorkerBuilder::new(service.clone(), client.clone()).build();

    worker.tick().await.unwrap();
    let report = worker.tick().await.unwrap();
    assert_eq!(report.failed, 1);

    let task = service.load_task(&id).await.unwrap();
    assert_eq!(task.task.status, TaskStatus::Failed);
    assert_eq!(
        task.task.error_message.as_deref(),
        Some("Step failed: quota exceeded")
    );
    assert_eq!(task.task.result, None);
    assert_eq!(
        statuses(&task),
        vec![
            StepStatus::Success,
            StepStatus::Success,
            StepStatus::Success,
            StepStatus::Failed,
            StepStatus::Pending,
            StepStatus::Pending,
        ]
    );
    assert_eq!(task.steps[3].error_message.as_deref(), Some("quota exceeded"));
    assert!(task.steps[3].finished_at.is_some());
    assert_eq!(task.steps[4].started_at, None);

    // A failed task is never picked up again
    let report = worker.tick().await.unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(client.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_panicking_client_reports_generic_error() {
    let service = setup_service().await;
    let id = create(&service).await;

    let worker = WorkerBuilder::new(service.clone(), Arc::new(PanickingClient)).build();

    worker.tick().await.unwrap();
    let report = worker.tick().await.unwrap();
    assert_eq!(report.failed, 1);

    let task = service.load_task(&id).await.unwrap();
    assert_eq!(task.task.status, TaskStatus::Failed);
    assert_eq!(task.task.error_message.as_deref(), Some("Unexpected error"));
    assert_eq!(task.steps[0].status, StepStatus::Failed);
    assert_eq!(task.steps[0].error_message.as_deref(), Some("Unexpected error"));
}

#[tokio::test]
async fn test_interrupted_task_resumes_without_duplicates() {
    let service = setup_service().await;
    let id = create(&service).await;

    // Simulate a worker that died after finishing step 1 and starting step 2
    service.mark_task_running(&id).await.unwrap();
    let first = service.mark_first_step_running(&id).await.unwrap().unwrap();
    let mut earlier = Map::new();
    earlier.insert("from".to_string(), json!("previous run"));
    service.mark_step_success(first.id, earlier.clone()).await.unwrap();
    let second = service.get_next_pending_step(&id).await.unwrap().unwrap();
    let second = service.mark_step_running(second.id).await.unwrap();

    let client = Arc::new(RecordingClient::default());
    let worker = WorkerBuilder::new(service.clone(), client.clone()).build();

    let report = worker.tick().await.unwrap();
    assert_eq!(report.succeeded, 1);

    let calls = client.calls.lock().unwrap().clone();
    assert_eq!(calls, STEP_KEYS[1..].to_vec());

    let task = service.load_task(&id).await.unwrap();
    assert_eq!(task.task.status, TaskStatus::Success);
    assert_eq!(task.steps[1].started_at, second.started_at);

    let result = task.task.result.unwrap();
    let result = result.as_object().unwrap();
    assert_eq!(result.len(), 6);
    assert_eq!(result["image_processing"], Value::Object(earlier));
    assert_eq!(result["final_result"]["ran"], json!("final_result"));
}

#[tokio::test]
async fn test_running_task_with_failed_step_is_failed() {
    let service = setup_service().await;
    let id = create(&service).await;

    service.mark_task_running(&id).await.unwrap();
    let first = service.mark_first_step_running(&id).await.unwrap().unwrap();
    service.mark_step_failed(first.id, "boom").await.unwrap();

    let client = Arc::new(RecordingClient::default());
    let worker = WorkerBuilder::new(service.clone(), client.clone()).build();

    let report = worker.tick().await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(client.calls.lock().unwrap().is_empty());

    let task = service.load_task(&id).await.unwrap().task;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error_message.as_deref(), Some("Step failed: boom"));
}

#[tokio::test]
async fn test_scan_limit_bounds_each_tick() {
    let service = setup_service().await;
    let a = create(&service).await;
    let b = create(&service).await;
    let c = create(&service).await;

    let worker = WorkerBuilder::new(service.clone(), Arc::new(StubModelClient::new()))
        .scan_limit(2)
        .build();

    let report = worker.tick().await.unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.started, 2);
    assert_eq!(
        service.load_task(&c).await.unwrap().task.status,
        TaskStatus::Pending
    );

    let report = worker.tick().await.unwrap();
    assert_eq!(report.succeeded, 2);
    for id in [&a, &b] {
        assert_eq!(service.load_task(id).await.unwrap().task.status, TaskStatus::Success);
    }

    let report = worker.tick().await.unwrap();
    assert_eq!(report.started, 1);
}

#[tokio::test]
async fn test_failed_scan_is_reported_and_recovered() {
    let store = FlakyStore {
        inner: setup_store().await,
        failing_scans: AtomicUsize::new(2),
        reject_step_failures: false,
    };
    let service = Arc::new(TaskService::new(store));
    let id = create(&service).await;

    let worker = WorkerBuilder::new(service.clone(), Arc::new(StubModelClient::new()))
        .interval(Duration::from_millis(10))
        .build();

    assert!(worker.tick().await.is_err());

    let handle = worker.spawn();
    wait_for_status(&service, &id, TaskStatus::Success).await;
    handle.stop().await;
}

#[tokio::test]
async fn test_model_failure_is_not_retried_when_step_write_fails() {
    let store = FlakyStore {
        inner: setup_store().await,
        failing_scans: AtomicUsize::new(0),
        reject_step_failures: true,
    };
    let service = Arc::new(TaskService::new(store));
    let id = create(&service).await;

    let client = Arc::new(FailingClient::new("image_processing"));
    let worker = WorkerBuilder::new(service.clone(), client.clone()).build();

    worker.tick().await.unwrap();
    let report = worker.tick().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.errored, 0);

    let task = service.load_task(&id).await.unwrap();
    assert_eq!(task.task.status, TaskStatus::Failed);
    assert_eq!(
        task.task.error_message.as_deref(),
        Some("Step failed: quota exceeded")
    );
    // The step write was refused, so the step is still marked RUNNING
    assert_eq!(task.steps[0].status, StepStatus::Running);

    for _ in 0..2 {
        let report = worker.tick().await.unwrap();
        assert_eq!(report.scanned, 0);
    }
    assert_eq!(client.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_spawned_worker_drives_task_to_success() {
    let service = setup_service().await;

    let handle = WorkerBuilder::new(service.clone(), Arc::new(StubModelClient::new()))
        .interval(Duration::from_millis(10))
        .build()
        .spawn();

    let id = create(&service).await;
    wait_for_status(&service, &id, TaskStatus::Success).await;

    handle.stop().await;
}

#[tokio::test]
async fn test_first_tick_is_immediate_and_stop_interrupts_sleep() {
    let service = setup_service().await;
    let id = create(&service).await;

    let handle = WorkerBuilder::new(service.clone(), Arc::new(StubModelClient::new()))
        .interval(Duration::from_secs(3600))
        .build()
        .spawn();

    wait_for_status(&service, &id, TaskStatus::Running).await;
    assert!(!handle.is_finished());

    tokio::time::timeout(Duration::from_secs(5), handle.stop())
        .await
        .expect("worker did not stop");
}
