//! Engine-level tests driving whole runs against an in-memory scheduler.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{EngineSettings, RunEngine, RunError};
use crate::auth::Auth;
use crate::events::EventBus;
use crate::object_store;
use crate::pipelines::service::PipelineService;
use crate::pipelines::{PipelineDefinition, RequiredParentStatus, Task};
use crate::runs::task_execution::{
    State as TaskState, Status as TaskStatus, StatusReasonType, TaskExecution,
};
use crate::runs::{Initiator, Run, State as RunState, Status as RunStatus};
use crate::scheduler::{
    AttachSession, ContainerState, ContainerStatus, LogStream, Scheduler, SchedulerError,
    StartContainerRequest, StartContainerResponse,
};
use crate::secret_store;
use crate::secret_store::SecretStore;
use crate::storage::{self, Db};
use crate::variables::Variable;

#[derive(Clone, Copy)]
struct MockContainer {
    state: ContainerState,
    exit_code: Option<u8>,
}

#[derive(Default)]
struct MockInner {
    containers: HashMap<String, MockContainer>,
    start_order: Vec<String>,
}

/// Scheduler double. Containers whose task id appears in `auto_exit` finish
/// with that code on the first state poll; everything else keeps running
/// until `finish` or `stop_container`.
struct MockScheduler {
    inner: Mutex<MockInner>,
    auto_exit: HashMap<String, u8>,
}

impl MockScheduler {
    fn new(auto_exit: &[(&str, u8)]) -> Arc<Self> {
        Arc::new(MockScheduler {
            inner: Mutex::new(MockInner::default()),
            auto_exit: auto_exit
                .iter()
                .map(|(task, code)| (task.to_string(), *code))
                .collect(),
        })
    }

    fn task_of(container_id: &str) -> String {
        container_id
            .rsplit('_')
            .next()
            .unwrap_or_default()
            .to_string()
    }

    async fn started(&self, task_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .containers
            .keys()
            .any(|id| Self::task_of(id) == task_id)
    }

    async fn start_order(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.start_order.iter().map(|id| Self::task_of(id)).collect()
    }
}

#[async_trait]
impl Scheduler for MockScheduler {
    async fn start_container(
        &self,
        request: StartContainerRequest,
    ) -> Result<StartContainerResponse, SchedulerError> {
        let mut inner = self.inner.lock().await;
        inner.containers.insert(
            request.id.clone(),
            MockContainer {
                state: ContainerState::Running,
                exit_code: None,
            },
        );
        inner.start_order.push(request.id);
        Ok(StartContainerResponse::default())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().await;
        let container = inner
            .containers
            .get_mut(id)
            .ok_or(SchedulerError::NoSuchContainer)?;
        container.state = ContainerState::Cancelled;
        container.exit_code = Some(130);
        Ok(())
    }

    async fn get_state(&self, id: &str) -> Result<ContainerStatus, SchedulerError> {
        let mut inner = self.inner.lock().await;
        let container = inner
            .containers
            .get_mut(id)
            .ok_or(SchedulerError::NoSuchContainer)?;

        if container.state == ContainerState::Running {
            if let Some(code) = self.auto_exit.get(&Self::task_of(id)) {
                container.state = ContainerState::Exited;
                container.exit_code = Some(*code);
            }
        }

        Ok(ContainerStatus {
            state: container.state,
            exit_code: container.exit_code,
        })
    }

    async fn get_logs(&self, _id: &str) -> Result<LogStream, SchedulerError> {
        Ok(Box::pin(futures::stream::iter(vec![
            Ok(bytes::Bytes::from("hello from task\n")),
            Ok(bytes::Bytes::from("work complete\n")),
        ])))
    }

    async fn attach_container(
        &self,
        _id: &str,
        _command: Vec<String>,
    ) -> Result<AttachSession, SchedulerError> {
        Err(SchedulerError::Internal("attach unsupported in tests".into()))
    }
}

struct Harness {
    _dirs: Vec<tempfile::TempDir>,
    db: Db,
    engine: Arc<RunEngine>,
    scheduler: Arc<MockScheduler>,
    service: PipelineService,
    secret_store: Arc<secret_store::sqlite::Engine>,
    logs_dir: String,
}

async fn harness(scheduler: Arc<MockScheduler>) -> Harness {
    let db_dir = tempfile::tempdir().unwrap();
    let logs_dir = db_dir.path().join("logs").to_str().unwrap().to_string();

    let db = Db::new(db_dir.path().join("gofer.db").to_str().unwrap())
        .await
        .unwrap();

    let mut conn = db.conn().await.unwrap();
    storage::namespaces::insert(
        &mut conn,
        &storage::namespaces::Namespace {
            id: "default".into(),
            name: "Default".into(),
            description: String::new(),
            created: 0,
        },
    )
    .await
    .unwrap();
    drop(conn);

    let shutdown = CancellationToken::new();
    let event_bus = EventBus::new(
        db.clone(),
        Duration::from_secs(3600),
        Duration::from_secs(3600),
        shutdown.clone(),
    );

    let secret_engine = Arc::new(
        secret_store::sqlite::Engine::new(
            db_dir.path().join("secrets.db").to_str().unwrap(),
            &[3u8; 32],
        )
        .await
        .unwrap(),
    );

    let object_engine = Arc::new(
        object_store::sqlite::Engine::new(
            db_dir.path().join("objects.db").to_str().unwrap(),
            10,
        )
        .await
        .unwrap(),
    );

    let auth = Arc::new(Auth::new(db.clone(), 200));
    let service = PipelineService::new(db.clone(), event_bus.clone(), 5, 200);

    let engine = RunEngine::new(
        db.clone(),
        scheduler.clone(),
        object_engine,
        secret_engine.clone(),
        event_bus,
        auth,
        EngineSettings {
            run_parallelism_limit: 0,
            logs_dir: logs_dir.clone(),
            log_retention: 50,
            stop_timeout: Duration::from_secs(5),
            run_object_expiry: 50,
        },
        Arc::new(AtomicBool::new(false)),
        shutdown,
    );

    Harness {
        _dirs: vec![db_dir],
        db,
        engine,
        scheduler,
        service,
        secret_store: secret_engine,
        logs_dir,
    }
}

fn task(id: &str, parents: &[(&str, RequiredParentStatus)]) -> Task {
    Task {
        id: id.into(),
        description: String::new(),
        image: "ubuntu:latest".into(),
        registry_auth: None,
        depends_on: parents
            .iter()
            .map(|(parent, required)| (parent.to_string(), *required))
            .collect(),
        variables: vec![],
        entrypoint: None,
        command: None,
        inject_api_token: false,
    }
}

async fn deploy(harness: &Harness, parallelism: u64, tasks: Vec<Task>) {
    let config = harness
        .service
        .register_config(
            "default",
            PipelineDefinition {
                id: "build".into(),
                name: "Build".into(),
                description: String::new(),
                parallelism,
                tasks,
            },
        )
        .await
        .unwrap();

    harness
        .service
        .deploy("default", "build", config.version)
        .await
        .unwrap();
}

async fn wait_for_run_complete(db: &Db, run_id: u64) -> Run {
    for _ in 0..600 {
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut conn = db.conn().await.unwrap();
        let row = storage::runs::get(&mut conn, "default", "build", run_id as i64)
            .await
            .unwrap();
        let run = Run::try_from(row).unwrap();
        if run.state == RunState::Complete {
            return run;
        }
    }
    panic!("run {run_id} did not complete in time");
}

async fn execution(db: &Db, run_id: u64, task_id: &str) -> TaskExecution {
    let mut conn = db.conn().await.unwrap();
    let row = storage::task_executions::get(&mut conn, "default", "build", run_id as i64, task_id)
        .await
        .unwrap();
    TaskExecution::try_from(row).unwrap()
}

fn manual() -> Initiator {
    Initiator {
        kind: crate::runs::InitiatorKind::Manual,
        name: "tester".into(),
        reason: "test".into(),
    }
}

#[tokio::test]
async fn diamond_dag_runs_in_dependency_order() {
    let scheduler = MockScheduler::new(&[("a", 0), ("b", 0), ("c", 0), ("d", 0)]);
    let harness = harness(scheduler.clone()).await;

    deploy(
        &harness,
        0,
        vec![
            task("a", &[]),
            task("b", &[("a", RequiredParentStatus::Success)]),
            task("c", &[("a", RequiredParentStatus::Success)]),
            task("d", &[
                ("b", RequiredParentStatus::Success),
                ("c", RequiredParentStatus::Success),
            ]),
        ],
    )
    .await;

    let run = harness
        .engine
        .start_run("default", "build", HashMap::new(), manual())
        .await
        .unwrap();

    let finished = wait_for_run_complete(&harness.db, run.run_id).await;
    assert_eq!(finished.status, RunStatus::Successful);
    assert!(finished.ended > 0);

    for id in ["a", "b", "c", "d"] {
        let execution = execution(&harness.db, run.run_id, id).await;
        assert_eq!(execution.state, TaskState::Complete);
        assert_eq!(execution.status, TaskStatus::Successful);
        assert_eq!(execution.exit_code, Some(0));
    }

    let order = scheduler.start_order().await;
    let position = |task: &str| order.iter().position(|t| t == task).unwrap();
    assert_eq!(position("a"), 0);
    assert!(position("b") > position("a"));
    assert!(position("c") > position("a"));
    assert!(position("d") > position("b"));
    assert!(position("d") > position("c"));
}

#[tokio::test]
async fn required_failure_gate_skips_on_success() {
    let scheduler = MockScheduler::new(&[("a", 0)]);
    let harness = harness(scheduler).await;

    deploy(
        &harness,
        0,
        vec![
            task("a", &[]),
            task("cleanup", &[("a", RequiredParentStatus::Failure)]),
        ],
    )
    .await;

    let run = harness
        .engine
        .start_run("default", "build", HashMap::new(), manual())
        .await
        .unwrap();

    let finished = wait_for_run_complete(&harness.db, run.run_id).await;
    // A skip is not a failure.
    assert_eq!(finished.status, RunStatus::Successful);

    let skipped = execution(&harness.db, run.run_id, "cleanup").await;
    assert_eq!(skipped.status, TaskStatus::Skipped);
    let reason = skipped.status_reason.unwrap();
    assert!(reason.description.contains("'a'"), "reason: {}", reason.description);
}

#[tokio::test]
async fn failing_task_fails_run_and_skips_children() {
    let scheduler = MockScheduler::new(&[("a", 2), ("standalone", 0)]);
    let harness = harness(scheduler).await;

    deploy(
        &harness,
        0,
        vec![
            task("a", &[]),
            task("b", &[("a", RequiredParentStatus::Success)]),
            task("standalone", &[]),
        ],
    )
    .await;

    let run = harness
        .engine
        .start_run("default", "build", HashMap::new(), manual())
        .await
        .unwrap();

    let finished = wait_for_run_complete(&harness.db, run.run_id).await;
    assert_eq!(finished.status, RunStatus::Failed);

    let failed = execution(&harness.db, run.run_id, "a").await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.exit_code, Some(2));
    assert_eq!(
        failed.status_reason.unwrap().reason,
        StatusReasonType::AbnormalExit
    );

    let skipped = execution(&harness.db, run.run_id, "b").await;
    assert_eq!(skipped.status, TaskStatus::Skipped);

    let ok = execution(&harness.db, run.run_id, "standalone").await;
    assert_eq!(ok.status, TaskStatus::Successful);
}

#[tokio::test]
async fn missing_secret_fails_resolution_and_cascades() {
    let scheduler = MockScheduler::new(&[]);
    let harness = harness(scheduler.clone()).await;

    let mut with_secret = task("a", &[]);
    with_secret.variables = vec![Variable {
        key: "DB_PW".into(),
        value: "secret{{db_pw}}".into(),
        source: crate::variables::VariableSource::PipelineConfig,
    }];

    deploy(
        &harness,
        0,
        vec![
            with_secret,
            task("b", &[("a", RequiredParentStatus::Success)]),
        ],
    )
    .await;

    let run = harness
        .engine
        .start_run("default", "build", HashMap::new(), manual())
        .await
        .unwrap();

    let finished = wait_for_run_complete(&harness.db, run.run_id).await;
    assert_eq!(finished.status, RunStatus::Failed);

    let failed = execution(&harness.db, run.run_id, "a").await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(
        failed.status_reason.unwrap().reason,
        StatusReasonType::VariableResolutionFailed
    );

    // The scheduler was never asked for the container.
    assert!(!harness.scheduler.started("a").await);

    let skipped = execution(&harness.db, run.run_id, "b").await;
    assert_eq!(skipped.status, TaskStatus::Skipped);
}

#[tokio::test]
async fn stored_secrets_reach_the_container_environment() {
    let scheduler = MockScheduler::new(&[("a", 0)]);
    let harness = harness(scheduler).await;

    harness
        .secret_store
        .put(
            &secret_store::pipeline_secret_key("default", "build", "db_pw"),
            b"hunter2".to_vec(),
            false,
        )
        .await
        .unwrap();

    let mut with_secret = task("a", &[]);
    with_secret.variables = vec![Variable {
        key: "DB_PW".into(),
        value: "secret{{db_pw}}".into(),
        source: crate::variables::VariableSource::PipelineConfig,
    }];

    deploy(&harness, 0, vec![with_secret]).await;

    let run = harness
        .engine
        .start_run("default", "build", HashMap::new(), manual())
        .await
        .unwrap();
    wait_for_run_complete(&harness.db, run.run_id).await;

    let finished = execution(&harness.db, run.run_id, "a").await;
    let resolved: HashMap<String, String> = finished
        .variables
        .iter()
        .map(|v| (v.key.clone(), v.value.clone()))
        .collect();

    assert_eq!(resolved["DB_PW"], "hunter2");
    assert_eq!(resolved["GOFER_PIPELINE_ID"], "build");
    assert_eq!(resolved["GOFER_RUN_ID"], run.run_id.to_string());
    assert_eq!(resolved["GOFER_TASK_ID"], "a");
}

#[tokio::test]
async fn cancellation_across_dag() {
    // a finishes instantly; b and c run until stopped.
    let scheduler = MockScheduler::new(&[("a", 0)]);
    let harness = harness(scheduler.clone()).await;

    deploy(
        &harness,
        0,
        vec![
            task("a", &[]),
            task("b", &[("a", RequiredParentStatus::Success)]),
            task("c", &[("a", RequiredParentStatus::Success)]),
            task("d", &[
                ("b", RequiredParentStatus::Success),
                ("c", RequiredParentStatus::Success),
            ]),
        ],
    )
    .await;

    let run = harness
        .engine
        .start_run("default", "build", HashMap::new(), manual())
        .await
        .unwrap();

    // Wait until b and c containers are live before cancelling.
    for _ in 0..600 {
        if harness.scheduler.started("b").await && harness.scheduler.started("c").await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(harness.scheduler.started("b").await);

    harness
        .engine
        .cancel_run("default", "build", run.run_id, false)
        .await
        .unwrap();

    let finished = wait_for_run_complete(&harness.db, run.run_id).await;
    assert_eq!(finished.status, RunStatus::Cancelled);

    for id in ["b", "c"] {
        let cancelled = execution(&harness.db, run.run_id, id).await;
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(cancelled.exit_code, Some(130));
    }

    let skipped = execution(&harness.db, run.run_id, "d").await;
    assert_eq!(skipped.status, TaskStatus::Skipped);
}

#[tokio::test]
async fn parallelism_limit_rejects_manual_start() {
    // The single task never exits, keeping runs in flight.
    let scheduler = MockScheduler::new(&[]);
    let harness = harness(scheduler).await;

    deploy(&harness, 2, vec![task("a", &[])]).await;

    harness
        .engine
        .start_run("default", "build", HashMap::new(), manual())
        .await
        .unwrap();
    harness
        .engine
        .start_run("default", "build", HashMap::new(), manual())
        .await
        .unwrap();

    let third = harness
        .engine
        .start_run("default", "build", HashMap::new(), manual())
        .await;

    assert!(matches!(third, Err(RunError::ResourceExhausted(2))));
}

#[tokio::test]
async fn disabled_pipeline_refuses_runs() {
    let scheduler = MockScheduler::new(&[("a", 0)]);
    let harness = harness(scheduler).await;

    deploy(&harness, 0, vec![task("a", &[])]).await;
    harness
        .service
        .set_pipeline_state("default", "build", crate::pipelines::PipelineState::Disabled)
        .await
        .unwrap();

    let result = harness
        .engine
        .start_run("default", "build", HashMap::new(), manual())
        .await;

    assert!(matches!(result, Err(RunError::FailedPrecondition(_))));
}

#[tokio::test]
async fn completed_task_logs_end_with_sentinel() {
    let scheduler = MockScheduler::new(&[("a", 0)]);
    let harness = harness(scheduler).await;

    deploy(&harness, 0, vec![task("a", &[])]).await;

    let run = harness
        .engine
        .start_run("default", "build", HashMap::new(), manual())
        .await
        .unwrap();
    wait_for_run_complete(&harness.db, run.run_id).await;

    let path = super::logs::log_path(&harness.logs_dir, "default", "build", run.run_id, "a");

    // Capture finishes asynchronously just after the run resolves.
    let mut content = String::new();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Ok(text) = std::fs::read_to_string(&path) {
            if text.contains(super::logs::GOFER_EOF) {
                content = text;
                break;
            }
        }
    }

    assert!(content.contains("hello from task"));
    assert_eq!(content.matches(super::logs::GOFER_EOF).count(), 1);
    assert!(content.trim_end().ends_with(super::logs::GOFER_EOF));
}

#[tokio::test]
async fn run_variable_overrides_win_over_config() {
    let scheduler = MockScheduler::new(&[("a", 0)]);
    let harness = harness(scheduler).await;

    let mut with_var = task("a", &[]);
    with_var.variables = vec![Variable {
        key: "MODE".into(),
        value: "release".into(),
        source: crate::variables::VariableSource::PipelineConfig,
    }];

    deploy(&harness, 0, vec![with_var]).await;

    let run = harness
        .engine
        .start_run(
            "default",
            "build",
            HashMap::from([("MODE".into(), "debug".into())]),
            manual(),
        )
        .await
        .unwrap();
    wait_for_run_complete(&harness.db, run.run_id).await;

    let finished = execution(&harness.db, run.run_id, "a").await;
    let mode = finished
        .variables
        .iter()
        .find(|v| v.key == "MODE")
        .unwrap();
    assert_eq!(mode.value, "debug");
    assert_eq!(mode.source, crate::variables::VariableSource::RunOptions);
}

#[test]
fn global_limit_caps_pipeline_limit() {
    use super::effective_parallelism;

    assert_eq!(effective_parallelism(0, 0), 0);
    assert_eq!(effective_parallelism(10, 0), 10);
    assert_eq!(effective_parallelism(0, 4), 4);
    assert_eq!(effective_parallelism(10, 4), 4);
    assert_eq!(effective_parallelism(3, 8), 3);
}

#[test]
fn run_status_prefers_cancelled_then_failed() {
    use super::compute_run_status;

    let s = |v: &[&str]| -> Vec<String> { v.iter().map(|s| s.to_string()).collect() };

    assert_eq!(
        compute_run_status(&s(&["successful", "successful"])),
        RunStatus::Successful
    );
    assert_eq!(
        compute_run_status(&s(&["successful", "failed"])),
        RunStatus::Failed
    );
    assert_eq!(
        compute_run_status(&s(&["failed", "cancelled"])),
        RunStatus::Cancelled
    );
    assert_eq!(
        compute_run_status(&s(&["successful", "skipped"])),
        RunStatus::Successful
    );
}

#[tokio::test]
async fn recovery_fails_lost_containers_and_settles_runs() {
    // The scheduler has no record of any container, like after a host wipe.
    let scheduler = MockScheduler::new(&[]);
    let harness = harness(scheduler).await;

    deploy(&harness, 0, vec![task("a", &[]), task("b", &[])]).await;

    // Simulate state left behind by a previous process: a run mid-flight
    // with one container that was running and one task never scheduled.
    let mut conn = harness.db.conn().await.unwrap();
    storage::runs::insert(
        &mut conn,
        &storage::runs::Run {
            namespace_id: "default".into(),
            pipeline_id: "build".into(),
            pipeline_config_version: 1,
            run_id: 1,
            started: 100,
            ended: 0,
            state: "running".into(),
            status: "unknown".into(),
            status_reason: "null".into(),
            initiator: "{\"kind\":\"manual\",\"name\":\"tester\",\"reason\":\"\"}".into(),
            variables: "[]".into(),
            token_id: None,
            store_objects_expired: false,
        },
    )
    .await
    .unwrap();

    for (task_id, state) in [("a", "running"), ("b", "processing")] {
        storage::task_executions::insert(
            &mut conn,
            &storage::task_executions::TaskExecution {
                namespace_id: "default".into(),
                pipeline_id: "build".into(),
                run_id: 1,
                task_id: task_id.into(),
                created: 100,
                started: if state == "running" { 110 } else { 0 },
                ended: 0,
                exit_code: None,
                logs_expired: false,
                logs_removed: false,
                state: state.into(),
                status: "unknown".into(),
                status_reason: "null".into(),
                variables: "[]".into(),
                task: serde_json::to_string(&task(task_id, &[])).unwrap(),
            },
        )
        .await
        .unwrap();
    }
    drop(conn);

    harness.engine.recover().await.unwrap();

    let finished = wait_for_run_complete(&harness.db, 1).await;
    assert_eq!(finished.status, RunStatus::Failed);

    let lost = execution(&harness.db, 1, "a").await;
    assert_eq!(lost.state, TaskState::Complete);
    assert_eq!(lost.status, TaskStatus::Failed);
    let reason = lost.status_reason.unwrap();
    assert_eq!(reason.reason, StatusReasonType::Orphaned);
    assert_eq!(reason.description, "lost");

    let unscheduled = execution(&harness.db, 1, "b").await;
    assert_eq!(unscheduled.status, TaskStatus::Skipped);
}
