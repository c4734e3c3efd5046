//! The run engine: turns a pipeline config plus an initiation request into
//! scheduled task containers, tracked through their full lifecycle.
//!
//! One supervisor task owns each run. It launches per-task monitors, gates
//! children on their parents' final statuses, caps in-flight containers, and
//! records every transition durably before publishing it on the event bus.

pub mod logs;
pub mod supervisor;
pub mod variables;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Auth;
use crate::events::{EventBus, Kind};
use crate::object_store::{ObjectStore, Scope};
use crate::pipelines::{self, Pipeline, PipelineState};
use crate::runs::{task_execution, Initiator, InitiatorKind, Run, State as RunState};
use crate::scheduler::Scheduler;
use crate::secret_store::SecretStore;
use crate::storage::{self, Db, StorageError};
use crate::variables::{Variable, VariableSource};

/// Storage writes on the run path retry on these delays before giving up.
const STORAGE_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(300),
    Duration::from_millis(900),
];

/// How long an extension-driven start waits between slot checks when the
/// pipeline is at its parallelism limit.
const SLOT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("run not found")]
    NotFound,

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("pipeline is at its run parallelism limit ({0})")]
    ResourceExhausted(u64),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("unexpected run engine error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for RunError {
    fn from(err: anyhow::Error) -> Self {
        RunError::Internal(format!("{err:#}"))
    }
}

/// The slice of server settings the engine needs.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Server-wide ceiling for concurrent runs per pipeline; 0 = unlimited.
    pub run_parallelism_limit: u64,

    pub logs_dir: String,

    /// Task logs expire once this many newer runs exist; 0 disables expiry.
    pub log_retention: u64,

    /// Grace period for stopping task containers.
    pub stop_timeout: Duration,

    /// Run objects are reaped after this many newer runs; 0 disables.
    pub run_object_expiry: u64,
}

pub struct RunEngine {
    pub(crate) storage: Db,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) secret_store: Arc<dyn SecretStore>,
    pub(crate) event_bus: Arc<EventBus>,
    pub(crate) auth: Arc<Auth>,
    pub(crate) settings: EngineSettings,

    /// Operator switch refusing new runs; mirrors the persisted system flag.
    pub(crate) ignore_run_events: Arc<AtomicBool>,

    /// Cancellation tokens for in-flight runs, keyed by
    /// (namespace, pipeline, run id).
    active_runs: Mutex<HashMap<(String, String, u64), CancellationToken>>,

    /// Self-reference for handing owned engine handles to spawned
    /// supervisors and monitors.
    me: Weak<RunEngine>,

    pub(crate) shutdown: CancellationToken,
}

impl RunEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Db,
        scheduler: Arc<dyn Scheduler>,
        object_store: Arc<dyn ObjectStore>,
        secret_store: Arc<dyn SecretStore>,
        event_bus: Arc<EventBus>,
        auth: Arc<Auth>,
        settings: EngineSettings,
        ignore_run_events: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| RunEngine {
            storage,
            scheduler,
            object_store,
            secret_store,
            event_bus,
            auth,
            settings,
            ignore_run_events,
            active_runs: Mutex::new(HashMap::new()),
            me: me.clone(),
            shutdown,
        })
    }

    /// An owned handle to this engine for spawned tasks. `None` only during
    /// teardown.
    fn handle(&self) -> Option<Arc<RunEngine>> {
        self.me.upgrade()
    }

    /// Start a run manually. Fails fast with `ResourceExhausted` when the
    /// pipeline is already at its effective parallelism limit.
    pub async fn start_run(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        variable_overrides: HashMap<String, String>,
        initiator: Initiator,
    ) -> Result<Run, RunError> {
        let variables: Vec<Variable> = variable_overrides
            .into_iter()
            .map(|(key, value)| Variable {
                key,
                value,
                source: match initiator.kind {
                    InitiatorKind::Extension => VariableSource::ExtensionDynamic,
                    _ => VariableSource::RunOptions,
                },
            })
            .collect();

        self.create_run(namespace_id, pipeline_id, variables, initiator)
            .await
    }

    /// Start a run on behalf of an extension. Instead of failing when the
    /// pipeline is saturated, waits for a slot (or shutdown).
    pub async fn start_run_from_extension(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        dynamic_variables: HashMap<String, String>,
        initiator: Initiator,
    ) -> Result<Run, RunError> {
        let variables: Vec<Variable> = dynamic_variables
            .into_iter()
            .map(|(key, value)| Variable {
                key,
                value,
                source: VariableSource::ExtensionDynamic,
            })
            .collect();

        loop {
            match self
                .create_run(namespace_id, pipeline_id, variables.clone(), initiator.clone())
                .await
            {
                Err(RunError::ResourceExhausted(limit)) => {
                    debug!(
                        namespace = namespace_id,
                        pipeline = pipeline_id,
                        limit = limit,
                        "pipeline saturated; extension-driven run waiting for a slot"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            return Err(RunError::FailedPrecondition("server shutting down".into()));
                        }
                        _ = tokio::time::sleep(SLOT_POLL_INTERVAL) => {}
                    }
                }
                other => return other,
            }
        }
    }

    async fn create_run(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        variables: Vec<Variable>,
        initiator: Initiator,
    ) -> Result<Run, RunError> {
        if self.ignore_run_events.load(Ordering::SeqCst) {
            return Err(RunError::FailedPrecondition(
                "run creation is disabled by the operator (ignore_pipeline_run_events)".into(),
            ));
        }

        let mut tx = self.storage.begin().await?;

        let metadata_row = storage::pipeline_metadata::get(&mut tx, namespace_id, pipeline_id)
            .await
            .map_err(|e| match e {
                StorageError::NotFound => RunError::FailedPrecondition(format!(
                    "pipeline '{pipeline_id}' does not exist in namespace '{namespace_id}'"
                )),
                other => RunError::Storage(other),
            })?;
        let metadata = pipelines::Metadata::try_from(metadata_row)?;

        if metadata.state != PipelineState::Active {
            return Err(RunError::FailedPrecondition(format!(
                "pipeline is {}; enable it before starting runs",
                metadata.state
            )));
        }

        let live_row = storage::pipeline_configs::get_live(&mut tx, namespace_id, pipeline_id)
            .await
            .map_err(|e| match e {
                StorageError::NotFound => RunError::FailedPrecondition(
                    "pipeline has no live configuration; deploy one first".into(),
                ),
                other => RunError::Storage(other),
            })?;
        let config = pipelines::service::load_config(&mut tx, live_row)
            .await
            .map_err(|e| RunError::Internal(e.to_string()))?;

        let effective_limit = effective_parallelism(
            self.settings.run_parallelism_limit,
            config.parallelism,
        );
        if effective_limit > 0 {
            let unfinished =
                storage::runs::list_unfinished(&mut tx, namespace_id, pipeline_id).await?;
            if unfinished.len() as u64 >= effective_limit {
                return Err(RunError::ResourceExhausted(effective_limit));
            }
        }

        let next_run_id = match storage::runs::get_latest(&mut tx, namespace_id, pipeline_id).await
        {
            Ok(latest) => latest.run_id as u64 + 1,
            Err(StorageError::NotFound) => 1,
            Err(e) => return Err(e.into()),
        };

        let mut run = Run::new(
            namespace_id,
            pipeline_id,
            config.version,
            next_run_id,
            initiator,
            variables,
        );

        // Mint the injected API token up front so it rides in with the run.
        if config.tasks.values().any(|task| task.inject_api_token) {
            let created = self
                .auth
                .create_run_token(namespace_id, pipeline_id, next_run_id)
                .await
                .map_err(|e| RunError::Internal(e.to_string()))?;
            run.token_id = Some(created.token.id.clone());
            run.variables.push(Variable {
                key: "GOFER_API_TOKEN".into(),
                value: created.plaintext,
                source: VariableSource::SystemInjected,
            });
        }

        let run_row = storage::runs::Run::try_from(&run)?;
        storage::runs::insert(&mut tx, &run_row).await?;

        tx.commit().await.map_err(StorageError::from)?;

        let _ = self
            .event_bus
            .publish(Kind::StartedRun {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                version: run.pipeline_config_version,
                run_id: run.run_id,
            })
            .await;

        info!(
            namespace = namespace_id,
            pipeline = pipeline_id,
            run = run.run_id,
            version = run.pipeline_config_version,
            initiator = %run.initiator.kind,
            "run created"
        );

        let cancel = self.shutdown.child_token();
        {
            let mut active = self.active_runs.lock().await;
            active.insert(
                (namespace_id.into(), pipeline_id.into(), run.run_id),
                cancel.clone(),
            );
        }

        let engine = self.handle().ok_or_else(|| {
            RunError::Internal("engine is shutting down".into())
        })?;

        let pipeline = Pipeline { metadata, config };
        let supervised_run = run.clone();
        let supervisor_engine = engine.clone();
        tokio::spawn(async move {
            supervisor::Supervisor::new(
                supervisor_engine.clone(),
                pipeline,
                supervised_run.clone(),
                cancel,
            )
            .execute()
            .await;

            let mut active = supervisor_engine.active_runs.lock().await;
            active.remove(&(
                supervised_run.namespace_id.clone(),
                supervised_run.pipeline_id.clone(),
                supervised_run.run_id,
            ));
        });

        // Housekeeping happens off the hot path.
        let (expiry_ns, expiry_pl, expiry_run) =
            (run.namespace_id.clone(), run.pipeline_id.clone(), run.run_id);
        tokio::spawn(async move {
            engine
                .handle_expiry(&expiry_ns, &expiry_pl, expiry_run)
                .await;
        });

        Ok(run)
    }

    /// Cancel one run: stop the containers of every non-terminal task
    /// execution and signal the supervisor so untouched tasks are skipped.
    pub async fn cancel_run(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        run_id: u64,
        force: bool,
    ) -> Result<(), RunError> {
        let mut conn = self.storage.conn().await?;

        // Confirm the run exists before doing anything loud.
        storage::runs::get(&mut conn, namespace_id, pipeline_id, run_id as i64)
            .await
            .map_err(|e| match e {
                StorageError::NotFound => RunError::NotFound,
                other => RunError::Storage(other),
            })?;

        let timeout = if force {
            Duration::from_millis(500)
        } else {
            self.settings.stop_timeout
        };

        {
            let active = self.active_runs.lock().await;
            if let Some(token) =
                active.get(&(namespace_id.into(), pipeline_id.into(), run_id))
            {
                token.cancel();
            }
        }

        let executions =
            storage::task_executions::list(&mut conn, namespace_id, pipeline_id, run_id as i64)
                .await?;

        for row in executions {
            let execution = task_execution::TaskExecution::try_from(row)?;
            if execution.state == task_execution::State::Complete {
                continue;
            }

            if execution.state == task_execution::State::Running {
                let container = crate::scheduler::task_container_id(
                    namespace_id,
                    pipeline_id,
                    run_id,
                    &execution.task_id,
                );
                if let Err(e) = self.scheduler.stop_container(&container, timeout).await {
                    warn!(
                        container = container,
                        error = %e,
                        "could not stop container during run cancellation"
                    );
                }
            }
        }

        info!(
            namespace = namespace_id,
            pipeline = pipeline_id,
            run = run_id,
            force = force,
            "run cancellation requested"
        );

        Ok(())
    }

    /// Cancel every in-flight run of a pipeline. Returns the run ids touched.
    pub async fn cancel_all_runs(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        force: bool,
    ) -> Result<Vec<u64>, RunError> {
        let mut conn = self.storage.conn().await?;
        let unfinished =
            storage::runs::list_unfinished(&mut conn, namespace_id, pipeline_id).await?;
        drop(conn);

        let mut cancelled = Vec::with_capacity(unfinished.len());
        for run in unfinished {
            let run_id = run.run_id as u64;
            self.cancel_run(namespace_id, pipeline_id, run_id, force)
                .await?;
            cancelled.push(run_id);
        }

        Ok(cancelled)
    }

    /// Consume `extension_resolved` events and convert them into runs. Runs
    /// until shutdown. Spawn once at startup.
    pub fn spawn_event_consumer(&self) {
        let Some(engine) = self.handle() else {
            return;
        };

        tokio::spawn(async move {
            let mut subscription = engine.event_bus.subscribe(&["extension_resolved"]);

            loop {
                let event = tokio::select! {
                    _ = engine.shutdown.cancelled() => return,
                    event = subscription.recv() => match event {
                        Some(event) => event,
                        None => return,
                    },
                };

                let Kind::ExtensionResolved {
                    extension_name,
                    namespace_id,
                    pipeline_id,
                    extension_label,
                    variables,
                } = event.kind
                else {
                    continue;
                };

                if engine.ignore_run_events.load(Ordering::SeqCst) {
                    debug!(
                        extension = extension_name,
                        "dropping extension-resolved event; run creation disabled"
                    );
                    continue;
                }

                let subscription_row = {
                    let mut conn = match engine.storage.conn().await {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "could not check subscription for resolved event");
                            continue;
                        }
                    };
                    storage::subscriptions::get(
                        &mut conn,
                        &namespace_id,
                        &pipeline_id,
                        &extension_name,
                        &extension_label,
                    )
                    .await
                };

                match subscription_row {
                    Ok(row) if row.status == "active" => {}
                    Ok(row) => {
                        debug!(
                            extension = extension_name,
                            label = extension_label,
                            status = row.status,
                            "ignoring resolved event for inactive subscription"
                        );
                        continue;
                    }
                    Err(StorageError::NotFound) => {
                        warn!(
                            extension = extension_name,
                            namespace = namespace_id,
                            pipeline = pipeline_id,
                            label = extension_label,
                            "resolved event names an unknown subscription"
                        );
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "could not load subscription for resolved event");
                        continue;
                    }
                }

                let initiator = Initiator {
                    kind: InitiatorKind::Extension,
                    name: format!("{extension_name}/{extension_label}"),
                    reason: "extension resolved an event into a run".into(),
                };

                if let Err(e) = engine
                    .start_run_from_extension(&namespace_id, &pipeline_id, variables, initiator)
                    .await
                {
                    warn!(
                        namespace = namespace_id,
                        pipeline = pipeline_id,
                        extension = extension_name,
                        error = %e,
                        "could not start extension-driven run"
                    );
                }
            }
        });
    }

    /// Reconcile runs left non-terminal by a previous process. Containers
    /// that are gone with no recorded exit fail with reason "lost"; still
    /// running containers are re-monitored to completion.
    pub async fn recover(&self) -> Result<(), RunError> {
        let mut conn = self.storage.conn().await?;
        let unfinished = storage::runs::list_unfinished_all(&mut conn).await?;
        drop(conn);

        if unfinished.is_empty() {
            return Ok(());
        }

        info!(count = unfinished.len(), "recovering non-terminal runs");

        let engine = self.handle().ok_or_else(|| {
            RunError::Internal("engine is shutting down".into())
        })?;

        for run_row in unfinished {
            let run = Run::try_from(run_row)?;
            let engine = engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.recover_run(run).await {
                    error!(error = %e, "run recovery failed");
                }
            });
        }

        Ok(())
    }

    async fn recover_run(&self, run: Run) -> Result<(), RunError> {
        let mut conn = self.storage.conn().await?;
        let executions = storage::task_executions::list(
            &mut conn,
            &run.namespace_id,
            &run.pipeline_id,
            run.run_id as i64,
        )
        .await?;
        drop(conn);

        let mut still_running = Vec::new();

        for row in executions {
            let execution = task_execution::TaskExecution::try_from(row)?;
            if execution.state == task_execution::State::Complete {
                continue;
            }

            match execution.state {
                task_execution::State::Running => {
                    let container = crate::scheduler::task_container_id(
                        &run.namespace_id,
                        &run.pipeline_id,
                        run.run_id,
                        &execution.task_id,
                    );

                    match self.scheduler.get_state(&container).await {
                        Ok(status) => match status.state {
                            crate::scheduler::ContainerState::Running
                            | crate::scheduler::ContainerState::Restarting
                            | crate::scheduler::ContainerState::Paused => {
                                still_running.push((execution, container));
                            }
                            crate::scheduler::ContainerState::Exited => {
                                let (status_value, reason) = match status.exit_code {
                                    Some(0) => (task_execution::Status::Successful, None),
                                    Some(code) => (
                                        task_execution::Status::Failed,
                                        Some(task_execution::StatusReason {
                                            reason: task_execution::StatusReasonType::AbnormalExit,
                                            description: format!("container exited with code {code}"),
                                        }),
                                    ),
                                    None => (
                                        task_execution::Status::Failed,
                                        Some(task_execution::StatusReason {
                                            reason: task_execution::StatusReasonType::Orphaned,
                                            description: "container exited with no recorded code"
                                                .into(),
                                        }),
                                    ),
                                };
                                self.finalize_execution_row(&execution, status_value, reason, status.exit_code)
                                    .await;
                            }
                            crate::scheduler::ContainerState::Cancelled => {
                                self.finalize_execution_row(
                                    &execution,
                                    task_execution::Status::Cancelled,
                                    Some(task_execution::StatusReason {
                                        reason: task_execution::StatusReasonType::Cancelled,
                                        description: "container was stopped".into(),
                                    }),
                                    status.exit_code,
                                )
                                .await;
                            }
                            _ => {
                                still_running.push((execution, container));
                            }
                        },
                        Err(_) => {
                            self.finalize_execution_row(
                                &execution,
                                task_execution::Status::Failed,
                                Some(task_execution::StatusReason {
                                    reason: task_execution::StatusReasonType::Orphaned,
                                    description: "lost".into(),
                                }),
                                None,
                            )
                            .await;
                        }
                    }
                }
                _ => {
                    // Never reached the scheduler before the restart.
                    self.finalize_execution_row(
                        &execution,
                        task_execution::Status::Skipped,
                        Some(task_execution::StatusReason {
                            reason: task_execution::StatusReasonType::Orphaned,
                            description: "lost during server restart".into(),
                        }),
                        None,
                    )
                    .await;
                }
            }
        }

        // Watch any survivors to completion, then settle the run.
        let engine = self.handle().ok_or_else(|| {
            RunError::Internal("engine is shutting down".into())
        })?;

        for (execution, container) in still_running {
            let monitor_engine = engine.clone();
            tokio::spawn(async move {
                monitor_engine.monitor_recovered(execution, container).await;
            });
        }

        tokio::spawn(async move {
            engine.settle_recovered_run(run).await;
        });

        Ok(())
    }

    async fn monitor_recovered(
        &self,
        execution: task_execution::TaskExecution,
        container: String,
    ) {
        let mut backoff = Duration::from_secs(1);

        loop {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(15));

            match self.scheduler.get_state(&container).await {
                Ok(status) => match status.state {
                    crate::scheduler::ContainerState::Exited => {
                        let (status_value, reason) = match status.exit_code {
                            Some(0) => (task_execution::Status::Successful, None),
                            Some(code) => (
                                task_execution::Status::Failed,
                                Some(task_execution::StatusReason {
                                    reason: task_execution::StatusReasonType::AbnormalExit,
                                    description: format!("container exited with code {code}"),
                                }),
                            ),
                            None => (
                                task_execution::Status::Failed,
                                Some(task_execution::StatusReason {
                                    reason: task_execution::StatusReasonType::Orphaned,
                                    description: "container exited with no recorded code".into(),
                                }),
                            ),
                        };
                        self.finalize_execution_row(&execution, status_value, reason, status.exit_code)
                            .await;
                        return;
                    }
                    crate::scheduler::ContainerState::Cancelled => {
                        self.finalize_execution_row(
                            &execution,
                            task_execution::Status::Cancelled,
                            Some(task_execution::StatusReason {
                                reason: task_execution::StatusReasonType::Cancelled,
                                description: "container was stopped".into(),
                            }),
                            status.exit_code,
                        )
                        .await;
                        return;
                    }
                    _ => continue,
                },
                Err(_) => {
                    self.finalize_execution_row(
                        &execution,
                        task_execution::Status::Failed,
                        Some(task_execution::StatusReason {
                            reason: task_execution::StatusReasonType::Orphaned,
                            description: "lost".into(),
                        }),
                        None,
                    )
                    .await;
                    return;
                }
            }
        }
    }

    /// Poll a recovered run until every execution is terminal, then record
    /// the run's final state.
    async fn settle_recovered_run(&self, run: Run) {
        loop {
            tokio::time::sleep(Duration::from_secs(2)).await;

            let mut conn = match self.storage.conn().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "could not open connection while settling recovered run");
                    continue;
                }
            };

            let rows = match storage::task_executions::list(
                &mut conn,
                &run.namespace_id,
                &run.pipeline_id,
                run.run_id as i64,
            )
            .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    error!(error = %e, "could not list executions while settling recovered run");
                    continue;
                }
            };

            let all_complete = rows.iter().all(|row| row.state == "complete");
            if !all_complete {
                continue;
            }

            let statuses: Vec<String> = rows.into_iter().map(|row| row.status).collect();
            let status = compute_run_status(&statuses);

            let fields = storage::runs::UpdatableFields {
                state: Some(RunState::Complete.to_string()),
                status: Some(status.to_string()),
                ended: Some(crate::epoch_milli() as i64),
                ..Default::default()
            };

            if let Err(e) = storage::runs::update(
                &mut conn,
                &run.namespace_id,
                &run.pipeline_id,
                run.run_id as i64,
                fields,
            )
            .await
            {
                error!(error = %e, "could not finalize recovered run");
            }

            let _ = self
                .event_bus
                .publish(Kind::CompletedRun {
                    namespace_id: run.namespace_id.clone(),
                    pipeline_id: run.pipeline_id.clone(),
                    version: run.pipeline_config_version,
                    run_id: run.run_id,
                    status: status.to_string(),
                })
                .await;

            info!(
                namespace = run.namespace_id,
                pipeline = run.pipeline_id,
                run = run.run_id,
                status = %status,
                "recovered run settled"
            );
            return;
        }
    }

    async fn finalize_execution_row(
        &self,
        execution: &task_execution::TaskExecution,
        status: task_execution::Status,
        reason: Option<task_execution::StatusReason>,
        exit_code: Option<u8>,
    ) {
        let reason_json = serde_json::to_string(&reason).unwrap_or_else(|_| "null".into());

        let result = self
            .update_execution_with_retry(
                &execution.namespace_id,
                &execution.pipeline_id,
                execution.run_id,
                &execution.task_id,
                storage::task_executions::UpdatableFields {
                    state: Some(task_execution::State::Complete.to_string()),
                    status: Some(status.to_string()),
                    status_reason: Some(reason_json),
                    exit_code: exit_code.map(i64::from),
                    ended: Some(crate::epoch_milli() as i64),
                    ..Default::default()
                },
            )
            .await;

        if let Err(e) = result {
            error!(
                task = execution.task_id,
                error = %e,
                "could not record task execution final state"
            );
        }

        let _ = self
            .event_bus
            .publish(Kind::CompletedTaskExecution {
                namespace_id: execution.namespace_id.clone(),
                pipeline_id: execution.pipeline_id.clone(),
                run_id: execution.run_id,
                task_id: execution.task_id.clone(),
                status: status.to_string(),
            })
            .await;
    }

    /// Update a task execution row, retrying transient storage failures with
    /// the fixed backoff schedule. Persistent failure is surfaced to the
    /// caller, which halts further transitions for that run.
    pub(crate) async fn update_execution_with_retry(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        run_id: u64,
        task_id: &str,
        fields: storage::task_executions::UpdatableFields,
    ) -> Result<(), StorageError> {
        let mut last_error = None;

        for (attempt, delay) in STORAGE_RETRY_DELAYS.iter().enumerate() {
            let result = async {
                let mut conn = self.storage.conn().await?;
                storage::task_executions::update(
                    &mut conn,
                    namespace_id,
                    pipeline_id,
                    run_id as i64,
                    task_id,
                    fields.clone(),
                )
                .await
            }
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(StorageError::NotFound) => return Err(StorageError::NotFound),
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        task = task_id,
                        error = %e,
                        "storage write failed; retrying"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(*delay).await;
                }
            }
        }

        Err(last_error.unwrap_or(StorageError::Internal("retries exhausted".into())))
    }

    /// Reap run-scoped objects and expired log files for runs that have
    /// fallen out of their retention windows.
    async fn handle_expiry(&self, namespace_id: &str, pipeline_id: &str, current_run: u64) {
        if self.settings.run_object_expiry > 0 && current_run > self.settings.run_object_expiry {
            let cutoff = current_run - self.settings.run_object_expiry;

            let scope = Scope::Run {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                run_id: cutoff,
            };

            match self.object_store.delete_scope(&scope).await {
                Ok(0) => {}
                Ok(count) => {
                    debug!(
                        namespace = namespace_id,
                        pipeline = pipeline_id,
                        run = cutoff,
                        count = count,
                        "reaped expired run objects"
                    );
                }
                Err(e) => warn!(error = %e, "could not reap run objects"),
            }

            let mut conn = match self.storage.conn().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "could not open connection for object expiry");
                    return;
                }
            };

            if let Err(e) = storage::runs::update(
                &mut conn,
                namespace_id,
                pipeline_id,
                cutoff as i64,
                storage::runs::UpdatableFields {
                    store_objects_expired: Some(true),
                    ..Default::default()
                },
            )
            .await
            {
                if !matches!(e, StorageError::NotFound) {
                    warn!(error = %e, "could not flag run objects expired");
                }
            }
        }

        if self.settings.log_retention > 0 && current_run > self.settings.log_retention {
            let cutoff = current_run - self.settings.log_retention;

            let mut conn = match self.storage.conn().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "could not open connection for log expiry");
                    return;
                }
            };

            let expired = match storage::task_executions::expire_logs_before(
                &mut conn,
                namespace_id,
                pipeline_id,
                cutoff as i64,
            )
            .await
            {
                Ok(expired) => expired,
                Err(e) => {
                    warn!(error = %e, "could not expire task logs");
                    return;
                }
            };

            for row in expired {
                let path = logs::log_path(
                    &self.settings.logs_dir,
                    namespace_id,
                    pipeline_id,
                    row.run_id as u64,
                    &row.task_id,
                );
                if let Err(e) = logs::remove(&path).await {
                    warn!(path = %path.display(), error = %e, "could not remove expired log file");
                    continue;
                }

                if let Err(e) = storage::task_executions::update(
                    &mut conn,
                    namespace_id,
                    pipeline_id,
                    row.run_id,
                    &row.task_id,
                    storage::task_executions::UpdatableFields {
                        logs_removed: Some(true),
                        ..Default::default()
                    },
                )
                .await
                {
                    warn!(error = %e, "could not flag task logs removed");
                }
            }
        }
    }

    /// Path of a task execution's log file under this engine's log dir.
    pub fn task_log_path(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        run_id: u64,
        task_id: &str,
    ) -> PathBuf {
        logs::log_path(
            &self.settings.logs_dir,
            namespace_id,
            pipeline_id,
            run_id,
            task_id,
        )
    }
}

/// The effective run parallelism for a pipeline: the global limit is the
/// ceiling, the pipeline's own setting can only tighten it.
pub fn effective_parallelism(global_limit: u64, pipeline_limit: u64) -> u64 {
    match (global_limit, pipeline_limit) {
        (0, limit) => limit,
        (limit, 0) => limit,
        (global, pipeline) => global.min(pipeline),
    }
}

/// Run status from its task execution statuses: any cancellation taints the
/// run as cancelled, otherwise any failure fails it.
pub fn compute_run_status(task_statuses: &[String]) -> crate::runs::Status {
    let cancelled = task_execution::Status::Cancelled.to_string();
    let failed = task_execution::Status::Failed.to_string();

    if task_statuses.iter().any(|status| *status == cancelled) {
        crate::runs::Status::Cancelled
    } else if task_statuses.iter().any(|status| *status == failed) {
        crate::runs::Status::Failed
    } else {
        crate::runs::Status::Successful
    }
}

