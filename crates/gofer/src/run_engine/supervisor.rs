//! Per-run supervision: one supervisor task owns a run from first task
//! execution to final status.
//!
//! The supervisor launches a worker task per task execution once its parents
//! have completed with the required statuses. Workers report back over a
//! channel; the supervisor is the only writer of run and task execution rows
//! while the run is live, which keeps read-then-write updates race free.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{compute_run_status, logs, variables, RunEngine};
use crate::events::Kind;
use crate::pipelines::{Pipeline, RequiredParentStatus, Task};
use crate::runs::task_execution::{
    State as TaskState, Status as TaskStatus, StatusReason, StatusReasonType, TaskExecution,
};
use crate::runs::{Run, State as RunState};
use crate::scheduler::{task_container_id, ContainerState, StartContainerRequest};
use crate::storage;
use crate::variables::Variable;

/// First delay between container state polls; doubles up to the cap.
const MONITOR_BACKOFF_START: Duration = Duration::from_secs(1);
const MONITOR_BACKOFF_CAP: Duration = Duration::from_secs(15);

/// What a worker reports when its task execution reaches a terminal state.
#[derive(Debug)]
struct TaskOutcome {
    task_id: String,
    status: TaskStatus,
}

pub struct Supervisor {
    engine: Arc<RunEngine>,
    pipeline: Pipeline,
    run: Run,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(
        engine: Arc<RunEngine>,
        pipeline: Pipeline,
        run: Run,
        cancel: CancellationToken,
    ) -> Self {
        Supervisor {
            engine,
            pipeline,
            run,
            cancel,
        }
    }

    /// Drive the run to completion. Never panics; a run that cannot make
    /// progress is left non-terminal for startup recovery.
    pub async fn execute(self) {
        let task_count = self.pipeline.config.tasks.len();
        if task_count == 0 {
            self.finalize_run(&HashMap::new()).await;
            return;
        }

        // Every task starts in Processing so the full set is visible to
        // queries before anything is scheduled.
        let mut statuses: HashMap<String, (TaskState, TaskStatus)> = HashMap::new();
        for task in self.pipeline.config.tasks.values() {
            let execution = TaskExecution::new(
                &self.run.namespace_id,
                &self.run.pipeline_id,
                self.run.run_id,
                task.clone(),
            );

            let row = match storage::task_executions::TaskExecution::try_from(&execution) {
                Ok(row) => row,
                Err(e) => {
                    error!(task = task.id, error = %e, "could not serialize task execution");
                    return;
                }
            };

            let insert = async {
                let mut conn = self.engine.storage.conn().await?;
                storage::task_executions::insert(&mut conn, &row).await
            }
            .await;

            if let Err(e) = insert {
                error!(task = task.id, error = %e, "could not insert task execution; halting run");
                return;
            }

            let _ = self
                .engine
                .event_bus
                .publish(Kind::CreatedTaskExecution {
                    namespace_id: self.run.namespace_id.clone(),
                    pipeline_id: self.run.pipeline_id.clone(),
                    run_id: self.run.run_id,
                    task_id: task.id.clone(),
                })
                .await;

            statuses.insert(task.id.clone(), (TaskState::Processing, TaskStatus::Unknown));
        }

        if !self
            .update_run(storage::runs::UpdatableFields {
                state: Some(RunState::Running.to_string()),
                ..Default::default()
            })
            .await
        {
            return;
        }

        // Caps in-flight task containers for this run's pipeline.
        let permits = if self.pipeline.config.parallelism > 0 {
            self.pipeline.config.parallelism as usize
        } else {
            Semaphore::MAX_PERMITS
        };
        let semaphore = Arc::new(Semaphore::new(permits));

        let (done_tx, mut done_rx) = mpsc::channel::<TaskOutcome>(task_count);
        let mut cancel_handled = false;

        loop {
            if self.cancel.is_cancelled() && !cancel_handled {
                cancel_handled = true;
                self.skip_unstarted(&mut statuses, "upstream cancelled").await;
            }

            // Launch (or skip) every task whose parents have all resolved.
            // Skipping can unblock more children, so sweep until a fixed
            // point.
            let mut progressed = true;
            while progressed {
                progressed = false;

                let ready: Vec<String> = statuses
                    .iter()
                    .filter(|(_, (state, _))| *state == TaskState::Processing)
                    .filter(|(task_id, _)| {
                        let task = &self.pipeline.config.tasks[task_id.as_str()];
                        task.depends_on.keys().all(|parent| {
                            statuses
                                .get(parent)
                                .map(|(state, _)| *state == TaskState::Complete)
                                .unwrap_or(false)
                        })
                    })
                    .map(|(task_id, _)| task_id.clone())
                    .collect();

                for task_id in ready {
                    if cancel_handled {
                        break;
                    }
                    progressed = true;

                    let task = self.pipeline.config.tasks[&task_id].clone();
                    if let Some((parent, required)) = self.violated_gate(&task, &statuses) {
                        let (_, parent_status) = statuses[&parent];
                        self.finalize_skipped(
                            &task_id,
                            &format!(
                                "parent '{parent}' finished {parent_status} but this task requires {required}"
                            ),
                        )
                        .await;
                        statuses.insert(task_id, (TaskState::Complete, TaskStatus::Skipped));
                        continue;
                    }

                    statuses.insert(task_id.clone(), (TaskState::Waiting, TaskStatus::Unknown));
                    self.spawn_worker(task, semaphore.clone(), done_tx.clone());
                }
            }

            if statuses
                .values()
                .all(|(state, _)| *state == TaskState::Complete)
            {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled(), if !cancel_handled => continue,
                outcome = done_rx.recv() => {
                    let Some(outcome) = outcome else {
                        error!("task worker channel closed unexpectedly; halting run");
                        return;
                    };
                    debug!(task = outcome.task_id, status = %outcome.status, "task execution resolved");
                    statuses.insert(outcome.task_id, (TaskState::Complete, outcome.status));
                }
            }
        }

        self.finalize_run(&statuses).await;
    }

    /// The first dependency whose required status the parent's actual status
    /// violates, if any. Parents are known Complete when this is called.
    fn violated_gate(
        &self,
        task: &Task,
        statuses: &HashMap<String, (TaskState, TaskStatus)>,
    ) -> Option<(String, RequiredParentStatus)> {
        for (parent, required) in &task.depends_on {
            let (_, parent_status) = statuses.get(parent)?;
            let satisfied = match required {
                RequiredParentStatus::Any => true,
                RequiredParentStatus::Success => *parent_status == TaskStatus::Successful,
                RequiredParentStatus::Failure => *parent_status == TaskStatus::Failed,
            };
            if !satisfied {
                return Some((parent.clone(), *required));
            }
        }
        None
    }

    /// Mark every task that has not been handed to the scheduler as skipped.
    async fn skip_unstarted(
        &self,
        statuses: &mut HashMap<String, (TaskState, TaskStatus)>,
        reason: &str,
    ) {
        let unstarted: Vec<String> = statuses
            .iter()
            .filter(|(_, (state, _))| *state == TaskState::Processing)
            .map(|(task_id, _)| task_id.clone())
            .collect();

        for task_id in unstarted {
            self.finalize_skipped(&task_id, reason).await;
            statuses.insert(task_id, (TaskState::Complete, TaskStatus::Skipped));
        }
    }

    async fn finalize_skipped(&self, task_id: &str, description: &str) {
        self.record_terminal(
            task_id,
            TaskStatus::Skipped,
            Some(StatusReason {
                reason: StatusReasonType::FailedPrecondition,
                description: description.into(),
            }),
            None,
        )
        .await;
    }

    /// Spawn the worker that owns one task execution: variable resolution,
    /// container start, log capture, and state monitoring.
    fn spawn_worker(
        &self,
        task: Task,
        semaphore: Arc<Semaphore>,
        done_tx: mpsc::Sender<TaskOutcome>,
    ) {
        let engine = self.engine.clone();
        let run = self.run.clone();
        let pipeline_version = self.pipeline.config.version;
        let cancel = self.cancel.clone();
        let supervisor_view = SupervisorView {
            engine: self.engine.clone(),
            run: self.run.clone(),
        };

        tokio::spawn(async move {
            let task_id = task.id.clone();

            // Respect the pipeline's container cap before touching the
            // scheduler. Cancellation while queued skips the task.
            let _permit = tokio::select! {
                _ = cancel.cancelled() => {
                    supervisor_view
                        .record_terminal(
                            &task_id,
                            TaskStatus::Skipped,
                            Some(StatusReason {
                                reason: StatusReasonType::FailedPrecondition,
                                description: "upstream cancelled".into(),
                            }),
                            None,
                        )
                        .await;
                    let _ = done_tx.send(TaskOutcome { task_id, status: TaskStatus::Skipped }).await;
                    return;
                }
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            // Resolve the task's effective variable set.
            let mut run_variables: Vec<Variable> = run.variables.clone();
            if !task.inject_api_token {
                run_variables.retain(|v| v.key != "GOFER_API_TOKEN");
            }

            let mut resolved = variables::merge(vec![
                variables::system_variables(
                    &run.pipeline_id,
                    pipeline_version,
                    run.run_id,
                    &task_id,
                ),
                task.variables.clone(),
                run_variables,
            ]);

            if let Err(e) = variables::interpolate_secrets(
                engine.secret_store.as_ref(),
                &run.namespace_id,
                &run.pipeline_id,
                &mut resolved,
            )
            .await
            {
                warn!(task = task_id, error = %e, "variable resolution failed");
                supervisor_view
                    .record_terminal(
                        &task_id,
                        TaskStatus::Failed,
                        Some(StatusReason {
                            reason: StatusReasonType::VariableResolutionFailed,
                            description: e.to_string(),
                        }),
                        None,
                    )
                    .await;
                let _ = done_tx.send(TaskOutcome { task_id, status: TaskStatus::Failed }).await;
                return;
            }

            let variables_json =
                serde_json::to_string(&resolved).unwrap_or_else(|_| "[]".into());

            if engine
                .update_execution_with_retry(
                    &run.namespace_id,
                    &run.pipeline_id,
                    run.run_id,
                    &task_id,
                    storage::task_executions::UpdatableFields {
                        state: Some(TaskState::Waiting.to_string()),
                        variables: Some(variables_json),
                        ..Default::default()
                    },
                )
                .await
                .is_err()
            {
                error!(task = task_id, "could not record waiting state; halting task");
                return;
            }

            if cancel.is_cancelled() {
                supervisor_view
                    .record_terminal(
                        &task_id,
                        TaskStatus::Skipped,
                        Some(StatusReason {
                            reason: StatusReasonType::FailedPrecondition,
                            description: "upstream cancelled".into(),
                        }),
                        None,
                    )
                    .await;
                let _ = done_tx.send(TaskOutcome { task_id, status: TaskStatus::Skipped }).await;
                return;
            }

            let container =
                task_container_id(&run.namespace_id, &run.pipeline_id, run.run_id, &task_id);

            let env: HashMap<String, String> = resolved
                .iter()
                .map(|v| (v.key.clone(), v.value.clone()))
                .collect();

            let start = engine
                .scheduler
                .start_container(StartContainerRequest {
                    id: container.clone(),
                    image: task.image.clone(),
                    variables: env,
                    registry_auth: task.registry_auth.clone(),
                    always_pull: false,
                    networking: None,
                    entrypoint: task.entrypoint.clone(),
                    command: task.command.clone(),
                })
                .await;

            if let Err(e) = start {
                warn!(task = task_id, error = %e, "scheduler refused task container");
                supervisor_view
                    .record_terminal(
                        &task_id,
                        TaskStatus::Failed,
                        Some(StatusReason {
                            reason: StatusReasonType::SchedulerError,
                            description: e.to_string(),
                        }),
                        None,
                    )
                    .await;
                let _ = done_tx.send(TaskOutcome { task_id, status: TaskStatus::Failed }).await;
                return;
            }

            if engine
                .update_execution_with_retry(
                    &run.namespace_id,
                    &run.pipeline_id,
                    run.run_id,
                    &task_id,
                    storage::task_executions::UpdatableFields {
                        state: Some(TaskState::Running.to_string()),
                        started: Some(crate::epoch_milli() as i64),
                        ..Default::default()
                    },
                )
                .await
                .is_err()
            {
                error!(task = task_id, "could not record running state; halting task");
                return;
            }

            let _ = engine
                .event_bus
                .publish(Kind::StartedTaskExecution {
                    namespace_id: run.namespace_id.clone(),
                    pipeline_id: run.pipeline_id.clone(),
                    run_id: run.run_id,
                    task_id: task_id.clone(),
                })
                .await;

            // Log capture runs beside the monitor and finishes on its own
            // when the container's output closes.
            match engine.scheduler.get_logs(&container).await {
                Ok(stream) => {
                    let path = engine.task_log_path(
                        &run.namespace_id,
                        &run.pipeline_id,
                        run.run_id,
                        &task_id,
                    );
                    tokio::spawn(async move {
                        logs::capture(stream, &path).await;
                    });
                }
                Err(e) => {
                    warn!(task = task_id, error = %e, "could not open log stream");
                }
            }

            // Poll container state until it resolves.
            let mut backoff = MONITOR_BACKOFF_START;
            let (status, reason, exit_code) = loop {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MONITOR_BACKOFF_CAP);

                match engine.scheduler.get_state(&container).await {
                    Ok(status) => match status.state {
                        ContainerState::Exited => match status.exit_code {
                            Some(0) => break (TaskStatus::Successful, None, Some(0)),
                            Some(code) => {
                                break (
                                    TaskStatus::Failed,
                                    Some(StatusReason {
                                        reason: StatusReasonType::AbnormalExit,
                                        description: format!(
                                            "container exited with code {code}"
                                        ),
                                    }),
                                    Some(code),
                                )
                            }
                            None => {
                                break (
                                    TaskStatus::Failed,
                                    Some(StatusReason {
                                        reason: StatusReasonType::AbnormalExit,
                                        description: "container exited with no recorded code"
                                            .into(),
                                    }),
                                    None,
                                )
                            }
                        },
                        ContainerState::Cancelled => {
                            break (
                                TaskStatus::Cancelled,
                                Some(StatusReason {
                                    reason: StatusReasonType::Cancelled,
                                    description: "container was stopped".into(),
                                }),
                                status.exit_code,
                            )
                        }
                        _ => continue,
                    },
                    Err(e) => {
                        warn!(task = task_id, container = container, error = %e, "lost container");
                        break (
                            TaskStatus::Failed,
                            Some(StatusReason {
                                reason: StatusReasonType::Orphaned,
                                description: "lost".into(),
                            }),
                            None,
                        );
                    }
                }
            };

            supervisor_view
                .record_terminal(&task_id, status, reason, exit_code)
                .await;
            let _ = done_tx.send(TaskOutcome { task_id, status }).await;
        });
    }

    async fn record_terminal(
        &self,
        task_id: &str,
        status: TaskStatus,
        reason: Option<StatusReason>,
        exit_code: Option<u8>,
    ) {
        SupervisorView {
            engine: self.engine.clone(),
            run: self.run.clone(),
        }
        .record_terminal(task_id, status, reason, exit_code)
        .await;
    }

    async fn finalize_run(&self, statuses: &HashMap<String, (TaskState, TaskStatus)>) {
        let status_strings: Vec<String> = statuses
            .values()
            .map(|(_, status)| status.to_string())
            .collect();
        let status = compute_run_status(&status_strings);

        let status_reason = match status {
            crate::runs::Status::Cancelled => Some(crate::runs::StatusReason {
                reason: crate::runs::StatusReasonType::UserCancelled,
                description: "one or more task executions were cancelled".into(),
            }),
            crate::runs::Status::Failed => Some(crate::runs::StatusReason {
                reason: crate::runs::StatusReasonType::AbnormalExit,
                description: "one or more task executions failed".into(),
            }),
            _ => None,
        };

        self.update_run(storage::runs::UpdatableFields {
            state: Some(RunState::Complete.to_string()),
            status: Some(status.to_string()),
            status_reason: Some(
                serde_json::to_string(&status_reason).unwrap_or_else(|_| "null".into()),
            ),
            ended: Some(crate::epoch_milli() as i64),
            ..Default::default()
        })
        .await;

        let _ = self
            .engine
            .event_bus
            .publish(Kind::CompletedRun {
                namespace_id: self.run.namespace_id.clone(),
                pipeline_id: self.run.pipeline_id.clone(),
                version: self.run.pipeline_config_version,
                run_id: self.run.run_id,
                status: status.to_string(),
            })
            .await;

        info!(
            namespace = self.run.namespace_id,
            pipeline = self.run.pipeline_id,
            run = self.run.run_id,
            status = %status,
            "run complete"
        );
    }

    /// Update the run row with the engine's retry schedule. Returns false
    /// when storage stayed unavailable; callers halt and leave recovery to
    /// startup reconciliation.
    async fn update_run(&self, fields: storage::runs::UpdatableFields) -> bool {
        for delay in super::STORAGE_RETRY_DELAYS {
            let result = async {
                let mut conn = self.engine.storage.conn().await?;
                storage::runs::update(
                    &mut conn,
                    &self.run.namespace_id,
                    &self.run.pipeline_id,
                    self.run.run_id as i64,
                    fields.clone(),
                )
                .await
            }
            .await;

            match result {
                Ok(()) => return true,
                Err(e) => {
                    warn!(run = self.run.run_id, error = %e, "run update failed; retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        error!(
            run = self.run.run_id,
            "run update failed after retries; leaving run for startup recovery"
        );
        false
    }
}

/// The pieces of supervisor state a worker needs to record terminal task
/// results: shared with spawned workers by value.
struct SupervisorView {
    engine: Arc<RunEngine>,
    run: Run,
}

impl SupervisorView {
    async fn record_terminal(
        &self,
        task_id: &str,
        status: TaskStatus,
        reason: Option<StatusReason>,
        exit_code: Option<u8>,
    ) {
        let reason_json = serde_json::to_string(&reason).unwrap_or_else(|_| "null".into());

        let result = self
            .engine
            .update_execution_with_retry(
                &self.run.namespace_id,
                &self.run.pipeline_id,
                self.run.run_id,
                task_id,
                storage::task_executions::UpdatableFields {
                    state: Some(TaskState::Complete.to_string()),
                    status: Some(status.to_string()),
                    status_reason: Some(reason_json),
                    exit_code: exit_code.map(i64::from),
                    ended: Some(crate::epoch_milli() as i64),
                    ..Default::default()
                },
            )
            .await;

        if let Err(e) = result {
            error!(task = task_id, error = %e, "could not record terminal task state");
        }

        let _ = self
            .engine
            .event_bus
            .publish(Kind::CompletedTaskExecution {
                namespace_id: self.run.namespace_id.clone(),
                pipeline_id: self.run.pipeline_id.clone(),
                run_id: self.run.run_id,
                task_id: task_id.to_string(),
                status: status.to_string(),
            })
            .await;
    }
}
