use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::pipelines::Task;
use crate::storage;
use crate::variables::Variable;

#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum State {
    #[default]
    Unknown,

    /// Created; waiting for dependencies to resolve.
    Processing,

    /// Dependencies satisfied; waiting on the scheduler to take the
    /// container.
    Waiting,

    /// The container is running.
    Running,

    Complete,
}

#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Status {
    #[default]
    Unknown,

    /// Container or scheduling problem.
    Failed,

    /// Exited zero.
    Successful,

    /// Stopped at a user's request.
    Cancelled,

    /// Never ran because its dependencies were not met.
    Skipped,
}

#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum StatusReasonType {
    #[default]
    Unknown,

    /// Nonzero exit code.
    AbnormalExit,

    /// The scheduler errored while handling the container.
    SchedulerError,

    /// Task setup failed; bad parameters or unresolvable inputs.
    FailedPrecondition,

    /// A `secret{{...}}` reference named a secret that does not exist.
    VariableResolutionFailed,

    /// User invoked cancellation.
    Cancelled,

    /// The container disappeared without a recorded exit.
    Orphaned,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReason {
    pub reason: StatusReasonType,
    pub description: String,
}

/// One execution of a single task inside a run: the most specific unit in
/// the namespace -> pipeline -> run -> task execution hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskExecution {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub run_id: u64,
    pub task_id: String,
    pub created: u64,
    pub started: u64,
    pub ended: u64,
    pub exit_code: Option<u8>,

    /// Logs past retention; the file may still exist but is due removal.
    pub logs_expired: bool,

    /// Log file removed, by user request or retention.
    pub logs_removed: bool,

    pub state: State,
    pub status: Status,
    pub status_reason: Option<StatusReason>,

    /// The fully resolved variables this execution ran with.
    pub variables: Vec<Variable>,

    /// Snapshot of the task definition at execution time.
    pub task: Task,
}

impl TaskExecution {
    pub fn new(namespace_id: &str, pipeline_id: &str, run_id: u64, task: Task) -> Self {
        TaskExecution {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            run_id,
            task_id: task.id.clone(),
            created: crate::epoch_milli(),
            started: 0,
            ended: 0,
            exit_code: None,
            logs_expired: false,
            logs_removed: false,
            state: State::Processing,
            status: Status::Unknown,
            status_reason: None,
            variables: vec![],
            task,
        }
    }
}

impl TryFrom<storage::task_executions::TaskExecution> for TaskExecution {
    type Error = anyhow::Error;

    fn try_from(value: storage::task_executions::TaskExecution) -> Result<Self> {
        let state = State::from_str(&value.state).with_context(|| {
            format!(
                "could not parse task execution state from storage value '{}'",
                value.state
            )
        })?;

        let status = Status::from_str(&value.status).with_context(|| {
            format!(
                "could not parse task execution status from storage value '{}'",
                value.status
            )
        })?;

        let status_reason = serde_json::from_str(&value.status_reason)
            .context("could not parse task execution status_reason from storage")?;

        let variables = serde_json::from_str(&value.variables)
            .context("could not parse task execution variables from storage")?;

        let task = serde_json::from_str(&value.task)
            .context("could not parse task execution task snapshot from storage")?;

        Ok(TaskExecution {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            run_id: value.run_id as u64,
            task_id: value.task_id,
            created: value.created as u64,
            started: value.started as u64,
            ended: value.ended as u64,
            exit_code: value.exit_code.and_then(|code| u8::try_from(code).ok()),
            logs_expired: value.logs_expired,
            logs_removed: value.logs_removed,
            state,
            status,
            status_reason,
            variables,
            task,
        })
    }
}

impl TryFrom<&TaskExecution> for storage::task_executions::TaskExecution {
    type Error = anyhow::Error;

    fn try_from(value: &TaskExecution) -> Result<Self> {
        Ok(storage::task_executions::TaskExecution {
            namespace_id: value.namespace_id.clone(),
            pipeline_id: value.pipeline_id.clone(),
            run_id: value.run_id as i64,
            task_id: value.task_id.clone(),
            created: value.created as i64,
            started: value.started as i64,
            ended: value.ended as i64,
            exit_code: value.exit_code.map(i64::from),
            logs_expired: value.logs_expired,
            logs_removed: value.logs_removed,
            state: value.state.to_string(),
            status: value.status.to_string(),
            status_reason: serde_json::to_string(&value.status_reason)
                .context("could not serialize task execution status_reason")?,
            variables: serde_json::to_string(&value.variables)
                .context("could not serialize task execution variables")?,
            task: serde_json::to_string(&value.task)
                .context("could not serialize task execution task snapshot")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task {
            id: "compile".into(),
            description: String::new(),
            image: "rust:latest".into(),
            registry_auth: None,
            depends_on: Default::default(),
            variables: vec![],
            entrypoint: None,
            command: Some(vec!["cargo".into(), "build".into()]),
            inject_api_token: false,
        }
    }

    #[test]
    fn storage_round_trip() {
        let mut execution = TaskExecution::new("default", "build", 2, sample_task());
        execution.state = State::Complete;
        execution.status = Status::Failed;
        execution.exit_code = Some(2);
        execution.status_reason = Some(StatusReason {
            reason: StatusReasonType::AbnormalExit,
            description: "exit code 2".into(),
        });

        let row = storage::task_executions::TaskExecution::try_from(&execution).unwrap();
        assert_eq!(row.state, "complete");
        assert_eq!(row.exit_code, Some(2));

        let back = TaskExecution::try_from(row).unwrap();
        assert_eq!(back, execution);
    }
}
