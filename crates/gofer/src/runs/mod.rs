//! Run and task execution models: the execution side of the data model.
//!
//! A run is one execution of a specific pipeline version; a task execution is
//! one container launched for a single task within a run.

pub mod task_execution;

use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::storage;
use crate::variables::Variable;

/// Where the run is within its lifecycle.
#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum State {
    #[default]
    Unknown,

    /// Accepted but not yet executing: preconditions and task pre-checks
    /// happen here.
    Pending,

    /// Task containers are being scheduled and monitored.
    Running,

    /// Every task has resolved; the run will not change again.
    Complete,
}

/// How a completed run turned out.
#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Status {
    /// Only valid while the run has not completed.
    #[default]
    Unknown,

    /// Every task finished without failure.
    Successful,

    /// One or more tasks failed.
    Failed,

    /// One or more tasks were cancelled.
    Cancelled,
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

    /// One or more tasks exited nonzero.
    AbnormalExit,

    /// The scheduler refused or lost one or more task containers.
    SchedulerError,

    /// The run could not start as requested.
    FailedPrecondition,

    /// A user asked for the run to stop.
    UserCancelled,

    /// The system or an operator stopped the run.
    AdminCancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReason {
    pub reason: StatusReasonType,
    pub description: String,
}

/// What started a run.
#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum InitiatorKind {
    #[default]
    Manual,

    /// An extension resolved an event into this run.
    Extension,

    /// Internal, only used for carry-over work during startup.
    Bootstrap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Initiator {
    pub kind: InitiatorKind,

    /// Who or what specifically: a token id, an extension label, or the
    /// recovery marker.
    pub name: String,

    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Run {
    pub namespace_id: String,
    pub pipeline_id: String,

    /// The config version this run executes. Pinned at creation; later
    /// deploys never affect an in-flight run.
    pub pipeline_config_version: u64,

    pub run_id: u64,
    pub started: u64,
    pub ended: u64,
    pub state: State,
    pub status: Status,
    pub status_reason: Option<StatusReason>,
    pub initiator: Initiator,

    /// Run-level variables handed to every task execution.
    pub variables: Vec<Variable>,

    /// Id of the short-lived API token injected for this run, when any task
    /// asked for one.
    pub token_id: Option<String>,

    /// Whether this run's objects have been reaped from the object store.
    pub store_objects_expired: bool,
}

impl Run {
    pub fn new(
        namespace_id: &str,
        pipeline_id: &str,
        pipeline_config_version: u64,
        run_id: u64,
        initiator: Initiator,
        variables: Vec<Variable>,
    ) -> Self {
        Run {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            pipeline_config_version,
            run_id,
            started: crate::epoch_milli(),
            ended: 0,
            state: State::Pending,
            status: Status::Unknown,
            status_reason: None,
            initiator,
            variables,
            token_id: None,
            store_objects_expired: false,
        }
    }
}

impl TryFrom<storage::runs::Run> for Run {
    type Error = anyhow::Error;

    fn try_from(value: storage::runs::Run) -> Result<Self> {
        let state = State::from_str(&value.state).with_context(|| {
            format!("could not parse run state from storage value '{}'", value.state)
        })?;

        let status = Status::from_str(&value.status).with_context(|| {
            format!("could not parse run status from storage value '{}'", value.status)
        })?;

        let status_reason = serde_json::from_str(&value.status_reason)
            .context("could not parse run status_reason from storage")?;

        let initiator = serde_json::from_str(&value.initiator)
            .context("could not parse run initiator from storage")?;

        let variables = serde_json::from_str(&value.variables)
            .context("could not parse run variables from storage")?;

        Ok(Run {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            pipeline_config_version: value.pipeline_config_version as u64,
            run_id: value.run_id as u64,
            started: value.started as u64,
            ended: value.ended as u64,
            state,
            status,
            status_reason,
            initiator,
            variables,
            token_id: value.token_id,
            store_objects_expired: value.store_objects_expired,
        })
    }
}

impl TryFrom<&Run> for storage::runs::Run {
    type Error = anyhow::Error;

    fn try_from(value: &Run) -> Result<Self> {
        Ok(storage::runs::Run {
            namespace_id: value.namespace_id.clone(),
            pipeline_id: value.pipeline_id.clone(),
            pipeline_config_version: value.pipeline_config_version as i64,
            run_id: value.run_id as i64,
            started: value.started as i64,
            ended: value.ended as i64,
            state: value.state.to_string(),
            status: value.status.to_string(),
            status_reason: serde_json::to_string(&value.status_reason)
                .context("could not serialize run status_reason")?,
            initiator: serde_json::to_string(&value.initiator)
                .context("could not serialize run initiator")?,
            variables: serde_json::to_string(&value.variables)
                .context("could not serialize run variables")?,
            token_id: value.token_id.clone(),
            store_objects_expired: value.store_objects_expired,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::{Variable, VariableSource};

    #[test]
    fn storage_round_trip() {
        let mut run = Run::new(
            "default",
            "build",
            3,
            7,
            Initiator {
                kind: InitiatorKind::Extension,
                name: "cron/nightly".into(),
                reason: "schedule fired".into(),
            },
            vec![Variable::new("KEY", "value", VariableSource::ExtensionDynamic)],
        );
        run.status_reason = Some(StatusReason {
            reason: StatusReasonType::AbnormalExit,
            description: "task exited 2".into(),
        });

        let row = storage::runs::Run::try_from(&run).unwrap();
        assert_eq!(row.state, "pending");
        assert_eq!(row.status, "unknown");

        let back = Run::try_from(row).unwrap();
        assert_eq!(back, run);
    }
}
