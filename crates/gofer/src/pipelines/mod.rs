//! Pipeline metadata, versioned configurations, and their task DAGs.

pub mod dag;
pub mod service;

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::scheduler::RegistryAuth;
use crate::storage;
use crate::variables::{Variable, VariableSource};

#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum PipelineState {
    #[default]
    Unknown,

    /// Runs may be started.
    Active,

    /// New runs are refused until the pipeline is enabled again.
    Disabled,
}

#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum ConfigState {
    #[default]
    Unknown,

    /// Registered but never deployed.
    Unreleased,

    /// The config runs execute against. At most one per pipeline.
    Live,

    /// Previously live, now retired.
    Deprecated,
}

/// What a parent task's final status must be for a child to start.
#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum RequiredParentStatus {
    /// Run once the parent completes, regardless of how it went.
    #[default]
    Any,

    Success,
    Failure,
}

/// A single containerized step within a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub image: String,
    pub registry_auth: Option<RegistryAuth>,
    pub depends_on: HashMap<String, RequiredParentStatus>,
    pub variables: Vec<Variable>,
    pub entrypoint: Option<Vec<String>>,
    pub command: Option<Vec<String>>,

    /// Inject a short-lived client API token so the task can call back into
    /// Gofer without the user wiring credentials themselves.
    pub inject_api_token: bool,
}

/// Identity row for a pipeline. Configuration lives separately and is
/// versioned; metadata is the stable anchor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub created: u64,
    pub modified: u64,
    pub state: PipelineState,
}

impl Metadata {
    pub fn new(namespace_id: &str, pipeline_id: &str) -> Self {
        Metadata {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            created: crate::epoch_milli(),
            modified: crate::epoch_milli(),
            state: PipelineState::Active,
        }
    }
}

impl TryFrom<storage::pipeline_metadata::PipelineMetadata> for Metadata {
    type Error = anyhow::Error;

    fn try_from(value: storage::pipeline_metadata::PipelineMetadata) -> Result<Self> {
        let state = PipelineState::from_str(&value.state).with_context(|| {
            format!("could not parse pipeline state from storage value '{}'", value.state)
        })?;

        Ok(Metadata {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            created: value.created as u64,
            modified: value.modified as u64,
            state,
        })
    }
}

impl From<&Metadata> for storage::pipeline_metadata::PipelineMetadata {
    fn from(value: &Metadata) -> Self {
        storage::pipeline_metadata::PipelineMetadata {
            namespace_id: value.namespace_id.clone(),
            pipeline_id: value.pipeline_id.clone(),
            state: value.state.to_string(),
            created: value.created as i64,
            modified: value.modified as i64,
        }
    }
}

/// One immutable version of a pipeline's configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub version: u64,

    /// Concurrent runs allowed for this pipeline. 0 defers entirely to the
    /// server-wide limit.
    pub parallelism: u64,

    pub name: String,
    pub description: String,
    pub tasks: HashMap<String, Task>,
    pub state: ConfigState,
    pub registered: u64,
    pub deprecated: u64,
}

impl Config {
    /// Build a config from a user submission. The version is a placeholder
    /// until storage assigns the real one at insert.
    pub fn new(namespace_id: &str, pipeline_id: &str, submission: PipelineDefinition) -> Self {
        let mut tasks: HashMap<String, Task> = HashMap::new();
        for mut task in submission.tasks {
            for variable in &mut task.variables {
                variable.source = VariableSource::PipelineConfig;
            }
            tasks.insert(task.id.clone(), task);
        }

        Config {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            version: 0,
            parallelism: submission.parallelism,
            name: submission.name,
            description: submission.description,
            tasks,
            state: ConfigState::Unreleased,
            registered: crate::epoch_milli(),
            deprecated: 0,
        }
    }

    pub fn to_storage(
        &self,
    ) -> Result<(
        storage::pipeline_configs::PipelineConfig,
        Vec<storage::tasks::Task>,
    )> {
        let config = storage::pipeline_configs::PipelineConfig {
            namespace_id: self.namespace_id.clone(),
            pipeline_id: self.pipeline_id.clone(),
            version: self.version as i64,
            parallelism: self.parallelism as i64,
            name: self.name.clone(),
            description: self.description.clone(),
            registered: self.registered as i64,
            deprecated: self.deprecated as i64,
            state: self.state.to_string(),
        };

        let mut tasks = Vec::with_capacity(self.tasks.len());
        for task in self.tasks.values() {
            tasks.push(storage::tasks::Task {
                namespace_id: self.namespace_id.clone(),
                pipeline_id: self.pipeline_id.clone(),
                pipeline_config_version: self.version as i64,
                task_id: task.id.clone(),
                description: task.description.clone(),
                image: task.image.clone(),
                registry_auth: task
                    .registry_auth
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .context("could not serialize task registry_auth")?,
                depends_on: serde_json::to_string(&task.depends_on)
                    .context("could not serialize task depends_on")?,
                variables: serde_json::to_string(&task.variables)
                    .context("could not serialize task variables")?,
                entrypoint: task
                    .entrypoint
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .context("could not serialize task entrypoint")?,
                command: task
                    .command
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .context("could not serialize task command")?,
                inject_api_token: task.inject_api_token,
            });
        }

        Ok((config, tasks))
    }

    pub fn from_storage(
        config: storage::pipeline_configs::PipelineConfig,
        task_rows: Vec<storage::tasks::Task>,
    ) -> Result<Self> {
        let state = ConfigState::from_str(&config.state).with_context(|| {
            format!("could not parse config state from storage value '{}'", config.state)
        })?;

        let mut tasks = HashMap::with_capacity(task_rows.len());
        for row in task_rows {
            let task = Task::from_storage(row)?;
            tasks.insert(task.id.clone(), task);
        }

        Ok(Config {
            namespace_id: config.namespace_id,
            pipeline_id: config.pipeline_id,
            version: config.version as u64,
            parallelism: config.parallelism as u64,
            name: config.name,
            description: config.description,
            tasks,
            state,
            registered: config.registered as u64,
            deprecated: config.deprecated as u64,
        })
    }
}

impl Task {
    pub fn from_storage(row: storage::tasks::Task) -> Result<Self> {
        Ok(Task {
            id: row.task_id,
            description: row.description,
            image: row.image,
            registry_auth: row
                .registry_auth
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("could not parse task registry_auth from storage")?,
            depends_on: serde_json::from_str(&row.depends_on)
                .context("could not parse task depends_on from storage")?,
            variables: serde_json::from_str(&row.variables)
                .context("could not parse task variables from storage")?,
            entrypoint: row
                .entrypoint
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("could not parse task entrypoint from storage")?,
            command: row
                .command
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("could not parse task command from storage")?,
            inject_api_token: row.inject_api_token,
        })
    }
}

/// A fully compiled pipeline as submitted by the user. Pipelines are authored
/// externally; by the time one reaches the API it is this flat structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parallelism: u64,
    pub tasks: Vec<Task>,
}

/// Metadata plus the config a caller asked about; the usual API view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pipeline {
    pub metadata: Metadata,
    pub config: Config,
}
