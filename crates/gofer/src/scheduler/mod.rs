//! Abstraction over a container runtime.
//!
//! The run engine and extension registry talk to containers exclusively
//! through the [`Scheduler`] trait, so the runtime can be swapped without
//! touching orchestration logic. The only production implementation is
//! Docker.

pub mod docker;

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("container not found")]
    NoSuchContainer,

    #[error("image '{0}' not found or could not be pulled")]
    NoSuchImage(String),

    #[error("container name '{0}' matched more than one container")]
    AmbiguousContainerName(String),

    #[error("container runtime unreachable: {0}")]
    Unavailable(String),

    #[error("unexpected scheduler error: {0}")]
    Internal(String),
}

/// Credentials for pulling from a private registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryAuth {
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Clone)]
pub struct StartContainerRequest {
    /// Caller-chosen unique name for the container.
    pub id: String,

    pub image: String,

    /// Environment variables injected into the container.
    pub variables: HashMap<String, String>,

    pub registry_auth: Option<RegistryAuth>,

    /// Pull the image even when it exists locally.
    pub always_pull: bool,

    /// Container port to publish on an ephemeral localhost port. The
    /// published address comes back as `url` in the response.
    pub networking: Option<u16>,

    pub entrypoint: Option<Vec<String>>,
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct StartContainerResponse {
    /// Address for the published port when networking was requested.
    pub url: Option<String>,
}

/// Runtime state of a container as the scheduler reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Unknown,
    Running,
    Paused,
    Restarting,
    Exited,

    /// The container stopped because we asked it to. Distinguished from
    /// `Exited` so a user cancellation is not reported as a task failure.
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct ContainerStatus {
    pub state: ContainerState,
    pub exit_code: Option<u8>,
}

/// Combined stdout/stderr stream of a container. Terminates when the
/// container exits.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<Bytes, SchedulerError>> + Send>>;

/// An interactive exec session inside a running container.
pub struct AttachSession {
    pub input: Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
    pub output: LogStream,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Start a container, pulling the image first when needed.
    async fn start_container(
        &self,
        request: StartContainerRequest,
    ) -> Result<StartContainerResponse, SchedulerError>;

    /// Stop a container: graceful signal first, then a kill after `timeout`.
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), SchedulerError>;

    async fn get_state(&self, id: &str) -> Result<ContainerStatus, SchedulerError>;

    async fn get_logs(&self, id: &str) -> Result<LogStream, SchedulerError>;

    /// Open an interactive command inside a running container. Optional debug
    /// surface; implementations may refuse.
    async fn attach_container(
        &self,
        id: &str,
        command: Vec<String>,
    ) -> Result<AttachSession, SchedulerError>;
}

/// Container name for a task execution. The format keeps names unique per
/// execution and greppable by operators.
pub fn task_container_id(
    namespace_id: &str,
    pipeline_id: &str,
    run_id: u64,
    task_id: &str,
) -> String {
    format!("{namespace_id}_{pipeline_id}_{run_id}_{task_id}")
}

/// Container name for a long-running extension.
pub fn extension_container_id(name: &str) -> String {
    format!("extension_{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_ids_are_stable() {
        assert_eq!(
            task_container_id("default", "build", 12, "compile"),
            "default_build_12_compile"
        );
        assert_eq!(extension_container_id("cron"), "extension_cron");
    }
}
