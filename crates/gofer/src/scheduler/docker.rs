//! Docker implementation of the [`Scheduler`] trait, built on bollard.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    AttachSession, ContainerState, ContainerStatus, LogStream, Scheduler, SchedulerError,
    StartContainerRequest, StartContainerResponse,
};

/// How often the cancellation map drops entries older than the window.
const CANCELLATION_REAP_INTERVAL: Duration = Duration::from_secs(3600);

pub struct Engine {
    docker: Docker,

    /// Containers we asked to stop, with when we asked. Consulted by
    /// `get_state` so a stop at our request reads as `Cancelled` instead of
    /// `Exited`. Entries older than `cancellation_window` are reaped.
    cancellations: Arc<Mutex<HashMap<String, Instant>>>,

    cancellation_window: Duration,
}

impl Engine {
    pub async fn new(
        prune: bool,
        prune_interval: Duration,
        cancellation_window: Duration,
        shutdown: CancellationToken,
    ) -> Result<Self, SchedulerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SchedulerError::Unavailable(e.to_string()))?;

        // Fail fast when the daemon isn't there rather than at first run.
        docker
            .ping()
            .await
            .map_err(|e| SchedulerError::Unavailable(e.to_string()))?;

        let cancellations: Arc<Mutex<HashMap<String, Instant>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let reap_map = cancellations.clone();
        let reap_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reap_shutdown.cancelled() => break,
                    _ = tokio::time::sleep(CANCELLATION_REAP_INTERVAL) => {
                        let mut map = reap_map.lock().await;
                        map.retain(|_, stopped_at| stopped_at.elapsed() < cancellation_window);
                    }
                }
            }
        });

        if prune {
            let prune_docker = docker.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(prune_interval) => {
                            match prune_docker.prune_containers(None::<bollard::container::PruneContainersOptions<String>>).await {
                                Ok(response) => {
                                    debug!(
                                        deleted = response.containers_deleted.as_ref().map(Vec::len).unwrap_or(0),
                                        "pruned stopped containers"
                                    );
                                }
                                Err(e) => warn!(error = %e, "container prune failed"),
                            }
                        }
                    }
                }
            });
        }

        Ok(Engine {
            docker,
            cancellations,
            cancellation_window,
        })
    }

    async fn pull_image(
        &self,
        image: &str,
        auth: Option<DockerCredentials>,
    ) -> Result<(), SchedulerError> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut pull = self.docker.create_image(Some(options), None, auth);
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| SchedulerError::NoSuchImage(format!("{image}: {e}")))?;
        }

        Ok(())
    }

    async fn image_exists_locally(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    fn map_error(err: bollard::errors::Error) -> SchedulerError {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => SchedulerError::NoSuchContainer,
            bollard::errors::Error::HyperResponseError { .. } => {
                SchedulerError::Unavailable(err.to_string())
            }
            _ => SchedulerError::Internal(err.to_string()),
        }
    }
}

#[async_trait]
impl Scheduler for Engine {
    async fn start_container(
        &self,
        request: StartContainerRequest,
    ) -> Result<StartContainerResponse, SchedulerError> {
        let credentials = request.registry_auth.as_ref().map(|auth| DockerCredentials {
            username: Some(auth.user.clone()),
            password: Some(auth.pass.clone()),
            ..Default::default()
        });

        if request.always_pull || !self.image_exists_locally(&request.image).await {
            self.pull_image(&request.image, credentials).await?;
        }

        // Name collisions mean a previous incarnation is still around;
        // replace it so the id stays caller-owned.
        let _ = self
            .docker
            .remove_container(
                &request.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        let env: Vec<String> = request
            .variables
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let mut config = Config {
            image: Some(request.image.clone()),
            env: Some(env),
            entrypoint: request.entrypoint.clone(),
            cmd: request.command.clone(),
            ..Default::default()
        };

        if let Some(port) = request.networking {
            let container_port = format!("{port}/tcp");

            config.exposed_ports = Some(HashMap::from([(container_port.clone(), HashMap::new())]));
            config.host_config = Some(HostConfig {
                port_bindings: Some(HashMap::from([(
                    container_port,
                    Some(vec![PortBinding {
                        host_ip: Some("127.0.0.1".into()),
                        // Port 0 asks the daemon for an ephemeral port.
                        host_port: Some("0".into()),
                    }]),
                )])),
                ..Default::default()
            });
        }

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: request.id.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(Self::map_error)?;

        self.docker
            .start_container(&request.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(Self::map_error)?;

        let mut response = StartContainerResponse::default();

        if let Some(port) = request.networking {
            let inspection = self
                .docker
                .inspect_container(&request.id, None)
                .await
                .map_err(Self::map_error)?;

            let host_port = inspection
                .network_settings
                .and_then(|settings| settings.ports)
                .and_then(|ports| ports.get(&format!("{port}/tcp")).cloned().flatten())
                .and_then(|bindings| bindings.into_iter().next())
                .and_then(|binding| binding.host_port)
                .ok_or_else(|| {
                    SchedulerError::Internal(format!(
                        "no host port published for container '{}'",
                        request.id
                    ))
                })?;

            response.url = Some(format!("http://127.0.0.1:{host_port}"));
        }

        debug!(container = %request.id, image = %request.image, "started container");
        Ok(response)
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), SchedulerError> {
        {
            let mut cancellations = self.cancellations.lock().await;
            cancellations.insert(id.to_string(), Instant::now());
        }

        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            )
            .await
            .map_err(Self::map_error)?;

        Ok(())
    }

    async fn get_state(&self, id: &str) -> Result<ContainerStatus, SchedulerError> {
        let inspection = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(Self::map_error)?;

        let state = inspection
            .state
            .ok_or_else(|| SchedulerError::Internal(format!("no state for container '{id}'")))?;

        let exit_code = state.exit_code.and_then(|code| u8::try_from(code).ok());

        let container_state = match state.status {
            Some(ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
            Some(ContainerStateStatusEnum::PAUSED) => ContainerState::Paused,
            Some(ContainerStateStatusEnum::RESTARTING) => ContainerState::Restarting,
            Some(ContainerStateStatusEnum::EXITED)
            | Some(ContainerStateStatusEnum::DEAD)
            | Some(ContainerStateStatusEnum::REMOVING) => {
                let cancellations = self.cancellations.lock().await;
                match cancellations.get(id) {
                    Some(stopped_at) if stopped_at.elapsed() < self.cancellation_window => {
                        ContainerState::Cancelled
                    }
                    _ => ContainerState::Exited,
                }
            }
            _ => ContainerState::Unknown,
        };

        Ok(ContainerStatus {
            state: container_state,
            exit_code,
        })
    }

    async fn get_logs(&self, id: &str) -> Result<LogStream, SchedulerError> {
        // List first so a bad id surfaces as NoSuchContainer rather than an
        // empty stream.
        let filters = HashMap::from([("name".to_string(), vec![format!("^/{id}$")])]);
        let matches = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(Self::map_error)?;

        match matches.len() {
            0 => return Err(SchedulerError::NoSuchContainer),
            1 => {}
            _ => return Err(SchedulerError::AmbiguousContainerName(id.to_string())),
        }

        let stream = self
            .docker
            .logs(
                id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            )
            .map(|entry| match entry {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => Ok(message),
                Ok(LogOutput::StdIn { .. }) => Ok(bytes::Bytes::new()),
                Err(e) => Err(Self::map_error(e)),
            });

        Ok(Box::pin(stream))
    }

    async fn attach_container(
        &self,
        id: &str,
        command: Vec<String>,
    ) -> Result<AttachSession, SchedulerError> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(command),
                    ..Default::default()
                },
            )
            .await
            .map_err(Self::map_error)?;

        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(Self::map_error)?
        {
            StartExecResults::Attached { output, input } => Ok(AttachSession {
                input: Box::pin(input),
                output: Box::pin(output.map(|entry| match entry {
                    Ok(log) => Ok(log.into_bytes()),
                    Err(e) => Err(Self::map_error(e)),
                })),
            }),
            StartExecResults::Detached => Err(SchedulerError::Internal(
                "exec session detached unexpectedly".into(),
            )),
        }
    }
}
