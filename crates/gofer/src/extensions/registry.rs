//! The extension registry: install, start, health-track, subscribe, and
//! uninstall extension containers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    Extension, ExtensionClient, Registration, RegistryError, State, Status, Subscription,
    SubscriptionRequest, SubscriptionStatus, EXTENSION_PORT,
};
use crate::auth::Auth;
use crate::events::{EventBus, Kind};
use crate::pipelines::dag::validate_identifier;
use crate::scheduler::{extension_container_id, RegistryAuth, Scheduler, StartContainerRequest};
use crate::storage::{self, Db, StorageError};
use crate::variables::{Variable, VariableSource};

/// How often extension containers are health checked.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// The bundled extensions installed when `install_base_extensions` is on.
const BASE_EXTENSIONS: [(&str, &str); 2] = [
    ("cron", "ghcr.io/gofer-run/gofer/extensions/cron:latest"),
    ("interval", "ghcr.io/gofer-run/gofer/extensions/interval:latest"),
];

/// Settings the registry needs from the server configuration.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Grace period for stopping extension containers.
    pub stop_timeout: Duration,

    /// Address extensions use to call back into the server.
    pub server_address: String,

    pub install_base_extensions: bool,
}

pub struct InstallRequest {
    pub name: String,
    pub image: String,
    pub registry_auth: Option<RegistryAuth>,

    /// Config map captured from the installer dialog or supplied directly.
    pub settings: HashMap<String, String>,
}

pub struct ExtensionRegistry {
    storage: Db,
    scheduler: Arc<dyn Scheduler>,
    event_bus: Arc<EventBus>,
    auth: Arc<Auth>,
    client: Arc<dyn ExtensionClient>,
    settings: RegistrySettings,

    /// Extensions this process has started, keyed by name.
    extensions: RwLock<HashMap<String, Extension>>,

    shutdown: CancellationToken,
}

impl ExtensionRegistry {
    pub fn new(
        storage: Db,
        scheduler: Arc<dyn Scheduler>,
        event_bus: Arc<EventBus>,
        auth: Arc<Auth>,
        client: Arc<dyn ExtensionClient>,
        settings: RegistrySettings,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let registry = Arc::new(ExtensionRegistry {
            storage,
            scheduler,
            event_bus,
            auth,
            client,
            settings,
            extensions: RwLock::new(HashMap::new()),
            shutdown,
        });

        let health_registry = registry.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = health_registry.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {
                        health_registry.health_check().await;
                    }
                }
            }
        });

        registry
    }

    /// Install the bundled extensions (when configured) and start every
    /// enabled registration. Call once at startup.
    pub async fn start(&self) -> Result<(), RegistryError> {
        if self.settings.install_base_extensions {
            for (name, image) in BASE_EXTENSIONS {
                match self
                    .install(InstallRequest {
                        name: name.into(),
                        image: image.into(),
                        registry_auth: None,
                        settings: HashMap::new(),
                    })
                    .await
                {
                    Ok(_) => info!(extension = name, "installed base extension"),
                    Err(RegistryError::Exists) => {}
                    Err(e) => {
                        warn!(extension = name, error = %e, "could not install base extension")
                    }
                }
            }
        }

        let mut conn = self.storage.conn().await?;
        let registrations = storage::extension_registrations::list(&mut conn).await?;
        drop(conn);

        for row in registrations {
            let registration = Registration::try_from(row)?;
            if registration.status != Status::Enabled {
                continue;
            }

            // Already running registrations were started by install above.
            if self.extensions.read().await.contains_key(&registration.name) {
                continue;
            }

            if let Err(e) = self.start_extension(registration.clone()).await {
                error!(extension = registration.name, error = %e, "could not start extension");
            }
        }

        Ok(())
    }

    /// Register a new extension and start its container.
    pub async fn install(&self, request: InstallRequest) -> Result<Registration, RegistryError> {
        validate_identifier("extension name", &request.name)
            .map_err(|e| RegistryError::FailedPrecondition(e.to_string()))?;

        let variables: Vec<Variable> = request
            .settings
            .into_iter()
            .map(|(key, value)| Variable {
                key,
                value,
                source: VariableSource::Extension,
            })
            .collect();

        let registration = Registration {
            name: request.name.clone(),
            image: request.image,
            registry_auth: request.registry_auth,
            variables,
            status: Status::Enabled,
            key_id: nanoid::nanoid!(10),
            created: crate::epoch_milli(),
        };

        let row = storage::extension_registrations::ExtensionRegistration::try_from(&registration)?;

        let mut conn = self.storage.conn().await?;
        storage::extension_registrations::insert(&mut conn, &row)
            .await
            .map_err(|e| match e {
                StorageError::Exists => RegistryError::Exists,
                other => RegistryError::Storage(other),
            })?;
        drop(conn);

        let _ = self
            .event_bus
            .publish(Kind::InstalledExtension {
                name: registration.name.clone(),
                image: registration.image.clone(),
            })
            .await;

        self.start_extension(registration.clone()).await?;

        info!(extension = registration.name, image = registration.image, "installed extension");
        Ok(registration)
    }

    /// Launch an extension container with generated credentials and record
    /// the URL the scheduler published for it.
    async fn start_extension(&self, registration: Registration) -> Result<(), RegistryError> {
        let name = registration.name.clone();

        {
            let mut extensions = self.extensions.write().await;
            extensions.insert(
                name.clone(),
                Extension {
                    registration: registration.clone(),
                    url: None,
                    secret_key: String::new(),
                    state: State::Processing,
                    started: 0,
                },
            );
        }

        let mut key_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key_bytes);
        let secret_key = hex::encode(key_bytes);

        let api_token = self
            .auth
            .create_token(
                crate::auth::TokenKind::Client,
                vec![".*".into()],
                HashMap::from([
                    ("kind".into(), "extension_injected".into()),
                    ("extension".into(), name.clone()),
                ]),
                Duration::ZERO,
            )
            .await
            .map_err(|e| RegistryError::Internal(e.to_string()))?;

        let mut variables: HashMap<String, String> = registration
            .variables
            .iter()
            .map(|v| (v.key.clone(), v.value.clone()))
            .collect();
        variables.insert("GOFER_EXTENSION_NAME".into(), name.clone());
        variables.insert("GOFER_EXTENSION_KEY".into(), secret_key.clone());
        variables.insert("GOFER_API_TOKEN".into(), api_token.plaintext);
        variables.insert(
            "GOFER_SERVER_ADDRESS".into(),
            self.settings.server_address.clone(),
        );

        let response = self
            .scheduler
            .start_container(StartContainerRequest {
                id: extension_container_id(&name),
                image: registration.image.clone(),
                variables,
                registry_auth: registration.registry_auth.clone(),
                always_pull: true,
                networking: Some(EXTENSION_PORT),
                entrypoint: None,
                command: None,
            })
            .await
            .map_err(|e| {
                RegistryError::Unavailable(format!("could not start extension container: {e}"))
            })?;

        let mut extensions_map = self.extensions.write().await;
        if let Some(extension) = extensions_map.get_mut(&name) {
            extension.url = response.url;
            extension.secret_key = secret_key;
            extension.state = State::Running;
            extension.started = crate::epoch_milli();
        }

        info!(extension = name, "extension started");
        Ok(())
    }

    /// Poll container state for every tracked extension; exited containers
    /// are reported and marked so dispatch stops.
    async fn health_check(&self) {
        let names: Vec<String> = {
            let extensions = self.extensions.read().await;
            extensions
                .iter()
                .filter(|(_, extension)| extension.state == State::Running)
                .map(|(name, _)| name.clone())
                .collect()
        };

        for name in names {
            let container = extension_container_id(&name);
            let state = match self.scheduler.get_state(&container).await {
                Ok(status) => match status.state {
                    crate::scheduler::ContainerState::Running => continue,
                    _ => State::Exited,
                },
                Err(_) => State::Exited,
            };

            warn!(extension = name, "extension container exited unexpectedly");
            let mut extensions = self.extensions.write().await;
            if let Some(extension) = extensions.get_mut(&name) {
                extension.state = state;
            }
        }
    }

    /// Snapshot of a tracked extension.
    pub async fn get_extension(&self, name: &str) -> Result<Extension, RegistryError> {
        let extensions = self.extensions.read().await;
        extensions.get(name).cloned().ok_or(RegistryError::NotFound)
    }

    /// All registrations, hydrated with runtime state when tracked.
    pub async fn list_extensions(&self) -> Result<Vec<Extension>, RegistryError> {
        let mut conn = self.storage.conn().await?;
        let rows = storage::extension_registrations::list(&mut conn).await?;
        drop(conn);

        let extensions = self.extensions.read().await;
        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let registration = Registration::try_from(row)?;
            match extensions.get(&registration.name) {
                Some(extension) => result.push(extension.clone()),
                None => result.push(Extension {
                    registration,
                    url: None,
                    secret_key: String::new(),
                    state: State::Unknown,
                    started: 0,
                }),
            }
        }

        Ok(result)
    }

    /// Verify a callback key for an extension and publish the resolved event
    /// that the run engine consumes.
    pub async fn resolve(
        &self,
        extension_name: &str,
        key: &str,
        namespace_id: &str,
        pipeline_id: &str,
        extension_label: &str,
        variables: HashMap<String, String>,
    ) -> Result<(), RegistryError> {
        {
            let extensions = self.extensions.read().await;
            let extension = extensions
                .get(extension_name)
                .ok_or(RegistryError::NotFound)?;

            if extension.secret_key.is_empty() || extension.secret_key != key {
                return Err(RegistryError::FailedPrecondition(
                    "extension key does not match".into(),
                ));
            }
        }

        let _ = self
            .event_bus
            .publish(Kind::ExtensionResolved {
                extension_name: extension_name.into(),
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                extension_label: extension_label.into(),
                variables,
            })
            .await;

        debug!(
            extension = extension_name,
            namespace = namespace_id,
            pipeline = pipeline_id,
            label = extension_label,
            "extension resolved event accepted"
        );

        Ok(())
    }

    /// Subscribe a pipeline to an extension. The row is persisted only after
    /// the extension acknowledges.
    pub async fn subscribe(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        extension_name: &str,
        extension_label: &str,
        settings: HashMap<String, String>,
    ) -> Result<Subscription, RegistryError> {
        validate_identifier("subscription label", extension_label)
            .map_err(|e| RegistryError::FailedPrecondition(e.to_string()))?;

        let (url, secret_key) = self.running_extension_endpoint(extension_name).await?;

        self.client
            .subscribe(
                &url,
                &secret_key,
                SubscriptionRequest {
                    namespace_id: namespace_id.into(),
                    pipeline_id: pipeline_id.into(),
                    extension_label: extension_label.into(),
                    settings: settings.clone(),
                },
            )
            .await?;

        let subscription = Subscription {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            extension_name: extension_name.into(),
            extension_label: extension_label.into(),
            settings,
            status: SubscriptionStatus::Active,
        };

        let mut conn = self.storage.conn().await?;
        storage::subscriptions::insert(
            &mut conn,
            &storage::subscriptions::Subscription {
                namespace_id: subscription.namespace_id.clone(),
                pipeline_id: subscription.pipeline_id.clone(),
                extension_name: subscription.extension_name.clone(),
                extension_label: subscription.extension_label.clone(),
                settings: serde_json::to_string(&subscription.settings)
                    .map_err(|e| RegistryError::Internal(e.to_string()))?,
                status: subscription.status.to_string(),
            },
        )
        .await
        .map_err(|e| match e {
            StorageError::Exists => RegistryError::FailedPrecondition(format!(
                "pipeline already subscribed to '{extension_name}' with label '{extension_label}'"
            )),
            other => RegistryError::Storage(other),
        })?;
        drop(conn);

        let _ = self
            .event_bus
            .publish(Kind::CreatedSubscription {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                extension_name: extension_name.into(),
                extension_label: extension_label.into(),
            })
            .await;

        info!(
            namespace = namespace_id,
            pipeline = pipeline_id,
            extension = extension_name,
            label = extension_label,
            "pipeline subscribed to extension"
        );

        Ok(subscription)
    }

    /// Remove a subscription; the extension is told first so it stops firing.
    pub async fn unsubscribe(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        extension_name: &str,
        extension_label: &str,
    ) -> Result<(), RegistryError> {
        let mut conn = self.storage.conn().await?;
        let row = storage::subscriptions::get(
            &mut conn,
            namespace_id,
            pipeline_id,
            extension_name,
            extension_label,
        )
        .await
        .map_err(|e| match e {
            StorageError::NotFound => RegistryError::NotFound,
            other => RegistryError::Storage(other),
        })?;
        drop(conn);

        let subscription = Subscription::try_from(row)?;

        // Best effort: an exited extension cannot acknowledge, but the row
        // still has to go.
        match self.running_extension_endpoint(extension_name).await {
            Ok((url, secret_key)) => {
                if let Err(e) = self
                    .client
                    .unsubscribe(
                        &url,
                        &secret_key,
                        SubscriptionRequest {
                            namespace_id: namespace_id.into(),
                            pipeline_id: pipeline_id.into(),
                            extension_label: extension_label.into(),
                            settings: subscription.settings,
                        },
                    )
                    .await
                {
                    warn!(extension = extension_name, error = %e, "extension did not acknowledge unsubscribe");
                }
            }
            Err(e) => {
                warn!(extension = extension_name, error = %e, "removing subscription without extension ack");
            }
        }

        let mut conn = self.storage.conn().await?;
        storage::subscriptions::delete(
            &mut conn,
            namespace_id,
            pipeline_id,
            extension_name,
            extension_label,
        )
        .await?;
        drop(conn);

        let _ = self
            .event_bus
            .publish(Kind::DeletedSubscription {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                extension_name: extension_name.into(),
                extension_label: extension_label.into(),
            })
            .await;

        Ok(())
    }

    pub async fn list_subscriptions(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
    ) -> Result<Vec<Subscription>, RegistryError> {
        let mut conn = self.storage.conn().await?;
        let rows = storage::subscriptions::list(&mut conn, namespace_id, pipeline_id).await?;

        let mut subscriptions = Vec::with_capacity(rows.len());
        for row in rows {
            subscriptions.push(Subscription::try_from(row)?);
        }

        Ok(subscriptions)
    }

    /// Enable a disabled extension and start its container.
    pub async fn enable(&self, name: &str) -> Result<(), RegistryError> {
        let mut conn = self.storage.conn().await?;
        storage::extension_registrations::update_status(
            &mut conn,
            name,
            &Status::Enabled.to_string(),
        )
        .await
        .map_err(|e| match e {
            StorageError::NotFound => RegistryError::NotFound,
            other => RegistryError::Storage(other),
        })?;

        let row = storage::extension_registrations::get(&mut conn, name).await?;
        drop(conn);

        let mut registration = Registration::try_from(row)?;
        registration.status = Status::Enabled;
        self.start_extension(registration).await?;

        let _ = self
            .event_bus
            .publish(Kind::EnabledExtension { name: name.into() })
            .await;

        Ok(())
    }

    /// Disable an extension and stop its container. Subscriptions stay in
    /// place; they simply stop firing.
    pub async fn disable(&self, name: &str) -> Result<(), RegistryError> {
        let mut conn = self.storage.conn().await?;
        storage::extension_registrations::update_status(
            &mut conn,
            name,
            &Status::Disabled.to_string(),
        )
        .await
        .map_err(|e| match e {
            StorageError::NotFound => RegistryError::NotFound,
            other => RegistryError::Storage(other),
        })?;
        drop(conn);

        self.stop_extension(name).await;

        let _ = self
            .event_bus
            .publish(Kind::DisabledExtension { name: name.into() })
            .await;

        Ok(())
    }

    /// Uninstall: disable every subscription, stop the container, delete the
    /// registration.
    pub async fn uninstall(&self, name: &str) -> Result<(), RegistryError> {
        let mut conn = self.storage.conn().await?;

        let subscriptions = storage::subscriptions::list_by_extension(&mut conn, name).await?;
        for subscription in subscriptions {
            storage::subscriptions::update_status(
                &mut conn,
                &subscription.namespace_id,
                &subscription.pipeline_id,
                &subscription.extension_name,
                &subscription.extension_label,
                &SubscriptionStatus::Disabled.to_string(),
            )
            .await?;
        }
        drop(conn);

        self.stop_extension(name).await;

        let mut conn = self.storage.conn().await?;
        storage::extension_registrations::delete(&mut conn, name)
            .await
            .map_err(|e| match e {
                StorageError::NotFound => RegistryError::NotFound,
                other => RegistryError::Storage(other),
            })?;
        drop(conn);

        {
            let mut extensions = self.extensions.write().await;
            extensions.remove(name);
        }

        let _ = self
            .event_bus
            .publish(Kind::UninstalledExtension { name: name.into() })
            .await;

        info!(extension = name, "extension uninstalled");
        Ok(())
    }

    /// Stop every running extension. Called during server shutdown.
    pub async fn stop_all(&self) {
        let names: Vec<String> = {
            let extensions = self.extensions.read().await;
            extensions.keys().cloned().collect()
        };

        for name in names {
            self.stop_extension(&name).await;
        }
    }

    async fn stop_extension(&self, name: &str) {
        let endpoint = self.running_extension_endpoint(name).await.ok();

        if let Some((url, secret_key)) = endpoint {
            if let Err(e) = self.client.shutdown(&url, &secret_key).await {
                debug!(extension = name, error = %e, "extension did not acknowledge shutdown");
            }
        }

        let container = extension_container_id(name);
        if let Err(e) = self
            .scheduler
            .stop_container(&container, self.settings.stop_timeout)
            .await
        {
            debug!(extension = name, error = %e, "could not stop extension container");
        }

        let mut extensions = self.extensions.write().await;
        if let Some(extension) = extensions.get_mut(name) {
            extension.state = State::Exited;
            extension.url = None;
            extension.secret_key = String::new();
        }
    }

    async fn running_extension_endpoint(
        &self,
        name: &str,
    ) -> Result<(String, String), RegistryError> {
        let extensions = self.extensions.read().await;
        let extension = extensions.get(name).ok_or(RegistryError::NotFound)?;

        if extension.state != State::Running {
            return Err(RegistryError::FailedPrecondition(format!(
                "extension '{name}' is not running (state {})",
                extension.state
            )));
        }

        let url = extension.url.clone().ok_or_else(|| {
            RegistryError::Internal(format!("extension '{name}' has no published url"))
        })?;

        Ok((url, extension.secret_key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::scheduler::{
        AttachSession, ContainerState, ContainerStatus, LogStream, SchedulerError,
        StartContainerResponse,
    };
    use crate::storage::testutil::temp_db;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct StubScheduler {
        running: Mutex<HashMap<String, bool>>,
    }

    impl StubScheduler {
        fn new() -> Arc<Self> {
            Arc::new(StubScheduler {
                running: Mutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl Scheduler for StubScheduler {
        async fn start_container(
            &self,
            request: StartContainerRequest,
        ) -> Result<StartContainerResponse, SchedulerError> {
            assert!(request.networking.is_some());
            assert!(request.variables.contains_key("GOFER_EXTENSION_KEY"));
            assert!(request.variables.contains_key("GOFER_API_TOKEN"));

            let mut running = self.running.lock().await;
            running.insert(request.id, true);
            Ok(StartContainerResponse {
                url: Some("http://127.0.0.1:50012".into()),
            })
        }

        async fn stop_container(
            &self,
            id: &str,
            _timeout: Duration,
        ) -> Result<(), SchedulerError> {
            let mut running = self.running.lock().await;
            running.insert(id.to_string(), false);
            Ok(())
        }

        async fn get_state(&self, id: &str) -> Result<ContainerStatus, SchedulerError> {
            let running = self.running.lock().await;
            match running.get(id) {
                Some(true) => Ok(ContainerStatus {
                    state: ContainerState::Running,
                    exit_code: None,
                }),
                Some(false) => Ok(ContainerStatus {
                    state: ContainerState::Cancelled,
                    exit_code: Some(0),
                }),
                None => Err(SchedulerError::NoSuchContainer),
            }
        }

        async fn get_logs(&self, _id: &str) -> Result<LogStream, SchedulerError> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn attach_container(
            &self,
            _id: &str,
            _command: Vec<String>,
        ) -> Result<AttachSession, SchedulerError> {
            Err(SchedulerError::Internal("unsupported".into()))
        }
    }

    #[derive(Default)]
    struct StubClientState {
        subscribes: Vec<SubscriptionRequest>,
        unsubscribes: Vec<SubscriptionRequest>,
        reject_subscribe: bool,
    }

    struct StubClient {
        state: Mutex<StubClientState>,
    }

    impl StubClient {
        fn new(reject_subscribe: bool) -> Arc<Self> {
            Arc::new(StubClient {
                state: Mutex::new(StubClientState {
                    reject_subscribe,
                    ..Default::default()
                }),
            })
        }
    }

    #[async_trait]
    impl ExtensionClient for StubClient {
        async fn subscribe(
            &self,
            _url: &str,
            _key: &str,
            request: SubscriptionRequest,
        ) -> Result<(), RegistryError> {
            let mut state = self.state.lock().await;
            if state.reject_subscribe {
                return Err(RegistryError::Unavailable("extension said no".into()));
            }
            state.subscribes.push(request);
            Ok(())
        }

        async fn unsubscribe(
            &self,
            _url: &str,
            _key: &str,
            request: SubscriptionRequest,
        ) -> Result<(), RegistryError> {
            let mut state = self.state.lock().await;
            state.unsubscribes.push(request);
            Ok(())
        }

        async fn shutdown(&self, _url: &str, _key: &str) -> Result<(), RegistryError> {
            Ok(())
        }
    }

    async fn registry_with(
        client: Arc<StubClient>,
    ) -> (tempfile::TempDir, Db, Arc<ExtensionRegistry>) {
        let (dir, db) = temp_db().await;

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
        storage::pipeline_metadata::insert(
            &mut conn,
            &storage::pipeline_metadata::PipelineMetadata {
                namespace_id: "default".into(),
                pipeline_id: "build".into(),
                state: "active".into(),
                created: 0,
                modified: 0,
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
        let auth = Arc::new(Auth::new(db.clone(), 200));

        let registry = ExtensionRegistry::new(
            db.clone(),
            StubScheduler::new(),
            event_bus,
            auth,
            client,
            RegistrySettings {
                stop_timeout: Duration::from_secs(5),
                server_address: "http://172.17.0.1:8080".into(),
                install_base_extensions: false,
            },
            shutdown,
        );

        (dir, db, registry)
    }

    fn install_request(name: &str) -> InstallRequest {
        InstallRequest {
            name: name.into(),
            image: format!("ghcr.io/gofer-run/gofer/extensions/{name}:latest"),
            registry_auth: None,
            settings: HashMap::from([("MIN_INTERVAL".into(), "60".into())]),
        }
    }

    #[tokio::test]
    async fn install_starts_container_and_persists() {
        let client = StubClient::new(false);
        let (_dir, db, registry) = registry_with(client).await;

        registry.install(install_request("cron")).await.unwrap();

        assert!(matches!(
            registry.install(install_request("cron")).await,
            Err(RegistryError::Exists)
        ));

        let extension = registry.get_extension("cron").await.unwrap();
        assert_eq!(extension.state, State::Running);
        assert_eq!(extension.url.as_deref(), Some("http://127.0.0.1:50012"));
        assert!(!extension.secret_key.is_empty());

        let mut conn = db.conn().await.unwrap();
        let row = storage::extension_registrations::get(&mut conn, "cron")
            .await
            .unwrap();
        assert_eq!(row.status, "enabled");
    }

    #[tokio::test]
    async fn subscribe_persists_only_after_ack() {
        let client = StubClient::new(true);
        let (_dir, db, registry) = registry_with(client.clone()).await;

        registry.install(install_request("cron")).await.unwrap();

        let result = registry
            .subscribe(
                "default",
                "build",
                "cron",
                "nightly",
                HashMap::from([("expression".into(), "0 1 * * *".into())]),
            )
            .await;
        assert!(matches!(result, Err(RegistryError::Unavailable(_))));

        // Rejected subscription leaves no row behind.
        let mut conn = db.conn().await.unwrap();
        assert!(matches!(
            storage::subscriptions::get(&mut conn, "default", "build", "cron", "nightly").await,
            Err(StorageError::NotFound)
        ));
        drop(conn);

        {
            let mut state = client.state.lock().await;
            state.reject_subscribe = false;
        }

        let subscription = registry
            .subscribe(
                "default",
                "build",
                "cron",
                "nightly",
                HashMap::from([("expression".into(), "0 1 * * *".into())]),
            )
            .await
            .unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::Active);

        let recorded = client.state.lock().await;
        assert_eq!(recorded.subscribes.len(), 1);
        assert_eq!(recorded.subscribes[0].extension_label, "nightly");
    }

    #[tokio::test]
    async fn resolve_requires_matching_key() {
        let client = StubClient::new(false);
        let (_dir, _db, registry) = registry_with(client).await;

        registry.install(install_request("cron")).await.unwrap();
        let extension = registry.get_extension("cron").await.unwrap();

        assert!(matches!(
            registry
                .resolve("cron", "wrong-key", "default", "build", "nightly", HashMap::new())
                .await,
            Err(RegistryError::FailedPrecondition(_))
        ));

        registry
            .resolve(
                "cron",
                &extension.secret_key,
                "default",
                "build",
                "nightly",
                HashMap::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn uninstall_disables_subscriptions_and_removes_registration() {
        let client = StubClient::new(false);
        let (_dir, db, registry) = registry_with(client).await;

        registry.install(install_request("cron")).await.unwrap();
        registry
            .subscribe("default", "build", "cron", "nightly", HashMap::new())
            .await
            .unwrap();

        registry.uninstall("cron").await.unwrap();

        let mut conn = db.conn().await.unwrap();
        assert!(matches!(
            storage::extension_registrations::get(&mut conn, "cron").await,
            Err(StorageError::NotFound)
        ));

        let row = storage::subscriptions::get(&mut conn, "default", "build", "cron", "nightly")
            .await
            .unwrap();
        assert_eq!(row.status, "disabled");

        assert!(matches!(
            registry.get_extension("cron").await,
            Err(RegistryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn disable_stops_dispatch() {
        let client = StubClient::new(false);
        let (_dir, _db, registry) = registry_with(client).await;

        registry.install(install_request("interval")).await.unwrap();
        registry.disable("interval").await.unwrap();

        let extension = registry.get_extension("interval").await.unwrap();
        assert_eq!(extension.state, State::Exited);

        // Subscribing against a stopped extension is refused.
        assert!(matches!(
            registry
                .subscribe("default", "build", "interval", "hourly", HashMap::new())
                .await,
            Err(RegistryError::FailedPrecondition(_))
        ));

        registry.enable("interval").await.unwrap();
        let extension = registry.get_extension("interval").await.unwrap();
        assert_eq!(extension.state, State::Running);
    }
}
