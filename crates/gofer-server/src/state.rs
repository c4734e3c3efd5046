//! Shared application state: every service the handlers dispatch to, rooted
//! in one immutable struct built at startup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use gofer::auth::Auth;
use gofer::conf::Settings;
use gofer::events::EventBus;
use gofer::extensions::registry::{ExtensionRegistry, RegistrySettings};
use gofer::extensions::HttpExtensionClient;
use gofer::object_store::ObjectStore;
use gofer::pipelines::service::PipelineService;
use gofer::run_engine::{EngineSettings, RunEngine};
use gofer::scheduler::Scheduler;
use gofer::secret_store::SecretStore;
use gofer::storage::{self, Db};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

pub struct AppStateInner {
    pub settings: Settings,
    pub storage: Db,
    pub event_bus: Arc<EventBus>,
    pub scheduler: Arc<dyn Scheduler>,
    pub object_store: Arc<dyn ObjectStore>,
    pub secret_store: Arc<dyn SecretStore>,
    pub auth: Arc<Auth>,
    pub pipelines: PipelineService,
    pub run_engine: Arc<RunEngine>,
    pub extensions: Arc<ExtensionRegistry>,

    /// Mirrors the persisted `ignore_pipeline_run_events` flag for cheap
    /// checks on the run path.
    pub ignore_run_events: Arc<AtomicBool>,

    pub shutdown: CancellationToken,
}

impl std::ops::Deref for AppState {
    type Target = AppStateInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl AppState {
    /// Build every service against the Docker scheduler and recover
    /// interrupted work. The returned state is ready to serve.
    pub async fn new(settings: Settings) -> Result<Self> {
        let shutdown = CancellationToken::new();

        let scheduler: Arc<dyn Scheduler> = Arc::new(
            gofer::scheduler::docker::Engine::new(
                settings.scheduler.docker.prune,
                Duration::from_secs(settings.scheduler.docker.prune_interval),
                Duration::from_secs(settings.scheduler.docker.cancellation_window_secs),
                shutdown.clone(),
            )
            .await
            .context("could not connect to the container runtime")?,
        );

        Self::with_scheduler(settings, scheduler, shutdown).await
    }

    /// Same wiring with a caller-supplied scheduler. Lets tests and
    /// alternative runtimes avoid Docker.
    pub async fn with_scheduler(
        settings: Settings,
        scheduler: Arc<dyn Scheduler>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let storage = Db::new(&settings.server.storage_path)
            .await
            .context("could not open main database")?;

        let event_bus = EventBus::new(
            storage.clone(),
            Duration::from_secs(settings.api.event_log_retention),
            Duration::from_secs(settings.api.event_prune_interval),
            shutdown.clone(),
        );

        let object_store: Arc<dyn ObjectStore> = Arc::new(
            gofer::object_store::sqlite::Engine::new(
                &settings.object_store.path,
                settings.object_store.pipeline_object_limit,
            )
            .await
            .context("could not open object store")?,
        );

        let secret_store: Arc<dyn SecretStore> = Arc::new(
            gofer::secret_store::sqlite::Engine::new(
                &settings.secret_store.path,
                &settings.encryption_key(),
            )
            .await
            .context("could not open secret store")?,
        );

        let auth = Arc::new(Auth::new(
            storage.clone(),
            settings.server.storage_results_limit,
        ));

        let pipelines = PipelineService::new(
            storage.clone(),
            event_bus.clone(),
            settings.api.pipeline_version_limit,
            settings.server.storage_results_limit,
        );

        ensure_default_namespace(&storage, &event_bus).await?;

        // The persisted operator toggle survives restarts; configuration only
        // seeds it the first time.
        let ignore_run_events = {
            let mut conn = storage.conn().await?;
            let flags = storage::system::get(&mut conn).await?;
            let effective = flags.ignore_pipeline_run_events || settings.api.ignore_pipeline_run_events;
            if effective != flags.ignore_pipeline_run_events {
                storage::system::update(&mut conn, None, Some(effective)).await?;
            }
            Arc::new(AtomicBool::new(effective))
        };

        let run_engine = RunEngine::new(
            storage.clone(),
            scheduler.clone(),
            object_store.clone(),
            secret_store.clone(),
            event_bus.clone(),
            auth.clone(),
            EngineSettings {
                run_parallelism_limit: settings.api.run_parallelism_limit,
                logs_dir: settings.api.task_execution_logs_dir.clone(),
                log_retention: settings.api.task_execution_log_retention,
                stop_timeout: Duration::from_secs(settings.api.task_execution_stop_timeout),
                run_object_expiry: settings.object_store.run_object_expiry,
            },
            ignore_run_events.clone(),
            shutdown.clone(),
        );

        let extensions = ExtensionRegistry::new(
            storage.clone(),
            scheduler.clone(),
            event_bus.clone(),
            auth.clone(),
            Arc::new(HttpExtensionClient::new()),
            RegistrySettings {
                stop_timeout: Duration::from_secs(settings.extensions.stop_timeout),
                server_address: settings.server.extension_address.clone(),
                install_base_extensions: settings.extensions.install_base_extensions,
            },
            shutdown.clone(),
        );

        run_engine.recover().await?;
        run_engine.spawn_event_consumer();

        if let Err(e) = extensions.start().await {
            // Extensions failing to come up should not hold the API hostage.
            tracing::warn!(error = %e, "extension registry startup incomplete");
        }

        info!("application state initialized");

        Ok(AppState {
            inner: Arc::new(AppStateInner {
                settings,
                storage,
                event_bus,
                scheduler,
                object_store,
                secret_store,
                auth,
                pipelines,
                run_engine,
                extensions,
                ignore_run_events,
                shutdown,
            }),
        })
    }

    /// Flip the operator run-ingress switch, durably.
    pub async fn set_ignore_run_events(&self, value: bool) -> Result<(), storage::StorageError> {
        let mut conn = self.storage.conn().await?;
        storage::system::update(&mut conn, None, Some(value)).await?;
        self.ignore_run_events.store(value, Ordering::SeqCst);
        Ok(())
    }
}

/// Gofer always has a `default` namespace so fresh installs work without
/// ceremony.
async fn ensure_default_namespace(storage: &Db, event_bus: &Arc<EventBus>) -> Result<()> {
    let mut conn = storage.conn().await?;

    let namespace = storage::namespaces::Namespace {
        id: "default".into(),
        name: "Default".into(),
        description: "The default namespace, used when none is specified.".into(),
        created: gofer::epoch_milli() as i64,
    };

    match storage::namespaces::insert(&mut conn, &namespace).await {
        Ok(()) => {
            let _ = event_bus
                .publish(gofer::events::Kind::CreatedNamespace {
                    namespace_id: "default".into(),
                })
                .await;
        }
        Err(storage::StorageError::Exists) => {}
        Err(e) => return Err(e.into()),
    }

    Ok(())
}
