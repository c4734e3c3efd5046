//! Pipeline lifecycle operations: config registration and deployment,
//! enable/disable, deletion, and lookups.

use std::sync::Arc;

use sqlx::SqliteConnection;
use thiserror::Error;
use tracing::{debug, info};

use super::dag::{self, ValidationError};
use super::{Config, ConfigState, Metadata, Pipeline, PipelineDefinition, PipelineState};
use crate::events::{EventBus, Kind};
use crate::storage::{self, Db, StorageError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline not found")]
    NotFound,

    #[error("pipeline configuration failed validation")]
    InvalidConfig(Vec<ValidationError>),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("unexpected pipeline error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Internal(format!("{err:#}"))
    }
}

pub struct PipelineService {
    storage: Db,
    event_bus: Arc<EventBus>,

    /// Stored configs kept per pipeline; 0 disables pruning.
    version_limit: u64,

    results_limit: u64,
}

impl PipelineService {
    pub fn new(
        storage: Db,
        event_bus: Arc<EventBus>,
        version_limit: u64,
        results_limit: u64,
    ) -> Self {
        PipelineService {
            storage,
            event_bus,
            version_limit,
            results_limit,
        }
    }

    /// Validate and persist a new configuration version. Registering the
    /// first config for an id also creates the pipeline itself.
    pub async fn register_config(
        &self,
        namespace_id: &str,
        definition: PipelineDefinition,
    ) -> Result<Config, PipelineError> {
        let errors = dag::validate(&definition);
        if !errors.is_empty() {
            return Err(PipelineError::InvalidConfig(errors));
        }

        let pipeline_id = definition.id.clone();
        let mut tx = self.storage.begin().await?;

        // Namespace existence gates everything below it.
        storage::namespaces::get(&mut tx, namespace_id)
            .await
            .map_err(|e| match e {
                StorageError::NotFound => {
                    PipelineError::FailedPrecondition(format!("namespace '{namespace_id}' does not exist"))
                }
                other => PipelineError::Storage(other),
            })?;

        let mut created_pipeline = false;
        match storage::pipeline_metadata::get(&mut tx, namespace_id, &pipeline_id).await {
            Ok(_) => {}
            Err(StorageError::NotFound) => {
                let metadata = Metadata::new(namespace_id, &pipeline_id);
                storage::pipeline_metadata::insert(&mut tx, &(&metadata).into()).await?;
                created_pipeline = true;
            }
            Err(e) => return Err(e.into()),
        }

        let mut config = Config::new(namespace_id, &pipeline_id, definition);
        let (config_row, _) = config.to_storage()?;

        let version = storage::pipeline_configs::insert(&mut tx, &config_row).await?;
        config.version = version as u64;

        // Task rows carry the assigned version, so serialize them after.
        let (_, task_rows) = config.to_storage()?;
        for task_row in &task_rows {
            storage::tasks::insert(&mut tx, task_row).await?;
        }

        let mut pruned: Vec<i64> = Vec::new();
        if self.version_limit > 0 {
            pruned = storage::pipeline_configs::list_prunable_versions(
                &mut tx,
                namespace_id,
                &pipeline_id,
                self.version_limit,
            )
            .await?;

            for old_version in &pruned {
                storage::pipeline_configs::delete(&mut tx, namespace_id, &pipeline_id, *old_version)
                    .await?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| PipelineError::Storage(e.into()))?;

        if !pruned.is_empty() {
            debug!(
                namespace = namespace_id,
                pipeline = pipeline_id,
                versions = ?pruned,
                "pruned old pipeline config versions"
            );
        }

        if created_pipeline {
            let _ = self
                .event_bus
                .publish(Kind::CreatedPipeline {
                    namespace_id: namespace_id.into(),
                    pipeline_id: pipeline_id.clone(),
                })
                .await;
        }

        let _ = self
            .event_bus
            .publish(Kind::RegisteredPipelineConfig {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.clone(),
                version: config.version,
            })
            .await;

        info!(
            namespace = namespace_id,
            pipeline = pipeline_id,
            version = config.version,
            "registered pipeline config"
        );

        Ok(config)
    }

    /// Atomically swap the live pointer to `version`. The previously live
    /// config becomes deprecated.
    pub async fn deploy(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        version: u64,
    ) -> Result<(), PipelineError> {
        let mut tx = self.storage.begin().await?;

        let target =
            storage::pipeline_configs::get(&mut tx, namespace_id, pipeline_id, version as i64)
                .await
                .map_err(|e| match e {
                    StorageError::NotFound => PipelineError::NotFound,
                    other => PipelineError::Storage(other),
                })?;

        match storage::pipeline_configs::get_live(&mut tx, namespace_id, pipeline_id).await {
            Ok(live) if live.version == target.version => {
                return Err(PipelineError::FailedPrecondition(format!(
                    "version {version} is already live"
                )));
            }
            Ok(live) => {
                storage::pipeline_configs::update_state(
                    &mut tx,
                    namespace_id,
                    pipeline_id,
                    live.version,
                    &ConfigState::Deprecated.to_string(),
                    Some(crate::epoch_milli() as i64),
                )
                .await?;
            }
            Err(StorageError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        storage::pipeline_configs::update_state(
            &mut tx,
            namespace_id,
            pipeline_id,
            target.version,
            &ConfigState::Live.to_string(),
            None,
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| PipelineError::Storage(e.into()))?;

        let _ = self
            .event_bus
            .publish(Kind::DeployedPipelineConfig {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                version,
            })
            .await;

        info!(
            namespace = namespace_id,
            pipeline = pipeline_id,
            version = version,
            "deployed pipeline config"
        );

        Ok(())
    }

    /// Delete a stored config version. Refused for the live version and for
    /// the only remaining version.
    pub async fn delete_config(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        version: u64,
    ) -> Result<(), PipelineError> {
        let mut tx = self.storage.begin().await?;

        let target =
            storage::pipeline_configs::get(&mut tx, namespace_id, pipeline_id, version as i64)
                .await
                .map_err(|e| match e {
                    StorageError::NotFound => PipelineError::NotFound,
                    other => PipelineError::Storage(other),
                })?;

        if target.state == ConfigState::Live.to_string() {
            return Err(PipelineError::FailedPrecondition(
                "cannot delete the live configuration; deploy another version first".into(),
            ));
        }

        let all =
            storage::pipeline_configs::list(&mut tx, namespace_id, pipeline_id, 0, 0, u64::MAX)
                .await?;
        if all.len() <= 1 {
            return Err(PipelineError::FailedPrecondition(
                "cannot delete the only remaining configuration".into(),
            ));
        }

        storage::pipeline_configs::delete(&mut tx, namespace_id, pipeline_id, version as i64)
            .await?;

        tx.commit()
            .await
            .map_err(|e| PipelineError::Storage(e.into()))?;

        let _ = self
            .event_bus
            .publish(Kind::DeletedPipelineConfig {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                version,
            })
            .await;

        Ok(())
    }

    /// Fetch a pipeline's metadata together with one config version; the
    /// latest version when `version` is `None`.
    pub async fn get_pipeline(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        version: Option<u64>,
    ) -> Result<Pipeline, PipelineError> {
        let mut conn = self.storage.conn().await?;

        let metadata_row = storage::pipeline_metadata::get(&mut conn, namespace_id, pipeline_id)
            .await
            .map_err(|e| match e {
                StorageError::NotFound => PipelineError::NotFound,
                other => PipelineError::Storage(other),
            })?;
        let metadata = Metadata::try_from(metadata_row)?;

        let config_row = match version {
            Some(version) => {
                storage::pipeline_configs::get(&mut conn, namespace_id, pipeline_id, version as i64)
                    .await
            }
            None => storage::pipeline_configs::get_latest(&mut conn, namespace_id, pipeline_id).await,
        }
        .map_err(|e| match e {
            StorageError::NotFound => PipelineError::NotFound,
            other => PipelineError::Storage(other),
        })?;

        let config = load_config(&mut conn, config_row).await?;

        Ok(Pipeline { metadata, config })
    }

    pub async fn list_pipelines(
        &self,
        namespace_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Metadata>, PipelineError> {
        let mut conn = self.storage.conn().await?;

        let rows = storage::pipeline_metadata::list(
            &mut conn,
            namespace_id,
            offset,
            limit,
            self.results_limit,
        )
        .await?;

        let mut pipelines = Vec::with_capacity(rows.len());
        for row in rows {
            pipelines.push(Metadata::try_from(row)?);
        }

        Ok(pipelines)
    }

    pub async fn list_configs(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Config>, PipelineError> {
        let mut conn = self.storage.conn().await?;

        let rows = storage::pipeline_configs::list(
            &mut conn,
            namespace_id,
            pipeline_id,
            offset,
            limit,
            self.results_limit,
        )
        .await?;

        let mut configs = Vec::with_capacity(rows.len());
        for row in rows {
            configs.push(load_config(&mut conn, row).await?);
        }

        Ok(configs)
    }

    pub async fn set_pipeline_state(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        state: PipelineState,
    ) -> Result<(), PipelineError> {
        let mut conn = self.storage.conn().await?;

        storage::pipeline_metadata::update_state(
            &mut conn,
            namespace_id,
            pipeline_id,
            &state.to_string(),
            crate::epoch_milli() as i64,
        )
        .await
        .map_err(|e| match e {
            StorageError::NotFound => PipelineError::NotFound,
            other => PipelineError::Storage(other),
        })?;

        let kind = match state {
            PipelineState::Disabled => Kind::DisabledPipeline {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
            },
            _ => Kind::EnabledPipeline {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
            },
        };
        let _ = self.event_bus.publish(kind).await;

        Ok(())
    }

    /// Remove a pipeline and everything under it (configs, runs, task
    /// executions, subscriptions) via cascade.
    pub async fn delete_pipeline(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
    ) -> Result<(), PipelineError> {
        let mut conn = self.storage.conn().await?;

        storage::pipeline_metadata::delete(&mut conn, namespace_id, pipeline_id)
            .await
            .map_err(|e| match e {
                StorageError::NotFound => PipelineError::NotFound,
                other => PipelineError::Storage(other),
            })?;

        let _ = self
            .event_bus
            .publish(Kind::DeletedPipeline {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
            })
            .await;

        Ok(())
    }
}

/// Hydrate a full [`Config`] from its row by loading the task rows for the
/// same version. Shared with the run engine, which pins runs to a version.
pub async fn load_config(
    conn: &mut SqliteConnection,
    row: storage::pipeline_configs::PipelineConfig,
) -> Result<Config, PipelineError> {
    let task_rows = storage::tasks::list(
        conn,
        &row.namespace_id,
        &row.pipeline_id,
        row.version,
    )
    .await?;

    Ok(Config::from_storage(row, task_rows)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines::{RequiredParentStatus, Task};
    use crate::storage::testutil::temp_db;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    async fn service() -> (tempfile::TempDir, PipelineService, Db) {
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
        drop(conn);

        let bus = EventBus::new(
            db.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            CancellationToken::new(),
        );

        (
            dir,
            PipelineService::new(db.clone(), bus, 5, 200),
            db,
        )
    }

    fn task(id: &str, parents: &[&str]) -> Task {
        Task {
            id: id.into(),
            description: String::new(),
            image: "ubuntu:latest".into(),
            registry_auth: None,
            depends_on: parents
                .iter()
                .map(|p| (p.to_string(), RequiredParentStatus::Success))
                .collect(),
            variables: vec![],
            entrypoint: None,
            command: None,
            inject_api_token: false,
        }
    }

    fn definition(tasks: Vec<Task>) -> PipelineDefinition {
        PipelineDefinition {
            id: "build".into(),
            name: "Build".into(),
            description: "test pipeline".into(),
            parallelism: 0,
            tasks,
        }
    }

    #[tokio::test]
    async fn register_creates_pipeline_and_assigns_versions() {
        let (_dir, service, _db) = service().await;

        let first = service
            .register_config("default", definition(vec![task("a", &[])]))
            .await
            .unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.state, ConfigState::Unreleased);

        let second = service
            .register_config("default", definition(vec![task("a", &[])]))
            .await
            .unwrap();
        assert_eq!(second.version, 2);

        let pipeline = service.get_pipeline("default", "build", None).await.unwrap();
        assert_eq!(pipeline.metadata.state, PipelineState::Active);
        assert_eq!(pipeline.config.version, 2);
        assert!(pipeline.config.tasks.contains_key("a"));
    }

    #[tokio::test]
    async fn register_rejects_invalid_dag() {
        let (_dir, service, _db) = service().await;

        let result = service
            .register_config(
                "default",
                definition(vec![task("a", &["b"]), task("b", &["a"])]),
            )
            .await;

        match result {
            Err(PipelineError::InvalidConfig(errors)) => assert!(!errors.is_empty()),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deploy_swaps_live_pointer_atomically() {
        let (_dir, service, db) = service().await;

        service
            .register_config("default", definition(vec![task("a", &[])]))
            .await
            .unwrap();
        service
            .register_config("default", definition(vec![task("a", &[])]))
            .await
            .unwrap();

        service.deploy("default", "build", 1).await.unwrap();
        service.deploy("default", "build", 2).await.unwrap();

        let mut conn = db.conn().await.unwrap();
        let live = storage::pipeline_configs::get_live(&mut conn, "default", "build")
            .await
            .unwrap();
        assert_eq!(live.version, 2);

        let old = storage::pipeline_configs::get(&mut conn, "default", "build", 1)
            .await
            .unwrap();
        assert_eq!(old.state, "deprecated");
        assert!(old.deprecated > 0);
    }

    #[tokio::test]
    async fn delete_config_guards_live_and_last() {
        let (_dir, service, _db) = service().await;

        service
            .register_config("default", definition(vec![task("a", &[])]))
            .await
            .unwrap();

        // Only one version exists.
        assert!(matches!(
            service.delete_config("default", "build", 1).await,
            Err(PipelineError::FailedPrecondition(_))
        ));

        service
            .register_config("default", definition(vec![task("a", &[])]))
            .await
            .unwrap();
        service.deploy("default", "build", 2).await.unwrap();

        // Version 2 is live.
        assert!(matches!(
            service.delete_config("default", "build", 2).await,
            Err(PipelineError::FailedPrecondition(_))
        ));

        service.delete_config("default", "build", 1).await.unwrap();
    }

    #[tokio::test]
    async fn version_pruning_respects_limit_and_live() {
        let (_dir, db) = temp_db().await;

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

        let bus = EventBus::new(
            db.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            CancellationToken::new(),
        );
        let service = PipelineService::new(db.clone(), bus, 2, 200);

        for _ in 0..4 {
            service
                .register_config("default", definition(vec![task("a", &[])]))
                .await
                .unwrap();
        }

        let configs = service.list_configs("default", "build", 0, 0).await.unwrap();
        let versions: Vec<u64> = configs.iter().map(|c| c.version).collect();
        assert_eq!(versions, vec![4, 3]);
    }

    #[tokio::test]
    async fn disable_and_delete() {
        let (_dir, service, _db) = service().await;

        service
            .register_config("default", definition(vec![task("a", &[])]))
            .await
            .unwrap();

        service
            .set_pipeline_state("default", "build", PipelineState::Disabled)
            .await
            .unwrap();
        let pipeline = service.get_pipeline("default", "build", None).await.unwrap();
        assert_eq!(pipeline.metadata.state, PipelineState::Disabled);

        service.delete_pipeline("default", "build").await.unwrap();
        assert!(matches!(
            service.get_pipeline("default", "build", None).await,
            Err(PipelineError::NotFound)
        ));
    }
}
