use sqlx::SqliteConnection;

use super::{list_limit, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PipelineConfig {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub version: i64,
    pub parallelism: i64,
    pub name: String,
    pub description: String,
    pub registered: i64,
    pub deprecated: i64,
    pub state: String,
}

/// Insert a config, assigning the next version for the pipeline. Run this
/// inside the caller's transaction so the version assignment is atomic with
/// whatever else the caller persists (the task rows, usually).
pub async fn insert(
    conn: &mut SqliteConnection,
    config: &PipelineConfig,
) -> Result<i64, StorageError> {
    let version: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM pipeline_configs \
         WHERE namespace_id = ? AND pipeline_id = ?",
    )
    .bind(&config.namespace_id)
    .bind(&config.pipeline_id)
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query(
        "INSERT INTO pipeline_configs \
         (namespace_id, pipeline_id, version, parallelism, name, description, registered, \
          deprecated, state) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&config.namespace_id)
    .bind(&config.pipeline_id)
    .bind(version)
    .bind(config.parallelism)
    .bind(&config.name)
    .bind(&config.description)
    .bind(config.registered)
    .bind(config.deprecated)
    .bind(&config.state)
    .execute(conn)
    .await?;

    Ok(version)
}

pub async fn get(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    version: i64,
) -> Result<PipelineConfig, StorageError> {
    sqlx::query_as::<_, PipelineConfig>(
        "SELECT namespace_id, pipeline_id, version, parallelism, name, description, registered, \
         deprecated, state FROM pipeline_configs \
         WHERE namespace_id = ? AND pipeline_id = ? AND version = ?",
    )
    .bind(namespace_id)
    .bind(pipeline_id)
    .bind(version)
    .fetch_optional(conn)
    .await?
    .ok_or(StorageError::NotFound)
}

pub async fn get_latest(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<PipelineConfig, StorageError> {
    sqlx::query_as::<_, PipelineConfig>(
        "SELECT namespace_id, pipeline_id, version, parallelism, name, description, registered, \
         deprecated, state FROM pipeline_configs \
         WHERE namespace_id = ? AND pipeline_id = ? ORDER BY version DESC LIMIT 1",
    )
    .bind(namespace_id)
    .bind(pipeline_id)
    .fetch_optional(conn)
    .await?
    .ok_or(StorageError::NotFound)
}

/// The config currently deployed for the pipeline, if any.
pub async fn get_live(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<PipelineConfig, StorageError> {
    sqlx::query_as::<_, PipelineConfig>(
        "SELECT namespace_id, pipeline_id, version, parallelism, name, description, registered, \
         deprecated, state FROM pipeline_configs \
         WHERE namespace_id = ? AND pipeline_id = ? AND state = 'live'",
    )
    .bind(namespace_id)
    .bind(pipeline_id)
    .fetch_optional(conn)
    .await?
    .ok_or(StorageError::NotFound)
}

pub async fn list(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    offset: u64,
    limit: u64,
    max_limit: u64,
) -> Result<Vec<PipelineConfig>, StorageError> {
    let configs = sqlx::query_as::<_, PipelineConfig>(
        "SELECT namespace_id, pipeline_id, version, parallelism, name, description, registered, \
         deprecated, state FROM pipeline_configs \
         WHERE namespace_id = ? AND pipeline_id = ? ORDER BY version DESC LIMIT ? OFFSET ?",
    )
    .bind(namespace_id)
    .bind(pipeline_id)
    .bind(list_limit(limit, max_limit))
    .bind(offset as i64)
    .fetch_all(conn)
    .await?;

    Ok(configs)
}

pub async fn update_state(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    version: i64,
    state: &str,
    deprecated: Option<i64>,
) -> Result<(), StorageError> {
    let result = sqlx::query(
        "UPDATE pipeline_configs SET state = ?, deprecated = COALESCE(?, deprecated) \
         WHERE namespace_id = ? AND pipeline_id = ? AND version = ?",
    )
    .bind(state)
    .bind(deprecated)
    .bind(namespace_id)
    .bind(pipeline_id)
    .bind(version)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}

pub async fn delete(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    version: i64,
) -> Result<(), StorageError> {
    let result = sqlx::query(
        "DELETE FROM pipeline_configs WHERE namespace_id = ? AND pipeline_id = ? AND version = ?",
    )
    .bind(namespace_id)
    .bind(pipeline_id)
    .bind(version)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}

/// Non-live versions past the newest `keep`, oldest first. The pipeline
/// service uses this to enforce the version retention limit.
pub async fn list_prunable_versions(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    keep: u64,
) -> Result<Vec<i64>, StorageError> {
    let versions: Vec<i64> = sqlx::query_scalar(
        "SELECT version FROM pipeline_configs \
         WHERE namespace_id = ? AND pipeline_id = ? AND state != 'live' \
         ORDER BY version DESC LIMIT -1 OFFSET ?",
    )
    .bind(namespace_id)
    .bind(pipeline_id)
    .bind(keep as i64)
    .fetch_all(conn)
    .await?;

    Ok(versions.into_iter().rev().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{namespaces, pipeline_metadata, testutil::temp_db};

    async fn seed(conn: &mut SqliteConnection) {
        namespaces::insert(
            conn,
            &namespaces::Namespace {
                id: "default".into(),
                name: "Default".into(),
                description: String::new(),
                created: 0,
            },
        )
        .await
        .unwrap();

        pipeline_metadata::insert(
            conn,
            &pipeline_metadata::PipelineMetadata {
                namespace_id: "default".into(),
                pipeline_id: "build".into(),
                state: "active".into(),
                created: 0,
                modified: 0,
            },
        )
        .await
        .unwrap();
    }

    fn sample() -> PipelineConfig {
        PipelineConfig {
            namespace_id: "default".into(),
            pipeline_id: "build".into(),
            version: 0,
            parallelism: 0,
            name: "Build".into(),
            description: String::new(),
            registered: 1,
            deprecated: 0,
            state: "unreleased".into(),
        }
    }

    #[tokio::test]
    async fn versions_are_assigned_monotonically() {
        let (_dir, db) = temp_db().await;
        let mut conn = db.conn().await.unwrap();
        seed(&mut conn).await;

        assert_eq!(insert(&mut conn, &sample()).await.unwrap(), 1);
        assert_eq!(insert(&mut conn, &sample()).await.unwrap(), 2);
        assert_eq!(insert(&mut conn, &sample()).await.unwrap(), 3);

        let latest = get_latest(&mut conn, "default", "build").await.unwrap();
        assert_eq!(latest.version, 3);
    }

    #[tokio::test]
    async fn live_lookup_and_state_swap() {
        let (_dir, db) = temp_db().await;
        let mut conn = db.conn().await.unwrap();
        seed(&mut conn).await;

        insert(&mut conn, &sample()).await.unwrap();
        assert!(matches!(
            get_live(&mut conn, "default", "build").await,
            Err(StorageError::NotFound)
        ));

        update_state(&mut conn, "default", "build", 1, "live", None)
            .await
            .unwrap();
        assert_eq!(
            get_live(&mut conn, "default", "build").await.unwrap().version,
            1
        );
    }

    #[tokio::test]
    async fn prunable_versions_skip_live_and_newest() {
        let (_dir, db) = temp_db().await;
        let mut conn = db.conn().await.unwrap();
        seed(&mut conn).await;

        for _ in 0..4 {
            insert(&mut conn, &sample()).await.unwrap();
        }
        update_state(&mut conn, "default", "build", 2, "live", None)
            .await
            .unwrap();

        // Keep the 2 newest non-live versions: of [1, 3, 4] only 1 is prunable.
        let prunable = list_prunable_versions(&mut conn, "default", "build", 2)
            .await
            .unwrap();
        assert_eq!(prunable, vec![1]);
    }
}
