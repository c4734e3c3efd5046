use sqlx::SqliteConnection;

use super::{list_limit, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PipelineMetadata {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub state: String,
    pub created: i64,
    pub modified: i64,
}

pub async fn insert(
    conn: &mut SqliteConnection,
    metadata: &PipelineMetadata,
) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO pipeline_metadata (namespace_id, pipeline_id, state, created, modified) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&metadata.namespace_id)
    .bind(&metadata.pipeline_id)
    .bind(&metadata.state)
    .bind(metadata.created)
    .bind(metadata.modified)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn get(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<PipelineMetadata, StorageError> {
    sqlx::query_as::<_, PipelineMetadata>(
        "SELECT namespace_id, pipeline_id, state, created, modified FROM pipeline_metadata \
         WHERE namespace_id = ? AND pipeline_id = ?",
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
    offset: u64,
    limit: u64,
    max_limit: u64,
) -> Result<Vec<PipelineMetadata>, StorageError> {
    let pipelines = sqlx::query_as::<_, PipelineMetadata>(
        "SELECT namespace_id, pipeline_id, state, created, modified FROM pipeline_metadata \
         WHERE namespace_id = ? ORDER BY pipeline_id LIMIT ? OFFSET ?",
    )
    .bind(namespace_id)
    .bind(list_limit(limit, max_limit))
    .bind(offset as i64)
    .fetch_all(conn)
    .await?;

    Ok(pipelines)
}

pub async fn update_state(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    state: &str,
    modified: i64,
) -> Result<(), StorageError> {
    let result = sqlx::query(
        "UPDATE pipeline_metadata SET state = ?, modified = ? \
         WHERE namespace_id = ? AND pipeline_id = ?",
    )
    .bind(state)
    .bind(modified)
    .bind(namespace_id)
    .bind(pipeline_id)
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
) -> Result<(), StorageError> {
    let result = sqlx::query(
        "DELETE FROM pipeline_metadata WHERE namespace_id = ? AND pipeline_id = ?",
    )
    .bind(namespace_id)
    .bind(pipeline_id)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{namespaces, testutil::temp_db};

    async fn seed_namespace(conn: &mut SqliteConnection) {
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
    }

    #[tokio::test]
    async fn insert_get_update_delete() {
        let (_dir, db) = temp_db().await;
        let mut conn = db.conn().await.unwrap();
        seed_namespace(&mut conn).await;

        let metadata = PipelineMetadata {
            namespace_id: "default".into(),
            pipeline_id: "build".into(),
            state: "active".into(),
            created: 10,
            modified: 10,
        };

        insert(&mut conn, &metadata).await.unwrap();
        assert!(matches!(
            insert(&mut conn, &metadata).await,
            Err(StorageError::Exists)
        ));

        update_state(&mut conn, "default", "build", "disabled", 20)
            .await
            .unwrap();
        let fetched = get(&mut conn, "default", "build").await.unwrap();
        assert_eq!(fetched.state, "disabled");
        assert_eq!(fetched.modified, 20);

        delete(&mut conn, "default", "build").await.unwrap();
        assert!(matches!(
            get(&mut conn, "default", "build").await,
            Err(StorageError::NotFound)
        ));
    }
}
