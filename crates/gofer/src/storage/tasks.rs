use sqlx::SqliteConnection;

use super::StorageError;

/// A task row belongs to one version of a pipeline config. Complex fields
/// (depends_on, variables, entrypoint, command) are stored as JSON text.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Task {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub pipeline_config_version: i64,
    pub task_id: String,
    pub description: String,
    pub image: String,
    pub registry_auth: Option<String>,
    pub depends_on: String,
    pub variables: String,
    pub entrypoint: Option<String>,
    pub command: Option<String>,
    pub inject_api_token: bool,
}

pub async fn insert(conn: &mut SqliteConnection, task: &Task) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO tasks \
         (namespace_id, pipeline_id, pipeline_config_version, task_id, description, image, \
          registry_auth, depends_on, variables, entrypoint, command, inject_api_token) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&task.namespace_id)
    .bind(&task.pipeline_id)
    .bind(task.pipeline_config_version)
    .bind(&task.task_id)
    .bind(&task.description)
    .bind(&task.image)
    .bind(&task.registry_auth)
    .bind(&task.depends_on)
    .bind(&task.variables)
    .bind(&task.entrypoint)
    .bind(&task.command)
    .bind(task.inject_api_token)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn get(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    version: i64,
    task_id: &str,
) -> Result<Task, StorageError> {
    sqlx::query_as::<_, Task>(
        "SELECT namespace_id, pipeline_id, pipeline_config_version, task_id, description, image, \
         registry_auth, depends_on, variables, entrypoint, command, inject_api_token FROM tasks \
         WHERE namespace_id = ? AND pipeline_id = ? AND pipeline_config_version = ? AND task_id = ?",
    )
    .bind(namespace_id)
    .bind(pipeline_id)
    .bind(version)
    .bind(task_id)
    .fetch_optional(conn)
    .await?
    .ok_or(StorageError::NotFound)
}

pub async fn list(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    version: i64,
) -> Result<Vec<Task>, StorageError> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT namespace_id, pipeline_id, pipeline_config_version, task_id, description, image, \
         registry_auth, depends_on, variables, entrypoint, command, inject_api_token FROM tasks \
         WHERE namespace_id = ? AND pipeline_id = ? AND pipeline_config_version = ? \
         ORDER BY task_id",
    )
    .bind(namespace_id)
    .bind(pipeline_id)
    .bind(version)
    .fetch_all(conn)
    .await?;

    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{namespaces, pipeline_configs, pipeline_metadata, testutil::temp_db};

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

        pipeline_configs::insert(
            conn,
            &pipeline_configs::PipelineConfig {
                namespace_id: "default".into(),
                pipeline_id: "build".into(),
                version: 0,
                parallelism: 0,
                name: "Build".into(),
                description: String::new(),
                registered: 0,
                deprecated: 0,
                state: "unreleased".into(),
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn insert_and_list_by_version() {
        let (_dir, db) = temp_db().await;
        let mut conn = db.conn().await.unwrap();
        seed(&mut conn).await;

        for id in ["compile", "test"] {
            insert(
                &mut conn,
                &Task {
                    namespace_id: "default".into(),
                    pipeline_id: "build".into(),
                    pipeline_config_version: 1,
                    task_id: id.into(),
                    description: String::new(),
                    image: "ubuntu:latest".into(),
                    registry_auth: None,
                    depends_on: "{}".into(),
                    variables: "[]".into(),
                    entrypoint: None,
                    command: None,
                    inject_api_token: false,
                },
            )
            .await
            .unwrap();
        }

        let tasks = list(&mut conn, "default", "build", 1).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].task_id, "compile");

        let fetched = get(&mut conn, "default", "build", 1, "test").await.unwrap();
        assert_eq!(fetched.image, "ubuntu:latest");
    }
}
