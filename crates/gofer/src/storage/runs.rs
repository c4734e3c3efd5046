use sqlx::SqliteConnection;

use super::{list_limit, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Run {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub pipeline_config_version: i64,
    pub run_id: i64,
    pub started: i64,
    pub ended: i64,
    pub state: String,
    pub status: String,
    pub status_reason: String,
    pub initiator: String,
    pub variables: String,
    pub token_id: Option<String>,
    pub store_objects_expired: bool,
}

/// Fields the run engine may change after insert. `None` leaves the column
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdatableFields {
    pub ended: Option<i64>,
    pub state: Option<String>,
    pub status: Option<String>,
    pub status_reason: Option<String>,
    pub variables: Option<String>,
    pub store_objects_expired: Option<bool>,
}

pub async fn insert(conn: &mut SqliteConnection, run: &Run) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO runs \
         (namespace_id, pipeline_id, pipeline_config_version, run_id, started, ended, state, \
          status, status_reason, initiator, variables, token_id, store_objects_expired) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&run.namespace_id)
    .bind(&run.pipeline_id)
    .bind(run.pipeline_config_version)
    .bind(run.run_id)
    .bind(run.started)
    .bind(run.ended)
    .bind(&run.state)
    .bind(&run.status)
    .bind(&run.status_reason)
    .bind(&run.initiator)
    .bind(&run.variables)
    .bind(&run.token_id)
    .bind(run.store_objects_expired)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn get(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: i64,
) -> Result<Run, StorageError> {
    sqlx::query_as::<_, Run>(
        "SELECT namespace_id, pipeline_id, pipeline_config_version, run_id, started, ended, \
         state, status, status_reason, initiator, variables, token_id, store_objects_expired \
         FROM runs WHERE namespace_id = ? AND pipeline_id = ? AND run_id = ?",
    )
    .bind(namespace_id)
    .bind(pipeline_id)
    .bind(run_id)
    .fetch_optional(conn)
    .await?
    .ok_or(StorageError::NotFound)
}

pub async fn get_latest(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<Run, StorageError> {
    sqlx::query_as::<_, Run>(
        "SELECT namespace_id, pipeline_id, pipeline_config_version, run_id, started, ended, \
         state, status, status_reason, initiator, variables, token_id, store_objects_expired \
         FROM runs WHERE namespace_id = ? AND pipeline_id = ? ORDER BY run_id DESC LIMIT 1",
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
    reverse: bool,
) -> Result<Vec<Run>, StorageError> {
    let order = if reverse { "DESC" } else { "ASC" };
    let query = format!(
        "SELECT namespace_id, pipeline_id, pipeline_config_version, run_id, started, ended, \
         state, status, status_reason, initiator, variables, token_id, store_objects_expired \
         FROM runs WHERE namespace_id = ? AND pipeline_id = ? ORDER BY run_id {order} \
         LIMIT ? OFFSET ?"
    );

    let runs = sqlx::query_as::<_, Run>(&query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(list_limit(limit, max_limit))
        .bind(offset as i64)
        .fetch_all(conn)
        .await?;

    Ok(runs)
}

/// Runs for the pipeline that have not reached a terminal state.
pub async fn list_unfinished(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<Vec<Run>, StorageError> {
    let runs = sqlx::query_as::<_, Run>(
        "SELECT namespace_id, pipeline_id, pipeline_config_version, run_id, started, ended, \
         state, status, status_reason, initiator, variables, token_id, store_objects_expired \
         FROM runs WHERE namespace_id = ? AND pipeline_id = ? AND state != 'complete' \
         ORDER BY run_id",
    )
    .bind(namespace_id)
    .bind(pipeline_id)
    .fetch_all(conn)
    .await?;

    Ok(runs)
}

/// All non-terminal runs across every pipeline. Used by startup recovery.
pub async fn list_unfinished_all(
    conn: &mut SqliteConnection,
) -> Result<Vec<Run>, StorageError> {
    let runs = sqlx::query_as::<_, Run>(
        "SELECT namespace_id, pipeline_id, pipeline_config_version, run_id, started, ended, \
         state, status, status_reason, initiator, variables, token_id, store_objects_expired \
         FROM runs WHERE state != 'complete' ORDER BY namespace_id, pipeline_id, run_id",
    )
    .fetch_all(conn)
    .await?;

    Ok(runs)
}

pub async fn update(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: i64,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let result = sqlx::query(
        "UPDATE runs SET \
         ended = COALESCE(?, ended), \
         state = COALESCE(?, state), \
         status = COALESCE(?, status), \
         status_reason = COALESCE(?, status_reason), \
         variables = COALESCE(?, variables), \
         store_objects_expired = COALESCE(?, store_objects_expired) \
         WHERE namespace_id = ? AND pipeline_id = ? AND run_id = ?",
    )
    .bind(fields.ended)
    .bind(fields.state)
    .bind(fields.status)
    .bind(fields.status_reason)
    .bind(fields.variables)
    .bind(fields.store_objects_expired)
    .bind(namespace_id)
    .bind(pipeline_id)
    .bind(run_id)
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

    fn sample(run_id: i64, state: &str) -> Run {
        Run {
            namespace_id: "default".into(),
            pipeline_id: "build".into(),
            pipeline_config_version: 1,
            run_id,
            started: run_id * 100,
            ended: 0,
            state: state.into(),
            status: "unknown".into(),
            status_reason: "null".into(),
            initiator: "{}".into(),
            variables: "[]".into(),
            token_id: None,
            store_objects_expired: false,
        }
    }

    #[tokio::test]
    async fn latest_and_unfinished_views() {
        let (_dir, db) = temp_db().await;
        let mut conn = db.conn().await.unwrap();
        seed(&mut conn).await;

        insert(&mut conn, &sample(1, "complete")).await.unwrap();
        insert(&mut conn, &sample(2, "running")).await.unwrap();
        insert(&mut conn, &sample(3, "pending")).await.unwrap();

        let latest = get_latest(&mut conn, "default", "build").await.unwrap();
        assert_eq!(latest.run_id, 3);

        let unfinished = list_unfinished(&mut conn, "default", "build").await.unwrap();
        let ids: Vec<_> = unfinished.iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn partial_update_leaves_other_columns() {
        let (_dir, db) = temp_db().await;
        let mut conn = db.conn().await.unwrap();
        seed(&mut conn).await;

        insert(&mut conn, &sample(1, "running")).await.unwrap();

        update(
            &mut conn,
            "default",
            "build",
            1,
            UpdatableFields {
                state: Some("complete".into()),
                status: Some("successful".into()),
                ended: Some(900),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let run = get(&mut conn, "default", "build", 1).await.unwrap();
        assert_eq!(run.state, "complete");
        assert_eq!(run.status, "successful");
        assert_eq!(run.ended, 900);
        assert_eq!(run.started, 100);
        assert_eq!(run.variables, "[]");
    }
}
