use sqlx::SqliteConnection;

use super::StorageError;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TaskExecution {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub run_id: i64,
    pub task_id: String,
    pub created: i64,
    pub started: i64,
    pub ended: i64,
    pub exit_code: Option<i64>,
    pub logs_expired: bool,
    pub logs_removed: bool,
    pub state: String,
    pub status: String,
    pub status_reason: String,
    pub variables: String,
    pub task: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpdatableFields {
    pub started: Option<i64>,
    pub ended: Option<i64>,
    pub exit_code: Option<i64>,
    pub state: Option<String>,
    pub status: Option<String>,
    pub status_reason: Option<String>,
    pub variables: Option<String>,
    pub logs_expired: Option<bool>,
    pub logs_removed: Option<bool>,
}

pub async fn insert(
    conn: &mut SqliteConnection,
    execution: &TaskExecution,
) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO task_executions \
         (namespace_id, pipeline_id, run_id, task_id, created, started, ended, exit_code, \
          logs_expired, logs_removed, state, status, status_reason, variables, task) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&execution.namespace_id)
    .bind(&execution.pipeline_id)
    .bind(execution.run_id)
    .bind(&execution.task_id)
    .bind(execution.created)
    .bind(execution.started)
    .bind(execution.ended)
    .bind(execution.exit_code)
    .bind(execution.logs_expired)
    .bind(execution.logs_removed)
    .bind(&execution.state)
    .bind(&execution.status)
    .bind(&execution.status_reason)
    .bind(&execution.variables)
    .bind(&execution.task)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn get(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: i64,
    task_id: &str,
) -> Result<TaskExecution, StorageError> {
    sqlx::query_as::<_, TaskExecution>(
        "SELECT namespace_id, pipeline_id, run_id, task_id, created, started, ended, exit_code, \
         logs_expired, logs_removed, state, status, status_reason, variables, task \
         FROM task_executions \
         WHERE namespace_id = ? AND pipeline_id = ? AND run_id = ? AND task_id = ?",
    )
    .bind(namespace_id)
    .bind(pipeline_id)
    .bind(run_id)
    .bind(task_id)
    .fetch_optional(conn)
    .await?
    .ok_or(StorageError::NotFound)
}

pub async fn list(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: i64,
) -> Result<Vec<TaskExecution>, StorageError> {
    let executions = sqlx::query_as::<_, TaskExecution>(
        "SELECT namespace_id, pipeline_id, run_id, task_id, created, started, ended, exit_code, \
         logs_expired, logs_removed, state, status, status_reason, variables, task \
         FROM task_executions \
         WHERE namespace_id = ? AND pipeline_id = ? AND run_id = ? ORDER BY task_id",
    )
    .bind(namespace_id)
    .bind(pipeline_id)
    .bind(run_id)
    .fetch_all(conn)
    .await?;

    Ok(executions)
}

pub async fn update(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: i64,
    task_id: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let result = sqlx::query(
        "UPDATE task_executions SET \
         started = COALESCE(?, started), \
         ended = COALESCE(?, ended), \
         exit_code = COALESCE(?, exit_code), \
         state = COALESCE(?, state), \
         status = COALESCE(?, status), \
         status_reason = COALESCE(?, status_reason), \
         variables = COALESCE(?, variables), \
         logs_expired = COALESCE(?, logs_expired), \
         logs_removed = COALESCE(?, logs_removed) \
         WHERE namespace_id = ? AND pipeline_id = ? AND run_id = ? AND task_id = ?",
    )
    .bind(fields.started)
    .bind(fields.ended)
    .bind(fields.exit_code)
    .bind(fields.state)
    .bind(fields.status)
    .bind(fields.status_reason)
    .bind(fields.variables)
    .bind(fields.logs_expired)
    .bind(fields.logs_removed)
    .bind(namespace_id)
    .bind(pipeline_id)
    .bind(run_id)
    .bind(task_id)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}

/// Expire logs for every execution in runs at or before `run_id_cutoff`.
pub async fn expire_logs_before(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    run_id_cutoff: i64,
) -> Result<Vec<TaskExecution>, StorageError> {
    let expired = sqlx::query_as::<_, TaskExecution>(
        "SELECT namespace_id, pipeline_id, run_id, task_id, created, started, ended, exit_code, \
         logs_expired, logs_removed, state, status, status_reason, variables, task \
         FROM task_executions \
         WHERE namespace_id = ? AND pipeline_id = ? AND run_id <= ? AND logs_expired = 0",
    )
    .bind(namespace_id)
    .bind(pipeline_id)
    .bind(run_id_cutoff)
    .fetch_all(&mut *conn)
    .await?;

    sqlx::query(
        "UPDATE task_executions SET logs_expired = 1 \
         WHERE namespace_id = ? AND pipeline_id = ? AND run_id <= ?",
    )
    .bind(namespace_id)
    .bind(pipeline_id)
    .bind(run_id_cutoff)
    .execute(conn)
    .await?;

    Ok(expired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{namespaces, pipeline_metadata, runs, testutil::temp_db};

    async fn seed(conn: &mut SqliteConnection, run_id: i64) {
        if run_id == 1 {
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

        runs::insert(
            conn,
            &runs::Run {
                namespace_id: "default".into(),
                pipeline_id: "build".into(),
                pipeline_config_version: 1,
                run_id,
                started: 0,
                ended: 0,
                state: "running".into(),
                status: "unknown".into(),
                status_reason: "null".into(),
                initiator: "{}".into(),
                variables: "[]".into(),
                token_id: None,
                store_objects_expired: false,
            },
        )
        .await
        .unwrap();
    }

    fn sample(run_id: i64, task_id: &str) -> TaskExecution {
        TaskExecution {
            namespace_id: "default".into(),
            pipeline_id: "build".into(),
            run_id,
            task_id: task_id.into(),
            created: 0,
            started: 0,
            ended: 0,
            exit_code: None,
            logs_expired: false,
            logs_removed: false,
            state: "processing".into(),
            status: "unknown".into(),
            status_reason: "null".into(),
            variables: "[]".into(),
            task: "{}".into(),
        }
    }

    #[tokio::test]
    async fn update_records_terminal_details() {
        let (_dir, db) = temp_db().await;
        let mut conn = db.conn().await.unwrap();
        seed(&mut conn, 1).await;

        insert(&mut conn, &sample(1, "compile")).await.unwrap();

        update(
            &mut conn,
            "default",
            "build",
            1,
            "compile",
            UpdatableFields {
                state: Some("complete".into()),
                status: Some("failed".into()),
                exit_code: Some(2),
                ended: Some(50),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let execution = get(&mut conn, "default", "build", 1, "compile").await.unwrap();
        assert_eq!(execution.state, "complete");
        assert_eq!(execution.exit_code, Some(2));
    }

    #[tokio::test]
    async fn log_expiry_cutoff_applies_to_older_runs_only() {
        let (_dir, db) = temp_db().await;
        let mut conn = db.conn().await.unwrap();
        seed(&mut conn, 1).await;
        seed(&mut conn, 2).await;

        insert(&mut conn, &sample(1, "compile")).await.unwrap();
        insert(&mut conn, &sample(2, "compile")).await.unwrap();

        let expired = expire_logs_before(&mut conn, "default", "build", 1)
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].run_id, 1);

        assert!(get(&mut conn, "default", "build", 1, "compile")
            .await
            .unwrap()
            .logs_expired);
        assert!(!get(&mut conn, "default", "build", 2, "compile")
            .await
            .unwrap()
            .logs_expired);
    }
}
