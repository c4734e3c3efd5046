//! Durable persistence for all of Gofer's entity tables.
//!
//! A single sqlite database (WAL mode) owns every table. Table modules expose
//! plain async functions that take a `&mut SqliteConnection`, so callers can
//! pass either a pooled connection or a transaction and group writes
//! atomically.

pub mod events;
pub mod extension_registrations;
pub mod namespaces;
pub mod pipeline_configs;
pub mod pipeline_metadata;
pub mod runs;
pub mod subscriptions;
pub mod system;
pub mod task_executions;
pub mod tasks;
pub mod tokens;

use std::path::Path;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{Pool, Sqlite, Transaction};
use thiserror::Error;

/// Default page size for list queries when the caller passes limit 0.
pub const DEFAULT_LIST_LIMIT: u64 = 200;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("requested entity not found")]
    NotFound,

    #[error("entity already exists")]
    Exists,

    #[error("could not establish connection to database: {0}")]
    Connection(String),

    #[error("unexpected storage error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StorageError::NotFound,
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => StorageError::Exists,
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StorageError::Connection(err.to_string())
            }
            _ => StorageError::Internal(err.to_string()),
        }
    }
}

/// Handle to the main database. Cheap to clone; all clones share one pool.
#[derive(Debug, Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub async fn new(path: &str) -> Result<Self, StorageError> {
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Connection(e.to_string()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = sqlx::SqlitePool::connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    pub async fn conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// Begin a transaction. Dropping it without commit rolls back.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StorageError> {
        self.pool
            .begin()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS namespaces (
                id          TEXT    NOT NULL,
                name        TEXT    NOT NULL,
                description TEXT    NOT NULL,
                created     INTEGER NOT NULL,
                PRIMARY KEY (id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS pipeline_metadata (
                namespace_id TEXT    NOT NULL,
                pipeline_id  TEXT    NOT NULL,
                state        TEXT    NOT NULL,
                created      INTEGER NOT NULL,
                modified     INTEGER NOT NULL,
                PRIMARY KEY (namespace_id, pipeline_id),
                FOREIGN KEY (namespace_id) REFERENCES namespaces(id) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS pipeline_configs (
                namespace_id TEXT    NOT NULL,
                pipeline_id  TEXT    NOT NULL,
                version      INTEGER NOT NULL,
                parallelism  INTEGER NOT NULL,
                name         TEXT    NOT NULL,
                description  TEXT    NOT NULL,
                registered   INTEGER NOT NULL,
                deprecated   INTEGER NOT NULL,
                state        TEXT    NOT NULL,
                PRIMARY KEY (namespace_id, pipeline_id, version),
                FOREIGN KEY (namespace_id, pipeline_id)
                    REFERENCES pipeline_metadata(namespace_id, pipeline_id) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                namespace_id            TEXT    NOT NULL,
                pipeline_id             TEXT    NOT NULL,
                pipeline_config_version INTEGER NOT NULL,
                task_id                 TEXT    NOT NULL,
                description             TEXT    NOT NULL,
                image                   TEXT    NOT NULL,
                registry_auth           TEXT,
                depends_on              TEXT    NOT NULL,
                variables               TEXT    NOT NULL,
                entrypoint              TEXT,
                command                 TEXT,
                inject_api_token        INTEGER NOT NULL,
                PRIMARY KEY (namespace_id, pipeline_id, pipeline_config_version, task_id),
                FOREIGN KEY (namespace_id, pipeline_id, pipeline_config_version)
                    REFERENCES pipeline_configs(namespace_id, pipeline_id, version) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS pipeline_subscriptions (
                namespace_id    TEXT NOT NULL,
                pipeline_id     TEXT NOT NULL,
                extension_name  TEXT NOT NULL,
                extension_label TEXT NOT NULL,
                settings        TEXT NOT NULL,
                status          TEXT NOT NULL,
                PRIMARY KEY (namespace_id, pipeline_id, extension_name, extension_label),
                FOREIGN KEY (namespace_id, pipeline_id)
                    REFERENCES pipeline_metadata(namespace_id, pipeline_id) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS extension_registrations (
                name          TEXT    NOT NULL,
                image         TEXT    NOT NULL,
                registry_auth TEXT,
                variables     TEXT    NOT NULL,
                status        TEXT    NOT NULL,
                key_id        TEXT    NOT NULL,
                created       INTEGER NOT NULL,
                PRIMARY KEY (name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                namespace_id            TEXT    NOT NULL,
                pipeline_id             TEXT    NOT NULL,
                pipeline_config_version INTEGER NOT NULL,
                run_id                  INTEGER NOT NULL,
                started                 INTEGER NOT NULL,
                ended                   INTEGER NOT NULL,
                state                   TEXT    NOT NULL,
                status                  TEXT    NOT NULL,
                status_reason           TEXT    NOT NULL,
                initiator               TEXT    NOT NULL,
                variables               TEXT    NOT NULL,
                token_id                TEXT,
                store_objects_expired   INTEGER NOT NULL,
                PRIMARY KEY (namespace_id, pipeline_id, run_id),
                FOREIGN KEY (namespace_id, pipeline_id)
                    REFERENCES pipeline_metadata(namespace_id, pipeline_id) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS task_executions (
                namespace_id  TEXT    NOT NULL,
                pipeline_id   TEXT    NOT NULL,
                run_id        INTEGER NOT NULL,
                task_id       TEXT    NOT NULL,
                created       INTEGER NOT NULL,
                started       INTEGER NOT NULL,
                ended         INTEGER NOT NULL,
                exit_code     INTEGER,
                logs_expired  INTEGER NOT NULL,
                logs_removed  INTEGER NOT NULL,
                state         TEXT    NOT NULL,
                status        TEXT    NOT NULL,
                status_reason TEXT    NOT NULL,
                variables     TEXT    NOT NULL,
                task          TEXT    NOT NULL,
                PRIMARY KEY (namespace_id, pipeline_id, run_id, task_id),
                FOREIGN KEY (namespace_id, pipeline_id, run_id)
                    REFERENCES runs(namespace_id, pipeline_id, run_id) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                kind    TEXT    NOT NULL,
                details TEXT    NOT NULL,
                emitted INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                id         TEXT    NOT NULL,
                hash       TEXT    NOT NULL UNIQUE,
                kind       TEXT    NOT NULL,
                namespaces TEXT    NOT NULL,
                metadata   TEXT    NOT NULL,
                created    INTEGER NOT NULL,
                expires    INTEGER NOT NULL,
                disabled   INTEGER NOT NULL,
                PRIMARY KEY (id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS system (
                id                         INTEGER NOT NULL CHECK (id = 1),
                bootstrap_token_created    INTEGER NOT NULL,
                ignore_pipeline_run_events INTEGER NOT NULL,
                PRIMARY KEY (id)
            )
            "#,
            r#"
            INSERT OR IGNORE INTO system (id, bootstrap_token_created, ignore_pipeline_run_events)
            VALUES (1, 0, 0)
            "#,
            "CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(namespace_id, pipeline_id, started)",
            "CREATE INDEX IF NOT EXISTS idx_events_emitted ON events(emitted)",
            "CREATE INDEX IF NOT EXISTS idx_tokens_hash ON tokens(hash)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }
}

/// Clamp a caller-supplied limit to the configured window.
pub fn list_limit(requested: u64, max: u64) -> i64 {
    let limit = if requested == 0 {
        DEFAULT_LIST_LIMIT
    } else {
        requested
    };

    limit.min(max.max(1)) as i64
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::Db;

    /// A throwaway database for table module tests.
    pub async fn temp_db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = Db::new(path.to_str().unwrap()).await.unwrap();
        (dir, db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_bootstrap_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gofer.db");
        let path = path.to_str().unwrap();

        let first = Db::new(path).await.unwrap();
        drop(first);
        // Reopening runs the schema statements again against existing tables.
        Db::new(path).await.unwrap();
    }

    #[test]
    fn list_limit_applies_default_and_cap() {
        assert_eq!(list_limit(0, 500), DEFAULT_LIST_LIMIT as i64);
        assert_eq!(list_limit(50, 500), 50);
        assert_eq!(list_limit(800, 500), 500);
        assert_eq!(list_limit(0, 100), 100);
    }
}
