//! Sqlite-backed object store.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{Pool, Sqlite};

use super::{ObjectStore, ObjectStoreError, Scope};

pub struct Engine {
    pool: Pool<Sqlite>,

    /// Objects held per pipeline scope before eviction kicks in. Run scopes
    /// are unbounded; they are reaped by run age instead.
    pipeline_object_limit: u64,
}

impl Engine {
    pub async fn new(path: &str, pipeline_object_limit: u64) -> Result<Self, ObjectStoreError> {
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ObjectStoreError::Internal(e.to_string()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .journal_mode(SqliteJournalMode::Wal);

        let pool = sqlx::SqlitePool::connect_with(options)
            .await
            .map_err(|e| ObjectStoreError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS objects (
                scope   TEXT    NOT NULL,
                key     TEXT    NOT NULL,
                value   BLOB    NOT NULL,
                created INTEGER NOT NULL,
                PRIMARY KEY (scope, key)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| ObjectStoreError::Internal(e.to_string()))?;

        Ok(Engine {
            pool,
            pipeline_object_limit,
        })
    }

    /// The oldest key in the scope, if the scope is at or past `limit`.
    async fn eviction_candidate(
        &self,
        scope_key: &str,
        limit: u64,
    ) -> Result<Option<String>, ObjectStoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM objects WHERE scope = ?")
            .bind(scope_key)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ObjectStoreError::Internal(e.to_string()))?;

        if (count as u64) < limit {
            return Ok(None);
        }

        let oldest: Option<String> = sqlx::query_scalar(
            "SELECT key FROM objects WHERE scope = ? ORDER BY created, key LIMIT 1",
        )
        .bind(scope_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ObjectStoreError::Internal(e.to_string()))?;

        Ok(oldest)
    }
}

#[async_trait]
impl ObjectStore for Engine {
    async fn get(&self, scope: &Scope, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let value: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT value FROM objects WHERE scope = ? AND key = ?")
                .bind(scope.storage_key())
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| ObjectStoreError::Internal(e.to_string()))?;

        value.ok_or(ObjectStoreError::NotFound)
    }

    async fn put(
        &self,
        scope: &Scope,
        key: &str,
        content: Vec<u8>,
        force: bool,
    ) -> Result<Option<String>, ObjectStoreError> {
        let scope_key = scope.storage_key();

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM objects WHERE scope = ? AND key = ?)")
                .bind(&scope_key)
                .bind(key)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| ObjectStoreError::Internal(e.to_string()))?;

        if exists && !force {
            return Err(ObjectStoreError::Exists);
        }

        // Overwrites replace in place and never change scope occupancy, so
        // eviction only applies to fresh inserts into a bounded scope.
        let mut evicted = None;
        if !exists {
            if let Scope::Pipeline { .. } = scope {
                if self.pipeline_object_limit > 0 {
                    evicted = self
                        .eviction_candidate(&scope_key, self.pipeline_object_limit)
                        .await?;
                }
            }
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ObjectStoreError::Internal(e.to_string()))?;

        if let Some(evicted_key) = &evicted {
            sqlx::query("DELETE FROM objects WHERE scope = ? AND key = ?")
                .bind(&scope_key)
                .bind(evicted_key)
                .execute(&mut *tx)
                .await
                .map_err(|e| ObjectStoreError::Internal(e.to_string()))?;
        }

        sqlx::query(
            "INSERT OR REPLACE INTO objects (scope, key, value, created) VALUES (?, ?, ?, ?)",
        )
        .bind(&scope_key)
        .bind(key)
        .bind(content)
        .bind(crate::epoch_milli() as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| ObjectStoreError::Internal(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| ObjectStoreError::Internal(e.to_string()))?;

        Ok(evicted)
    }

    async fn delete(&self, scope: &Scope, key: &str) -> Result<(), ObjectStoreError> {
        sqlx::query("DELETE FROM objects WHERE scope = ? AND key = ?")
            .bind(scope.storage_key())
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| ObjectStoreError::Internal(e.to_string()))?;

        Ok(())
    }

    async fn list_keys(&self, scope: &Scope) -> Result<Vec<String>, ObjectStoreError> {
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT key FROM objects WHERE scope = ? ORDER BY created, key",
        )
        .bind(scope.storage_key())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ObjectStoreError::Internal(e.to_string()))?;

        Ok(keys)
    }

    async fn delete_scope(&self, scope: &Scope) -> Result<u64, ObjectStoreError> {
        let result = sqlx::query("DELETE FROM objects WHERE scope = ?")
            .bind(scope.storage_key())
            .execute(&self.pool)
            .await
            .map_err(|e| ObjectStoreError::Internal(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline_scope() -> Scope {
        Scope::Pipeline {
            namespace_id: "default".into(),
            pipeline_id: "build".into(),
        }
    }

    fn run_scope(run_id: u64) -> Scope {
        Scope::Run {
            namespace_id: "default".into(),
            pipeline_id: "build".into(),
            run_id,
        }
    }

    async fn temp_engine(limit: u64) -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("objects.db");
        let engine = Engine::new(path.to_str().unwrap(), limit).await.unwrap();
        (dir, engine)
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let (_dir, engine) = temp_engine(10).await;
        let scope = pipeline_scope();

        engine
            .put(&scope, "artifact", b"bytes".to_vec(), false)
            .await
            .unwrap();
        assert_eq!(engine.get(&scope, "artifact").await.unwrap(), b"bytes");

        assert!(matches!(
            engine.get(&scope, "missing").await,
            Err(ObjectStoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn full_scope_evicts_oldest_insertion() {
        let (_dir, engine) = temp_engine(2).await;
        let scope = pipeline_scope();

        assert_eq!(
            engine.put(&scope, "k1", b"1".to_vec(), false).await.unwrap(),
            None
        );
        assert_eq!(
            engine.put(&scope, "k2", b"2".to_vec(), false).await.unwrap(),
            None
        );

        let evicted = engine.put(&scope, "k3", b"3".to_vec(), false).await.unwrap();
        assert_eq!(evicted.as_deref(), Some("k1"));

        let keys = engine.list_keys(&scope).await.unwrap();
        assert_eq!(keys, vec!["k2", "k3"]);
    }

    #[tokio::test]
    async fn forced_overwrite_never_evicts() {
        let (_dir, engine) = temp_engine(2).await;
        let scope = pipeline_scope();

        engine.put(&scope, "k1", b"1".to_vec(), false).await.unwrap();
        engine.put(&scope, "k2", b"2".to_vec(), false).await.unwrap();

        assert!(matches!(
            engine.put(&scope, "k2", b"again".to_vec(), false).await,
            Err(ObjectStoreError::Exists)
        ));

        let evicted = engine.put(&scope, "k2", b"again".to_vec(), true).await.unwrap();
        assert_eq!(evicted, None);
        assert_eq!(engine.get(&scope, "k2").await.unwrap(), b"again");
        assert_eq!(engine.list_keys(&scope).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn run_scope_is_unbounded_and_reapable() {
        let (_dir, engine) = temp_engine(1).await;
        let scope = run_scope(4);

        for i in 0..5 {
            let evicted = engine
                .put(&scope, &format!("k{i}"), vec![i], false)
                .await
                .unwrap();
            assert_eq!(evicted, None);
        }
        assert_eq!(engine.list_keys(&scope).await.unwrap().len(), 5);

        let removed = engine.delete_scope(&scope).await.unwrap();
        assert_eq!(removed, 5);
        assert!(engine.list_keys(&scope).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scopes_are_isolated() {
        let (_dir, engine) = temp_engine(10).await;

        engine
            .put(&pipeline_scope(), "shared", b"pipeline".to_vec(), false)
            .await
            .unwrap();
        engine
            .put(&run_scope(1), "shared", b"run".to_vec(), false)
            .await
            .unwrap();

        assert_eq!(
            engine.get(&pipeline_scope(), "shared").await.unwrap(),
            b"pipeline"
        );
        assert_eq!(engine.get(&run_scope(1), "shared").await.unwrap(), b"run");
    }
}
