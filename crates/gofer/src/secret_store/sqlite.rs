//! Sqlite-backed secret store with AES-256-GCM encryption at rest.

use std::path::Path;

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{Pool, Sqlite};

use super::{SecretStore, SecretStoreError};

/// AES-GCM nonce length in bytes. Stored as a prefix of each ciphertext blob;
/// the 16 byte authentication tag is appended by the cipher.
const NONCE_LENGTH: usize = 12;

pub struct Engine {
    pool: Pool<Sqlite>,
    cipher: Aes256Gcm,
}

impl Engine {
    /// Open (or create) the secret database at `path`, encrypting with the
    /// given 32 byte key.
    pub async fn new(path: &str, encryption_key: &[u8; 32]) -> Result<Self, SecretStoreError> {
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SecretStoreError::Internal(e.to_string()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .journal_mode(SqliteJournalMode::Wal);

        let pool = sqlx::SqlitePool::connect_with(options)
            .await
            .map_err(|e| SecretStoreError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS secrets (
                key   TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (key)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| SecretStoreError::Internal(e.to_string()))?;

        Ok(Engine {
            pool,
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(encryption_key)),
        })
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecretStoreError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| SecretStoreError::Internal(format!("encryption failed: {e}")))?;

        let mut blob = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, SecretStoreError> {
        if blob.len() < NONCE_LENGTH {
            return Err(SecretStoreError::Corrupt(
                "stored blob shorter than nonce".into(),
            ));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LENGTH);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| SecretStoreError::Corrupt(e.to_string()))
    }
}

#[async_trait]
impl SecretStore for Engine {
    async fn get(&self, key: &str) -> Result<Vec<u8>, SecretStoreError> {
        let blob: Option<Vec<u8>> = sqlx::query_scalar("SELECT value FROM secrets WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SecretStoreError::Internal(e.to_string()))?;

        let blob = blob.ok_or(SecretStoreError::NotFound)?;
        self.decrypt(&blob)
    }

    async fn put(&self, key: &str, content: Vec<u8>, force: bool) -> Result<(), SecretStoreError> {
        let blob = self.encrypt(&content)?;

        let query = if force {
            "INSERT OR REPLACE INTO secrets (key, value) VALUES (?, ?)"
        } else {
            "INSERT INTO secrets (key, value) VALUES (?, ?)"
        };

        sqlx::query(query)
            .bind(key)
            .bind(blob)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                    SecretStoreError::Exists
                }
                _ => SecretStoreError::Internal(e.to_string()),
            })?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SecretStoreError> {
        sqlx::query("DELETE FROM secrets WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| SecretStoreError::Internal(e.to_string()))?;

        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, SecretStoreError> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));

        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT key FROM secrets WHERE key LIKE ? ESCAPE '\\' ORDER BY key",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SecretStoreError::Internal(e.to_string()))?;

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: [u8; 32] = [7u8; 32];

    async fn temp_engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.db");
        let engine = Engine::new(path.to_str().unwrap(), &TEST_KEY).await.unwrap();
        (dir, engine)
    }

    #[tokio::test]
    async fn round_trip_preserves_plaintext() {
        let (_dir, engine) = temp_engine().await;

        engine
            .put("default_build_db_pw", b"hunter2".to_vec(), false)
            .await
            .unwrap();

        let plaintext = engine.get("default_build_db_pw").await.unwrap();
        assert_eq!(plaintext, b"hunter2");
    }

    #[tokio::test]
    async fn put_without_force_refuses_overwrite() {
        let (_dir, engine) = temp_engine().await;

        engine.put("k", b"one".to_vec(), false).await.unwrap();
        assert!(matches!(
            engine.put("k", b"two".to_vec(), false).await,
            Err(SecretStoreError::Exists)
        ));

        engine.put("k", b"two".to_vec(), true).await.unwrap();
        assert_eq!(engine.get("k").await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn tampered_ciphertext_is_corrupt_not_missing() {
        let (_dir, engine) = temp_engine().await;

        engine.put("k", b"value".to_vec(), false).await.unwrap();

        // Flip a byte in the stored blob behind the store's back.
        let mut blob: Vec<u8> = sqlx::query_scalar("SELECT value FROM secrets WHERE key = 'k'")
            .fetch_one(&engine.pool)
            .await
            .unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        sqlx::query("UPDATE secrets SET value = ? WHERE key = 'k'")
            .bind(blob)
            .execute(&engine.pool)
            .await
            .unwrap();

        assert!(matches!(
            engine.get("k").await,
            Err(SecretStoreError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn truncated_blob_is_corrupt() {
        let (_dir, engine) = temp_engine().await;

        sqlx::query("INSERT INTO secrets (key, value) VALUES ('k', ?)")
            .bind(vec![1u8, 2, 3])
            .execute(&engine.pool)
            .await
            .unwrap();

        assert!(matches!(
            engine.get("k").await,
            Err(SecretStoreError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn listing_returns_keys_only_under_prefix() {
        let (_dir, engine) = temp_engine().await;

        engine
            .put("default_build_one", b"1".to_vec(), false)
            .await
            .unwrap();
        engine
            .put("default_build_two", b"2".to_vec(), false)
            .await
            .unwrap();
        engine
            .put("global_secret_other", b"3".to_vec(), false)
            .await
            .unwrap();

        let keys = engine.list_keys("default_build_").await.unwrap();
        assert_eq!(keys, vec!["default_build_one", "default_build_two"]);
    }

    #[tokio::test]
    async fn wrong_key_cannot_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.db");
        let path = path.to_str().unwrap();

        let engine = Engine::new(path, &TEST_KEY).await.unwrap();
        engine.put("k", b"value".to_vec(), false).await.unwrap();
        drop(engine);

        let other = Engine::new(path, &[9u8; 32]).await.unwrap();
        assert!(matches!(
            other.get("k").await,
            Err(SecretStoreError::Corrupt(_))
        ));
    }
}
