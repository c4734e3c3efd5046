//! Encrypted key/value storage for pipeline and global secrets.
//!
//! Values are encrypted before they touch disk and only ever decrypted on a
//! direct get. Listing returns keys alone, so secret material cannot leak
//! through enumeration.

pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret not found")]
    NotFound,

    #[error("secret already exists; use force to overwrite")]
    Exists,

    /// Stored ciphertext failed authentication. This is a hard error: it
    /// means tampering, a wrong encryption key, or disk corruption, and is
    /// never treated as a missing secret.
    #[error("could not decrypt secret; ciphertext corrupt or key mismatch: {0}")]
    Corrupt(String),

    #[error("unexpected secret store error: {0}")]
    Internal(String),
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, SecretStoreError>;

    /// Store a secret. Without `force`, writing an existing key fails with
    /// [`SecretStoreError::Exists`].
    async fn put(&self, key: &str, content: Vec<u8>, force: bool) -> Result<(), SecretStoreError>;

    async fn delete(&self, key: &str) -> Result<(), SecretStoreError>;

    /// Keys that start with `prefix`. Values are never included.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, SecretStoreError>;
}

/// Storage key for a secret scoped to a single pipeline.
pub fn pipeline_secret_key(namespace_id: &str, pipeline_id: &str, key: &str) -> String {
    format!("{namespace_id}_{pipeline_id}_{key}")
}

/// Prefix matching every secret of one pipeline.
pub fn pipeline_secret_prefix(namespace_id: &str, pipeline_id: &str) -> String {
    format!("{namespace_id}_{pipeline_id}_")
}

/// Storage key for a server-wide secret.
pub fn global_secret_key(key: &str) -> String {
    format!("global_secret_{key}")
}

/// Prefix matching every global secret.
pub const GLOBAL_SECRET_PREFIX: &str = "global_secret_";
