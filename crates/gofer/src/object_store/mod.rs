//! Blob storage for pipeline and run scoped objects.
//!
//! Pipeline objects live until evicted: each pipeline holds a bounded number
//! and inserting past the bound drops the oldest. Run objects are unbounded
//! but reaped once their run falls out of the configured expiry window.

pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found")]
    NotFound,

    #[error("object already exists; use force to overwrite")]
    Exists,

    #[error("unexpected object store error: {0}")]
    Internal(String),
}

/// Which bucket an object belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Pipeline {
        namespace_id: String,
        pipeline_id: String,
    },
    Run {
        namespace_id: String,
        pipeline_id: String,
        run_id: u64,
    },
}

impl Scope {
    /// Flattened storage key for the scope.
    pub fn storage_key(&self) -> String {
        match self {
            Scope::Pipeline {
                namespace_id,
                pipeline_id,
            } => format!("pipeline_{namespace_id}_{pipeline_id}"),
            Scope::Run {
                namespace_id,
                pipeline_id,
                run_id,
            } => format!("run_{namespace_id}_{pipeline_id}_{run_id}"),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, scope: &Scope, key: &str) -> Result<Vec<u8>, ObjectStoreError>;

    /// Store an object. When a bounded scope is full the oldest object (by
    /// insertion time) is evicted and its key returned. A forced overwrite of
    /// an existing key never evicts.
    async fn put(
        &self,
        scope: &Scope,
        key: &str,
        content: Vec<u8>,
        force: bool,
    ) -> Result<Option<String>, ObjectStoreError>;

    async fn delete(&self, scope: &Scope, key: &str) -> Result<(), ObjectStoreError>;

    /// Keys in the scope, oldest first.
    async fn list_keys(&self, scope: &Scope) -> Result<Vec<String>, ObjectStoreError>;

    /// Drop every object in the scope; returns how many were removed. Used
    /// when run objects expire.
    async fn delete_scope(&self, scope: &Scope) -> Result<u64, ObjectStoreError>;
}
