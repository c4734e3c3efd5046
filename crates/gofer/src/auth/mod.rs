//! Bearer token issuance and access checks.
//!
//! Only the SHA-256 hash of a token is stored; the plaintext is shown once at
//! creation. Namespace grants are regex patterns matched against the
//! namespace a request targets. Management tokens skip namespace checks.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};
use thiserror::Error;
use tracing::info;

use crate::storage::{self, Db, StorageError};

/// Lifetime of the client tokens injected into runs.
pub const RUN_TOKEN_EXPIRY: Duration = Duration::from_secs(48 * 60 * 60);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token not found")]
    NotFound,

    #[error("token is invalid, disabled, or expired")]
    Unauthenticated,

    #[error("token does not grant access to namespace '{0}'")]
    PermissionDenied(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("unexpected auth error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for AuthError {
    fn from(err: anyhow::Error) -> Self {
        AuthError::Internal(format!("{err:#}"))
    }
}

#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum TokenKind {
    /// Full administrative access, including token management.
    Management,

    /// Namespace-scoped access for day-to-day API use.
    #[default]
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    pub id: String,
    pub kind: TokenKind,

    /// Regex patterns for the namespaces this token may touch.
    pub namespaces: Vec<String>,

    pub metadata: HashMap<String, String>,
    pub created: u64,

    /// Epoch millis after which the token is rejected. 0 means no expiry.
    pub expires: u64,

    pub disabled: bool,
}

impl TryFrom<storage::tokens::Token> for Token {
    type Error = anyhow::Error;

    fn try_from(value: storage::tokens::Token) -> anyhow::Result<Self> {
        Ok(Token {
            id: value.id,
            kind: TokenKind::from_str(&value.kind).with_context(|| {
                format!("could not parse token kind from storage value '{}'", value.kind)
            })?,
            namespaces: serde_json::from_str(&value.namespaces)
                .context("could not parse token namespaces from storage")?,
            metadata: serde_json::from_str(&value.metadata)
                .context("could not parse token metadata from storage")?,
            created: value.created as u64,
            expires: value.expires as u64,
            disabled: value.disabled,
        })
    }
}

/// A freshly minted token. The plaintext exists only in this value.
#[derive(Debug)]
pub struct CreatedToken {
    pub token: Token,
    pub plaintext: String,
}

pub fn hash_token(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

fn generate_plaintext() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct Auth {
    storage: Db,
    results_limit: u64,
}

impl Auth {
    pub fn new(storage: Db, results_limit: u64) -> Self {
        Auth {
            storage,
            results_limit,
        }
    }

    /// Create the very first management token. Succeeds exactly once per
    /// installation; afterwards new tokens come from `create_token`.
    pub async fn bootstrap(&self) -> Result<CreatedToken, AuthError> {
        let mut tx = self.storage.begin().await?;

        let flags = storage::system::get(&mut tx).await?;
        if flags.bootstrap_token_created {
            return Err(AuthError::FailedPrecondition(
                "bootstrap token already exists".into(),
            ));
        }

        let created = self
            .insert_token(
                &mut tx,
                TokenKind::Management,
                vec![".*".into()],
                HashMap::from([("bootstrap".into(), "true".into())]),
                Duration::ZERO,
            )
            .await?;

        storage::system::update(&mut tx, Some(true), None).await?;

        tx.commit().await.map_err(StorageError::from)?;

        info!(token_id = %created.token.id, "created bootstrap management token");
        Ok(created)
    }

    pub async fn create_token(
        &self,
        kind: TokenKind,
        namespaces: Vec<String>,
        metadata: HashMap<String, String>,
        expiry: Duration,
    ) -> Result<CreatedToken, AuthError> {
        let mut conn = self.storage.conn().await?;
        self.insert_token(&mut conn, kind, namespaces, metadata, expiry)
            .await
    }

    /// Short-lived client token scoped to one namespace, injected into runs
    /// whose tasks set `inject_api_token`.
    pub async fn create_run_token(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
        run_id: u64,
    ) -> Result<CreatedToken, AuthError> {
        self.create_token(
            TokenKind::Client,
            vec![format!("^{}$", regex::escape(namespace_id))],
            HashMap::from([
                ("kind".into(), "run_injected".into()),
                ("pipeline".into(), pipeline_id.into()),
                ("run".into(), run_id.to_string()),
            ]),
            RUN_TOKEN_EXPIRY,
        )
        .await
    }

    async fn insert_token(
        &self,
        conn: &mut sqlx::SqliteConnection,
        kind: TokenKind,
        namespaces: Vec<String>,
        metadata: HashMap<String, String>,
        expiry: Duration,
    ) -> Result<CreatedToken, AuthError> {
        for pattern in &namespaces {
            Regex::new(pattern).map_err(|e| {
                AuthError::FailedPrecondition(format!(
                    "namespace pattern '{pattern}' is not a valid regex: {e}"
                ))
            })?;
        }

        let plaintext = generate_plaintext();
        let created = crate::epoch_milli();
        let expires = if expiry.is_zero() {
            0
        } else {
            created + expiry.as_millis() as u64
        };

        let token = Token {
            id: nanoid::nanoid!(10),
            kind,
            namespaces,
            metadata,
            created,
            expires,
            disabled: false,
        };

        storage::tokens::insert(
            conn,
            &storage::tokens::Token {
                id: token.id.clone(),
                hash: hash_token(&plaintext),
                kind: token.kind.to_string(),
                namespaces: serde_json::to_string(&token.namespaces)
                    .context("could not serialize token namespaces")?,
                metadata: serde_json::to_string(&token.metadata)
                    .context("could not serialize token metadata")?,
                created: token.created as i64,
                expires: token.expires as i64,
                disabled: token.disabled,
            },
        )
        .await?;

        Ok(CreatedToken { token, plaintext })
    }

    /// Resolve a presented bearer token. Disabled and expired tokens are
    /// rejected the same way unknown ones are.
    pub async fn authenticate(&self, plaintext: &str) -> Result<Token, AuthError> {
        let mut conn = self.storage.conn().await?;

        let row = storage::tokens::get_by_hash(&mut conn, &hash_token(plaintext))
            .await
            .map_err(|e| match e {
                StorageError::NotFound => AuthError::Unauthenticated,
                other => AuthError::Storage(other),
            })?;

        let token = Token::try_from(row)?;

        if token.disabled {
            return Err(AuthError::Unauthenticated);
        }

        if token.expires > 0 && token.expires < crate::epoch_milli() {
            return Err(AuthError::Unauthenticated);
        }

        Ok(token)
    }

    pub async fn get_token(&self, id: &str) -> Result<Token, AuthError> {
        let mut conn = self.storage.conn().await?;

        let row = storage::tokens::get(&mut conn, id).await.map_err(|e| match e {
            StorageError::NotFound => AuthError::NotFound,
            other => AuthError::Storage(other),
        })?;

        Ok(Token::try_from(row)?)
    }

    pub async fn list_tokens(&self, offset: u64, limit: u64) -> Result<Vec<Token>, AuthError> {
        let mut conn = self.storage.conn().await?;

        let rows = storage::tokens::list(&mut conn, offset, limit, self.results_limit).await?;

        let mut tokens = Vec::with_capacity(rows.len());
        for row in rows {
            tokens.push(Token::try_from(row)?);
        }

        Ok(tokens)
    }

    pub async fn set_token_disabled(&self, id: &str, disabled: bool) -> Result<(), AuthError> {
        let mut conn = self.storage.conn().await?;

        storage::tokens::set_disabled(&mut conn, id, disabled)
            .await
            .map_err(|e| match e {
                StorageError::NotFound => AuthError::NotFound,
                other => AuthError::Storage(other),
            })?;

        Ok(())
    }

    pub async fn delete_token(&self, id: &str) -> Result<(), AuthError> {
        let mut conn = self.storage.conn().await?;

        storage::tokens::delete(&mut conn, id).await.map_err(|e| match e {
            StorageError::NotFound => AuthError::NotFound,
            other => AuthError::Storage(other),
        })?;

        Ok(())
    }
}

/// Whether `token` may operate on `namespace_id`. Management tokens always
/// may; client tokens need a matching namespace pattern.
pub fn has_access(token: &Token, namespace_id: &str) -> bool {
    if token.kind == TokenKind::Management {
        return true;
    }

    token.namespaces.iter().any(|pattern| {
        Regex::new(pattern)
            .map(|re| re.is_match(namespace_id))
            .unwrap_or(false)
    })
}
