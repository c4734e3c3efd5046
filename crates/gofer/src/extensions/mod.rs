//! Extensions: long-running sidecar containers that resolve outside events
//! (cron ticks, webhooks, polls) into pipeline runs.
//!
//! The registry owns extension lifecycle; extensions themselves never touch
//! persistent state. They talk back to the server over HTTP with a
//! per-extension key, and the server talks to them through the
//! [`ExtensionClient`] seam so tests can run without containers.

pub mod registry;

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::scheduler::RegistryAuth;
use crate::storage;
use crate::variables::Variable;

/// Port extension containers listen on; published to an ephemeral host port
/// by the scheduler.
pub const EXTENSION_PORT: u16 = 8082;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("extension not found")]
    NotFound,

    #[error("extension already installed")]
    Exists,

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("could not reach extension: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),

    #[error("unexpected extension registry error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for RegistryError {
    fn from(err: anyhow::Error) -> Self {
        RegistryError::Internal(format!("{err:#}"))
    }
}

/// Whether the operator wants the extension running.
#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Status {
    #[default]
    Unknown,
    Enabled,
    Disabled,
}

/// What the extension container is actually doing right now.
#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum State {
    #[default]
    Unknown,

    /// Being started; not yet reachable.
    Processing,

    Running,

    /// The container stopped. No events are dispatched until restarted.
    Exited,
}

#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum SubscriptionStatus {
    #[default]
    Unknown,
    Active,
    Disabled,

    /// The extension rejected or lost this subscription.
    Error,
}

/// Persistent registration of an extension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registration {
    pub name: String,
    pub image: String,
    pub registry_auth: Option<RegistryAuth>,

    /// Settings captured at install time, injected as env on start.
    pub variables: Vec<Variable>,

    pub status: Status,

    /// Identifier of the callback key generation currently in use.
    pub key_id: String,

    pub created: u64,
}

impl TryFrom<storage::extension_registrations::ExtensionRegistration> for Registration {
    type Error = anyhow::Error;

    fn try_from(
        value: storage::extension_registrations::ExtensionRegistration,
    ) -> anyhow::Result<Self> {
        Ok(Registration {
            name: value.name,
            image: value.image,
            registry_auth: value
                .registry_auth
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("could not parse extension registry_auth from storage")?,
            variables: serde_json::from_str(&value.variables)
                .context("could not parse extension variables from storage")?,
            status: Status::from_str(&value.status).with_context(|| {
                format!(
                    "could not parse extension status from storage value '{}'",
                    value.status
                )
            })?,
            key_id: value.key_id,
            created: value.created as u64,
        })
    }
}

impl TryFrom<&Registration> for storage::extension_registrations::ExtensionRegistration {
    type Error = anyhow::Error;

    fn try_from(value: &Registration) -> anyhow::Result<Self> {
        Ok(storage::extension_registrations::ExtensionRegistration {
            name: value.name.clone(),
            image: value.image.clone(),
            registry_auth: value
                .registry_auth
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("could not serialize extension registry_auth")?,
            variables: serde_json::to_string(&value.variables)
                .context("could not serialize extension variables")?,
            status: value.status.to_string(),
            key_id: value.key_id.clone(),
            created: value.created as i64,
        })
    }
}

/// A running (or recently running) extension as the registry tracks it.
#[derive(Debug, Clone)]
pub struct Extension {
    pub registration: Registration,

    /// Callback URL the scheduler published for the container.
    pub url: Option<String>,

    /// Secret the extension presents when calling back into the server, and
    /// the server presents when calling the extension. Held only in memory;
    /// regenerated on every start.
    pub secret_key: String,

    pub state: State,

    pub started: u64,
}

/// A pipeline subscription as stored and exchanged with extensions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub extension_name: String,
    pub extension_label: String,
    pub settings: HashMap<String, String>,
    pub status: SubscriptionStatus,
}

impl TryFrom<storage::subscriptions::Subscription> for Subscription {
    type Error = anyhow::Error;

    fn try_from(value: storage::subscriptions::Subscription) -> anyhow::Result<Self> {
        Ok(Subscription {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            extension_name: value.extension_name,
            extension_label: value.extension_label,
            settings: serde_json::from_str(&value.settings)
                .context("could not parse subscription settings from storage")?,
            status: SubscriptionStatus::from_str(&value.status).with_context(|| {
                format!(
                    "could not parse subscription status from storage value '{}'",
                    value.status
                )
            })?,
        })
    }
}

/// Request body for the extension's subscribe/unsubscribe surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub extension_label: String,
    pub settings: HashMap<String, String>,
}

/// The server side of the server-to-extension RPC surface.
#[async_trait]
pub trait ExtensionClient: Send + Sync {
    async fn subscribe(
        &self,
        url: &str,
        key: &str,
        request: SubscriptionRequest,
    ) -> Result<(), RegistryError>;

    async fn unsubscribe(
        &self,
        url: &str,
        key: &str,
        request: SubscriptionRequest,
    ) -> Result<(), RegistryError>;

    /// Ask the extension to wind down before its container is stopped.
    async fn shutdown(&self, url: &str, key: &str) -> Result<(), RegistryError>;
}

/// Production client speaking HTTP to extension containers.
pub struct HttpExtensionClient {
    client: reqwest::Client,
}

impl HttpExtensionClient {
    pub fn new() -> Self {
        HttpExtensionClient {
            client: reqwest::Client::new(),
        }
    }

    async fn post(
        &self,
        url: &str,
        key: &str,
        path: &str,
        body: Option<&SubscriptionRequest>,
    ) -> Result<(), RegistryError> {
        let mut request = self
            .client
            .post(format!("{url}{path}"))
            .bearer_auth(key)
            .timeout(std::time::Duration::from_secs(30));

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RegistryError::Unavailable(format!(
                "extension returned {} for {path}",
                response.status()
            )));
        }

        Ok(())
    }
}

impl Default for HttpExtensionClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExtensionClient for HttpExtensionClient {
    async fn subscribe(
        &self,
        url: &str,
        key: &str,
        request: SubscriptionRequest,
    ) -> Result<(), RegistryError> {
        self.post(url, key, "/api/subscribe", Some(&request)).await
    }

    async fn unsubscribe(
        &self,
        url: &str,
        key: &str,
        request: SubscriptionRequest,
    ) -> Result<(), RegistryError> {
        self.post(url, key, "/api/unsubscribe", Some(&request)).await
    }

    async fn shutdown(&self, url: &str, key: &str) -> Result<(), RegistryError> {
        self.post(url, key, "/api/shutdown", None).await
    }
}
