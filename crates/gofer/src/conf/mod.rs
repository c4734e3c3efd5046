//! Server configuration.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! environment variables with the `GOFER__` prefix (double underscore as the
//! section separator, e.g. `GOFER__API__EVENT_LOG_RETENTION=3600`). Command
//! line flags handled by the binary override all of these.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::Deserialize;

/// Default path checked for a config file when none is passed explicitly.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/gofer/gofer.toml";

const ENV_PREFIX: &str = "GOFER";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfError {
    #[error("could not load configuration: {0}")]
    Load(String),

    #[error("invalid configuration for '{field}': {message}")]
    Invalid { field: String, message: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: Server,
    pub api: Api,
    pub extensions: Extensions,
    pub scheduler: Scheduler,
    pub object_store: ObjectStore,
    pub secret_store: SecretStore,
    pub external_events: ExternalEvents,
    pub development: Development,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    /// Bind address for the main API listener. Ex: 0.0.0.0:8080
    pub bind_address: String,

    /// The URL extensions use to reach back into the API. Extensions usually
    /// live on a container network, so this frequently differs from the
    /// address users dial.
    pub extension_address: String,

    /// Path to the main sqlite database.
    pub storage_path: String,

    /// Results returned by list endpoints when the caller gives no limit.
    pub storage_results_limit: u64,

    /// Seconds to wait for in-flight requests during shutdown.
    pub shutdown_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Api {
    /// Global ceiling on concurrent runs per pipeline. A pipeline's own
    /// parallelism setting can only tighten this. 0 is unlimited.
    pub run_parallelism_limit: u64,

    /// Total stored configs per pipeline; the oldest non-live config over
    /// this count is deleted. 0 keeps everything.
    pub pipeline_version_limit: u64,

    /// How long events are kept before pruning (seconds).
    pub event_log_retention: u64,

    /// Interval between event prune sweeps (seconds).
    pub event_prune_interval: u64,

    /// Log level for the whole service (trace|debug|info|warn|error).
    pub log_level: String,

    /// Number of runs after which a run's task logs are expired.
    pub task_execution_log_retention: u64,

    /// Directory task execution log files are written under.
    pub task_execution_logs_dir: String,

    /// Seconds the scheduler waits for a task container to stop gracefully
    /// before killing it.
    pub task_execution_stop_timeout: u64,

    /// When true, extension-driven and manual run starts are refused. This is
    /// an operator switch for drains and incident response; it can also be
    /// flipped at runtime through the API.
    pub ignore_pipeline_run_events: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Extensions {
    /// Install the bundled cron and interval extensions at startup if they
    /// are not already registered.
    pub install_base_extensions: bool,

    /// Seconds to wait for an extension container to stop gracefully.
    pub stop_timeout: u64,

    pub use_tls: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scheduler {
    pub docker: Docker,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Docker {
    /// Periodically remove stopped containers.
    pub prune: bool,

    /// Seconds between prune sweeps.
    pub prune_interval: u64,

    /// How long a stop request is remembered so that a stopped container can
    /// be reported as cancelled rather than exited.
    pub cancellation_window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStore {
    /// Path to the object store sqlite database.
    pub path: String,

    /// Objects stored per pipeline before the oldest is evicted.
    pub pipeline_object_limit: u64,

    /// Run-level objects survive this many newer runs before being reaped.
    pub run_object_expiry: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretStore {
    /// Path to the secret store sqlite database.
    pub path: String,

    /// Hex-encoded 32 byte key used for encryption at rest.
    pub encryption_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalEvents {
    /// Enable the secondary listener that accepts webhook payloads for
    /// extensions.
    pub enable: bool,

    pub bind_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Development {
    /// Human readable log output instead of structured.
    pub pretty_logging: bool,

    /// Turns off authentication. Never enable outside local development.
    pub bypass_auth: bool,
}

impl Settings {
    /// Load settings from defaults, an optional file, and the environment.
    pub fn new(config_path: Option<&Path>) -> Result<Self, ConfError> {
        let mut builder = Config::builder()
            .set_default("server.bind_address", "127.0.0.1:8080")
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("server.extension_address", "http://172.17.0.1:8080")
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("server.storage_path", "/tmp/gofer/gofer.db")
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("server.storage_results_limit", 200)
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("server.shutdown_timeout", 15)
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("api.run_parallelism_limit", 0)
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("api.pipeline_version_limit", 5)
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("api.event_log_retention", 7_776_000)
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("api.event_prune_interval", 604_800)
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("api.log_level", "info")
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("api.task_execution_log_retention", 50)
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("api.task_execution_logs_dir", "/tmp/gofer/logs")
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("api.task_execution_stop_timeout", 5)
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("api.ignore_pipeline_run_events", false)
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("extensions.install_base_extensions", true)
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("extensions.stop_timeout", 15)
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("extensions.use_tls", false)
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("scheduler.docker.prune", false)
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("scheduler.docker.prune_interval", 604_800)
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("scheduler.docker.cancellation_window_secs", 86_400)
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("object_store.path", "/tmp/gofer/gofer_objects.db")
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("object_store.pipeline_object_limit", 50)
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("object_store.run_object_expiry", 50)
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("secret_store.path", "/tmp/gofer/gofer_secrets.db")
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default(
                "secret_store.encryption_key",
                // Development-only key; operators must override this.
                "c87b38e88f4c8d9a1d8a6f59c3b6c6f2a1b2c3d4e5f60718293a4b5c6d7e8f90",
            )
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("external_events.enable", false)
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("external_events.bind_address", "127.0.0.1:8081")
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("development.pretty_logging", false)
            .map_err(|e| ConfError::Load(e.to_string()))?
            .set_default("development.bypass_auth", false)
            .map_err(|e| ConfError::Load(e.to_string()))?;

        match config_path {
            Some(path) => {
                builder = builder.add_source(File::from(PathBuf::from(path)));
            }
            None => {
                builder = builder.add_source(File::with_name(DEFAULT_CONFIG_PATH).required(false));
            }
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| ConfError::Load(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfError::Load(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfError> {
        let key_bytes = hex::decode(&self.secret_store.encryption_key).map_err(|_| {
            ConfError::Invalid {
                field: "secret_store.encryption_key".into(),
                message: "must be hex encoded".into(),
            }
        })?;

        if key_bytes.len() != 32 {
            return Err(ConfError::Invalid {
                field: "secret_store.encryption_key".into(),
                message: format!("must decode to 32 bytes, got {}", key_bytes.len()),
            });
        }

        Ok(())
    }

    /// The decoded secret store encryption key. Only call after a successful
    /// load; validation guarantees the decode.
    pub fn encryption_key(&self) -> [u8; 32] {
        let bytes = hex::decode(&self.secret_store.encryption_key).unwrap_or_default();
        let mut key = [0u8; 32];
        if bytes.len() == 32 {
            key.copy_from_slice(&bytes);
        }
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_file_or_env() {
        let settings = Settings::new(None).unwrap();
        assert_eq!(settings.server.bind_address, "127.0.0.1:8080");
        assert_eq!(settings.server.storage_results_limit, 200);
        assert_eq!(settings.object_store.pipeline_object_limit, 50);
        assert!(!settings.development.bypass_auth);
    }

    #[test]
    fn env_overrides_defaults() {
        std::env::set_var("GOFER__API__EVENT_LOG_RETENTION", "3600");
        let settings = Settings::new(None).unwrap();
        assert_eq!(settings.api.event_log_retention, 3600);
        std::env::remove_var("GOFER__API__EVENT_LOG_RETENTION");
    }

    #[test]
    fn bad_encryption_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gofer.toml");
        std::fs::write(&path, "[secret_store]\nencryption_key = \"deadbeef\"\n").unwrap();

        let result = Settings::new(Some(&path));
        assert!(matches!(result, Err(ConfError::Invalid { .. })));
    }

    #[test]
    fn file_values_are_honored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gofer.toml");
        std::fs::write(&path, "[api]\nrun_parallelism_limit = 7\n").unwrap();

        let settings = Settings::new(Some(&path)).unwrap();
        assert_eq!(settings.api.run_parallelism_limit, 7);
    }
}
