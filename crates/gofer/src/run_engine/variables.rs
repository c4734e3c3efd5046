//! Variable resolution for task executions.
//!
//! Each task's effective environment is the ordered union of its sources,
//! later sources overwriting earlier ones, with `secret{{...}}` references
//! resolved last against the secret store.

use std::collections::HashMap;

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

use crate::secret_store::{self, SecretStore, SecretStoreError};
use crate::variables::{Variable, VariableSource};

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("secret '{0}' referenced but not found in pipeline or global store")]
    MissingSecret(String),

    #[error("secret '{key}' could not be read: {message}")]
    SecretStore { key: String, message: String },

    #[error("secret '{0}' is not valid UTF-8")]
    NotUtf8(String),
}

/// Variables Gofer injects into every task container.
pub fn system_variables(
    pipeline_id: &str,
    version: u64,
    run_id: u64,
    task_id: &str,
) -> Vec<Variable> {
    vec![
        Variable::new("GOFER_PIPELINE_ID", pipeline_id, VariableSource::SystemInjected),
        Variable::new(
            "GOFER_PIPELINE_CONFIG_VERSION",
            &version.to_string(),
            VariableSource::SystemInjected,
        ),
        Variable::new("GOFER_RUN_ID", &run_id.to_string(), VariableSource::SystemInjected),
        Variable::new("GOFER_TASK_ID", task_id, VariableSource::SystemInjected),
    ]
}

fn secret_pattern() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^secret\{\{(.+)\}\}$").expect("secret pattern is valid"))
}

/// Overwrite priority of a source; higher wins.
fn priority(source: VariableSource) -> u8 {
    match source {
        VariableSource::SystemInjected => 0,
        VariableSource::Extension => 1,
        VariableSource::PipelineConfig => 2,
        VariableSource::ExtensionDynamic => 3,
        VariableSource::RunOptions => 4,
        VariableSource::Unknown => 5,
    }
}

/// Merge variables from every source into the task's effective set. Input
/// order within one source is preserved; across sources the priority order
/// decides which value survives a key collision.
pub fn merge(groups: Vec<Vec<Variable>>) -> Vec<Variable> {
    let mut all: Vec<Variable> = groups.into_iter().flatten().collect();
    all.sort_by_key(|v| priority(v.source));

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<Variable> = Vec::with_capacity(all.len());

    for variable in all {
        match index.get(&variable.key) {
            Some(&at) => merged[at] = variable,
            None => {
                index.insert(variable.key.clone(), merged.len());
                merged.push(variable);
            }
        }
    }

    merged
}

/// Resolve `secret{{key}}` references in place. Pipeline-scoped secrets are
/// consulted first, then the global store. A missing secret is an error; the
/// caller fails the task execution with it.
pub async fn interpolate_secrets(
    store: &dyn SecretStore,
    namespace_id: &str,
    pipeline_id: &str,
    variables: &mut [Variable],
) -> Result<(), ResolutionError> {
    for variable in variables.iter_mut() {
        let Some(captures) = secret_pattern().captures(variable.value.trim()) else {
            continue;
        };
        let key = captures[1].trim().to_string();

        let pipeline_key = secret_store::pipeline_secret_key(namespace_id, pipeline_id, &key);
        let value = match store.get(&pipeline_key).await {
            Ok(value) => value,
            Err(SecretStoreError::NotFound) => {
                match store.get(&secret_store::global_secret_key(&key)).await {
                    Ok(value) => value,
                    Err(SecretStoreError::NotFound) => {
                        return Err(ResolutionError::MissingSecret(key));
                    }
                    Err(e) => {
                        return Err(ResolutionError::SecretStore {
                            key,
                            message: e.to_string(),
                        });
                    }
                }
            }
            Err(e) => {
                return Err(ResolutionError::SecretStore {
                    key,
                    message: e.to_string(),
                });
            }
        };

        variable.value =
            String::from_utf8(value).map_err(|_| ResolutionError::NotUtf8(key))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret_store::sqlite::Engine;

    fn var(key: &str, value: &str, source: VariableSource) -> Variable {
        Variable::new(key, value, source)
    }

    #[test]
    fn later_sources_overwrite_earlier() {
        let merged = merge(vec![
            vec![var("GOFER_RUN_ID", "1", VariableSource::SystemInjected)],
            vec![
                var("MODE", "release", VariableSource::PipelineConfig),
                var("TARGET", "x86", VariableSource::PipelineConfig),
            ],
            vec![var("MODE", "debug", VariableSource::ExtensionDynamic)],
            vec![var("MODE", "profile", VariableSource::RunOptions)],
        ]);

        let lookup: HashMap<&str, &str> = merged
            .iter()
            .map(|v| (v.key.as_str(), v.value.as_str()))
            .collect();

        assert_eq!(lookup["GOFER_RUN_ID"], "1");
        assert_eq!(lookup["TARGET"], "x86");
        assert_eq!(lookup["MODE"], "profile");
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn winning_source_is_recorded() {
        let merged = merge(vec![
            vec![var("MODE", "release", VariableSource::PipelineConfig)],
            vec![var("MODE", "debug", VariableSource::RunOptions)],
        ]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].source, VariableSource::RunOptions);
    }

    #[tokio::test]
    async fn secrets_resolve_pipeline_scope_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.db");
        let store = Engine::new(path.to_str().unwrap(), &[1u8; 32]).await.unwrap();

        store
            .put(
                &crate::secret_store::pipeline_secret_key("default", "build", "db_pw"),
                b"pipeline-level".to_vec(),
                false,
            )
            .await
            .unwrap();
        store
            .put(
                &crate::secret_store::global_secret_key("db_pw"),
                b"global-level".to_vec(),
                false,
            )
            .await
            .unwrap();
        store
            .put(
                &crate::secret_store::global_secret_key("api_key"),
                b"global-only".to_vec(),
                false,
            )
            .await
            .unwrap();

        let mut variables = vec![
            var("DB_PW", "secret{{db_pw}}", VariableSource::PipelineConfig),
            var("API_KEY", "secret{{api_key}}", VariableSource::PipelineConfig),
            var("PLAIN", "untouched", VariableSource::PipelineConfig),
        ];

        interpolate_secrets(&store, "default", "build", &mut variables)
            .await
            .unwrap();

        assert_eq!(variables[0].value, "pipeline-level");
        assert_eq!(variables[1].value, "global-only");
        assert_eq!(variables[2].value, "untouched");
    }

    #[tokio::test]
    async fn missing_secret_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.db");
        let store = Engine::new(path.to_str().unwrap(), &[1u8; 32]).await.unwrap();

        let mut variables = vec![var("DB_PW", "secret{{nope}}", VariableSource::PipelineConfig)];

        let result = interpolate_secrets(&store, "default", "build", &mut variables).await;
        assert!(matches!(result, Err(ResolutionError::MissingSecret(key)) if key == "nope"));
    }

    #[test]
    fn non_secret_braces_are_left_alone() {
        assert!(secret_pattern().captures("plain value").is_none());
        assert!(secret_pattern().captures("secret{{}}").is_none());
        assert!(secret_pattern().captures("prefix secret{{x}}").is_none());

        let captures = secret_pattern().captures("secret{{db_pw}}").unwrap();
        assert_eq!(&captures[1], "db_pw");
    }
}
