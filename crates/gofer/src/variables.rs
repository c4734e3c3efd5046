//! Key/value pairs injected into task containers, labeled by origin so users
//! can tell where a value came from when debugging a run.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Where a variable originated. Later sources in the resolution order
/// overwrite earlier ones; see the run engine for the exact ordering.
#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum VariableSource {
    #[default]
    Unknown,

    /// Defined in the pipeline configuration, either at the pipeline or task
    /// level.
    PipelineConfig,

    /// Supplied by the caller when manually starting a run.
    RunOptions,

    /// Injected by Gofer itself (`GOFER_*` vars, API tokens).
    SystemInjected,

    /// Produced by an extension when it resolved an event into a run.
    ExtensionDynamic,

    /// Part of an extension's registration settings.
    Extension,
}

/// A single environment variable passed to a container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Variable {
    pub key: String,
    pub value: String,
    pub source: VariableSource,
}

impl Variable {
    pub fn new(key: &str, value: &str, source: VariableSource) -> Self {
        Variable {
            key: key.into(),
            value: value.into(),
            source,
        }
    }
}
