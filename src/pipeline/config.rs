//! Verifier run configuration.
//!
//! Loaded from a YAML file, then adjusted by CLI flags and `--cfg-options`
//! overrides. The file names the image, the shared data directory, the
//! work directory, the task selection and per-task hyperparameter
//! overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use tracing::warn;

use crate::error::ConfigError;
use crate::manifest::{EnvironmentManifest, TaskKind};

fn default_gpu_id() -> String {
    "0".to_string()
}

fn default_detach() -> bool {
    true
}

/// Run configuration for the verifier pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Executor image reference to verify.
    pub docker_image: String,
    /// Directory holding the shared assets, annotations and index files.
    pub data_dir: PathBuf,
    /// Root under which per-task workspaces are created.
    pub work_dir: PathBuf,
    /// Ordered task list for the run.
    #[serde(default)]
    pub tasks: Vec<TaskKind>,
    /// Class names handed to training tasks.
    #[serde(default)]
    pub class_names: Vec<String>,
    /// Host GPU id selection, comma separated.
    #[serde(default = "default_gpu_id")]
    pub gpu_id: String,
    /// Pipeline run identifier; generated from the clock when absent.
    #[serde(default)]
    pub task_id: Option<String>,
    /// Weights directory seeding mining/infer when no training task runs
    /// first.
    #[serde(default)]
    pub pretrain_weights_dir: Option<PathBuf>,
    /// Base environment manifest template.
    #[serde(default)]
    pub env_config: EnvironmentManifest,
    /// Per-task hyperparameter overrides, keyed by task kind.
    #[serde(default)]
    pub param_config: BTreeMap<TaskKind, Mapping>,
    /// Permit rerunning into existing workspace directories.
    #[serde(default)]
    pub reuse_workspace: bool,
    /// Stream and print container logs as they arrive.
    #[serde(default = "default_detach")]
    pub detach: bool,
}

impl VerifierConfig {
    /// Loads a configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Applies one `--cfg-options` override.
    ///
    /// Known scalar fields are updated in place; unknown keys are ignored
    /// with a warning.
    pub fn apply_override(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "docker_image" => self.docker_image = value.to_string(),
            "data_dir" => self.data_dir = PathBuf::from(value),
            "work_dir" => self.work_dir = PathBuf::from(value),
            "gpu_id" => self.gpu_id = value.to_string(),
            "task_id" => self.task_id = Some(value.to_string()),
            "pretrain_weights_dir" => self.pretrain_weights_dir = Some(PathBuf::from(value)),
            "tasks" => self.tasks = parse_task_selection(value)?,
            "class_names" => {
                self.class_names = value.split(',').map(str::to_string).collect();
            }
            "reuse_workspace" => {
                self.reuse_workspace = parse_bool(key, value)?;
            }
            "detach" => {
                self.detach = parse_bool(key, value)?;
            }
            other => warn!("ignoring unknown cfg option '{other}'"),
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{value}' is not a boolean"),
    })
}

/// Expands a task selection shorthand into the ordered task list.
///
/// `ttmi` repeats training: the second occurrence resumes from the first
/// one's produced weights.
pub fn parse_task_selection(selection: &str) -> Result<Vec<TaskKind>, ConfigError> {
    use TaskKind::{Infer, Mining, Training};

    match selection {
        "t" | "training" => Ok(vec![Training]),
        "m" | "mining" => Ok(vec![Mining]),
        "i" | "infer" => Ok(vec![Infer]),
        "mi" => Ok(vec![Mining, Infer]),
        "tmi" => Ok(vec![Training, Mining, Infer]),
        "ttmi" => Ok(vec![Training, Training, Mining, Infer]),
        other => Err(ConfigError::UnsupportedTask(other.to_string())),
    }
}
