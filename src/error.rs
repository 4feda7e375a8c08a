//! Error types for executor-verifier operations.
//!
//! Defines error types for the major subsystems:
//! - Verifier configuration and task setup
//! - Container-to-host path translation
//! - Container runtime invocations

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while resolving verifier configuration and
/// preparing task inputs.
///
/// All of these are setup-phase failures: they abort the affected task
/// before any container is launched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required directory '{0}'")]
    MissingDirectory(PathBuf),

    #[error("missing required index file '{0}'")]
    MissingIndexFile(PathBuf),

    #[error("unsupported task kind '{0}'")]
    UnsupportedTask(String),

    #[error("malformed template for task '{task}': {message}")]
    MalformedTemplate { task: String, message: String },

    #[error("invalid config value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error("workspace '{0}' already exists; pass reuse_workspace to rerun in place")]
    WorkspaceExists(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors from container-to-host path translation.
#[derive(Debug, Error)]
pub enum PathError {
    #[error("path '{path}' is not under declared root '{in_root}' or '{out_root}'")]
    OutOfBounds {
        path: PathBuf,
        in_root: PathBuf,
        out_root: PathBuf,
    },
}

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("probe of image '{image}' timed out after {seconds}s")]
    ProbeTimeout { image: String, seconds: u64 },

    #[error("docker image '{0}' not found")]
    ImageNotFound(String),

    #[error("container exited with code {code}: {detail}")]
    ContainerRuntime { code: i64, detail: String },

    #[error("engine API error: {0}")]
    EngineApi(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
