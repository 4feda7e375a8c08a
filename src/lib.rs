//! executor-verifier: contract verification for ML executor docker images.
//!
//! This library builds the mounted workspace an executor task expects, runs
//! the image through training, mining and inference tasks, and checks every
//! produced artifact against the executor contract.

// Core modules
pub mod cli;
pub mod error;
pub mod manifest;
pub mod paths;
pub mod pipeline;
pub mod runner;
pub mod validate;
pub mod workspace;

// Re-export commonly used error types
pub use error::{ConfigError, PathError, RunnerError};
pub use workspace::WorkspaceError;
