//! Command-line interface for executor-verifier.
//!
//! Provides the one-shot verification command: configuration loading, flag
//! overrides and pipeline execution.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
