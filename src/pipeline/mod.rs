//! Pipeline orchestration: task sequencing and run configuration.

mod config;
mod orchestrator;

pub use config::{parse_task_selection, VerifierConfig};
pub use orchestrator::{Pipeline, PipelineError, PipelineReport, TaskOutcome};
