//! Task runner: container invocations against an abstract runtime.
//!
//! The verifier core never talks to Docker directly; it issues calls against
//! the [`ContainerRuntime`] capability. The production implementation is
//! [`DockerRuntime`] (bollard); tests substitute a stub.

mod docker;

pub use docker::DockerRuntime;

use async_trait::async_trait;

use crate::error::RunnerError;

/// Bound on template/manifest probe invocations.
pub const PROBE_TIMEOUT_SECS: u64 = 60;

/// Shared-memory allocation handed to every task container (64 GB).
pub const SHM_SIZE_BYTES: i64 = 64 * 1024 * 1024 * 1024;

/// Compatibility tag executor images consume from the environment.
pub const COMPAT_ENV: &str = "YMIR_VERSION=1.1.0";

/// How a task container's output is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Output is captured synchronously and returned once the process ends.
    Attached,
    /// Log lines are streamed and printed as they arrive; the call still
    /// blocks until the exit status is available.
    Detached,
}

/// A full task-container invocation.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Image reference.
    pub image: String,
    /// Command override; empty runs the image's declared entrypoint.
    pub command: Vec<String>,
    /// Volume bind specifications, `host:container:{ro,rw}`.
    pub binds: Vec<String>,
    /// Host GPU device ids to hand to the container. The container sees
    /// them as a contiguous local range starting at 0.
    pub gpu_ids: Vec<String>,
    /// Attached or detached output handling.
    pub mode: LaunchMode,
}

impl ExecutionRequest {
    /// Creates a detached request running the image's entrypoint.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            command: Vec::new(),
            binds: Vec::new(),
            gpu_ids: Vec::new(),
            mode: LaunchMode::Detached,
        }
    }

    /// Sets the volume binds.
    pub fn with_binds(mut self, binds: Vec<String>) -> Self {
        self.binds = binds;
        self
    }

    /// Sets the GPU device selection.
    pub fn with_gpu_ids(mut self, gpu_ids: Vec<String>) -> Self {
        self.gpu_ids = gpu_ids;
        self
    }

    /// Sets the launch mode.
    pub fn with_mode(mut self, mode: LaunchMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Successful container completion.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Exit code reported by the engine (always 0 on the success path).
    pub exit_code: i64,
    /// Captured combined output.
    pub output: String,
}

/// Soft advisories from inspecting the image's declared contract surface.
#[derive(Debug, Clone, Default)]
pub struct ImageAdvisories {
    /// Deviations from the declared working directory / entrypoint.
    /// Warnings, never hard failures.
    pub warnings: Vec<String>,
}

/// Abstract container runtime capability.
///
/// One handle is constructed by the orchestrator and passed into every
/// invocation; its lifetime is owned there, not global.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runs a short-lived, mountless container to read a static file from
    /// the image, returning captured stdout.
    ///
    /// Bounded by [`PROBE_TIMEOUT_SECS`]; expiry fails with
    /// [`RunnerError::ProbeTimeout`] and leaves no container behind.
    async fn probe(&self, image: &str, command: &[String]) -> Result<String, RunnerError>;

    /// Launches a task container and blocks until its exit status is
    /// available.
    ///
    /// Classifies the outcome into exactly one of success,
    /// [`RunnerError::ContainerRuntime`], [`RunnerError::EngineApi`] or
    /// [`RunnerError::ImageNotFound`]. No container is left running or
    /// orphaned on any exit path.
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, RunnerError>;

    /// Inspects the image's declared working directory and entrypoint
    /// against the contract, returning deviations as warnings.
    async fn inspect_image(&self, image: &str) -> Result<ImageAdvisories, RunnerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_request_builder() {
        let req = ExecutionRequest::new("executor:latest")
            .with_binds(vec!["/host/in:/in:ro".to_string(), "/host/out:/out:rw".to_string()])
            .with_gpu_ids(vec!["2".to_string(), "5".to_string()])
            .with_mode(LaunchMode::Attached);

        assert_eq!(req.image, "executor:latest");
        assert_eq!(req.binds.len(), 2);
        assert_eq!(req.gpu_ids, vec!["2", "5"]);
        assert_eq!(req.mode, LaunchMode::Attached);
        assert!(req.command.is_empty());
    }

    #[test]
    fn test_defaults_are_detached_entrypoint() {
        let req = ExecutionRequest::new("executor:latest");
        assert_eq!(req.mode, LaunchMode::Detached);
        assert!(req.binds.is_empty());
    }
}
