//! Docker implementation of the container runtime, built on bollard.

use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::models::{DeviceRequest, HostConfig};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::error::RunnerError;

use super::{
    ContainerRuntime, ExecutionOutcome, ExecutionRequest, ImageAdvisories, LaunchMode, COMPAT_ENV,
    PROBE_TIMEOUT_SECS, SHM_SIZE_BYTES,
};

/// Working directory the contract expects images to declare.
const EXPECTED_WORKDIR: &str = "/app";

/// Entrypoint the contract expects as the image's final command.
const EXPECTED_ENTRYPOINT: &str = "bash /usr/bin/start.sh";

/// Maximum output carried into error details.
const ERROR_DETAIL_CHARS: usize = 2000;

/// Container runtime backed by the local Docker daemon.
///
/// Wraps a single `bollard::Docker` handle. Constructed once by the
/// orchestrator and shared by reference.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::EngineApi` if the daemon is not accessible.
    pub fn connect() -> Result<Self, RunnerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RunnerError::EngineApi(format!("failed to connect to daemon: {e}")))?;
        Ok(Self { docker })
    }

    /// Creates a runtime from an existing bollard handle.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    async fn create_and_start(
        &self,
        image: &str,
        command: &[String],
        host_config: HostConfig,
    ) -> Result<String, RunnerError> {
        let config = Config {
            image: Some(image.to_string()),
            cmd: if command.is_empty() {
                None
            } else {
                Some(command.to_vec())
            },
            env: Some(vec![COMPAT_ENV.to_string()]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let id = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|e| classify(image, e))?
            .id;

        debug!(container = %id, %image, "container created");

        if let Err(e) = self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove(&id).await;
            return Err(classify(image, e));
        }

        Ok(id)
    }

    /// Collects container output, optionally printing lines as they arrive.
    ///
    /// The read loop is sequential; lines are neither dropped nor reordered
    /// relative to arrival.
    async fn collect_logs(
        &self,
        id: &str,
        follow: bool,
        print: bool,
    ) -> Result<String, RunnerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow,
            timestamps: false,
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut output = String::new();

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                    let text = String::from_utf8_lossy(&message);
                    if print {
                        print!("{text}");
                    }
                    output.push_str(&text);
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(RunnerError::EngineApi(format!("error reading logs: {e}")));
                }
            }
        }

        Ok(output)
    }

    /// Removes a container, tolerating it having already been removed.
    async fn remove(&self, id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        if let Err(e) = self.docker.remove_container(id, Some(options)).await {
            if !e.to_string().contains("No such container") {
                warn!(container = %id, "failed to remove container: {e}");
            }
        }
    }
}

/// Blocks on the container's exit status.
async fn wait_exit(docker: &Docker, id: &str) -> Result<i64, RunnerError> {
    let options = WaitContainerOptions {
        condition: "not-running",
    };
    let mut stream = docker.wait_container(id, Some(options));

    match stream.next().await {
        Some(Ok(response)) => Ok(response.status_code),
        Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
        Some(Err(e)) => Err(RunnerError::EngineApi(format!("wait failed: {e}"))),
        None => Err(RunnerError::EngineApi(
            "wait stream ended without a status".to_string(),
        )),
    }
}

/// Maps a bollard failure onto the runner taxonomy.
fn classify(image: &str, err: bollard::errors::Error) -> RunnerError {
    match &err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } if message.contains("image") || message.contains(image) => {
            RunnerError::ImageNotFound(image.to_string())
        }
        _ => RunnerError::EngineApi(err.to_string()),
    }
}

/// Nvidia device request for the selected host GPUs.
///
/// The container sees the devices as a contiguous local range starting at 0
/// regardless of the host ids selected here.
fn device_requests(gpu_ids: &[String]) -> Option<Vec<DeviceRequest>> {
    if gpu_ids.is_empty() {
        return None;
    }

    Some(vec![DeviceRequest {
        driver: Some("nvidia".to_string()),
        device_ids: Some(gpu_ids.to_vec()),
        capabilities: Some(vec![vec!["gpu".to_string()]]),
        ..Default::default()
    }])
}

fn tail(output: &str) -> String {
    if output.len() <= ERROR_DETAIL_CHARS {
        return output.to_string();
    }
    let start = output
        .char_indices()
        .rev()
        .nth(ERROR_DETAIL_CHARS - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    output[start..].to_string()
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn probe(&self, image: &str, command: &[String]) -> Result<String, RunnerError> {
        let id = self
            .create_and_start(image, command, HostConfig::default())
            .await?;

        let waited = tokio::time::timeout(
            Duration::from_secs(PROBE_TIMEOUT_SECS),
            wait_exit(&self.docker, &id),
        )
        .await;

        let exit = match waited {
            Err(_) => {
                self.remove(&id).await;
                return Err(RunnerError::ProbeTimeout {
                    image: image.to_string(),
                    seconds: PROBE_TIMEOUT_SECS,
                });
            }
            Ok(Err(e)) => {
                self.remove(&id).await;
                return Err(e);
            }
            Ok(Ok(code)) => code,
        };

        let logs = self.collect_logs(&id, false, false).await;
        self.remove(&id).await;
        let logs = logs?;

        if exit != 0 {
            return Err(RunnerError::ContainerRuntime {
                code: exit,
                detail: tail(&logs),
            });
        }

        Ok(logs)
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, RunnerError> {
        let host_config = HostConfig {
            binds: if request.binds.is_empty() {
                None
            } else {
                Some(request.binds.clone())
            },
            shm_size: Some(SHM_SIZE_BYTES),
            device_requests: device_requests(&request.gpu_ids),
            ..Default::default()
        };

        let id = self
            .create_and_start(&request.image, &request.command, host_config)
            .await?;

        // Subscribe to the exit status before draining logs so the status is
        // observed even for short-lived containers.
        let docker = self.docker.clone();
        let wait_id = id.clone();
        let waiter = tokio::spawn(async move { wait_exit(&docker, &wait_id).await });

        let print = request.mode == LaunchMode::Detached;
        let logs = self.collect_logs(&id, true, print).await;

        let exit = match waiter.await {
            Ok(result) => result,
            Err(e) => Err(RunnerError::EngineApi(format!("wait task failed: {e}"))),
        };

        self.remove(&id).await;

        let output = logs?;
        let exit = exit?;

        if exit != 0 {
            return Err(RunnerError::ContainerRuntime {
                code: exit,
                detail: tail(&output),
            });
        }

        Ok(ExecutionOutcome {
            exit_code: exit,
            output,
        })
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageAdvisories, RunnerError> {
        let inspect = self
            .docker
            .inspect_image(image)
            .await
            .map_err(|e| classify(image, e))?;

        let mut advisories = ImageAdvisories::default();

        if let Some(config) = inspect.config {
            match config.working_dir.as_deref() {
                Some(EXPECTED_WORKDIR) => {}
                other => advisories.warnings.push(format!(
                    "image working dir is not '{EXPECTED_WORKDIR}' but {other:?}"
                )),
            }

            let entrypoint_ok = config
                .cmd
                .as_ref()
                .and_then(|cmd| cmd.last())
                .map(|last| last == EXPECTED_ENTRYPOINT)
                .unwrap_or(false);
            if !entrypoint_ok {
                advisories.warnings.push(format!(
                    "image cmd does not end with '{EXPECTED_ENTRYPOINT}': {:?}",
                    config.cmd
                ));
            }
        }

        Ok(advisories)
    }
}
