//! Pipeline orchestrator.
//!
//! Sequences the configured task list strictly in order, one container at a
//! time. Per task: resolve the algorithm family (cached after the first
//! probe), build a fresh workspace, execute, hand the first training run's
//! models to later tasks, and validate output. Runner-level failures abort
//! the remaining list; contract violations are recorded and the pipeline
//! continues.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::error::{ConfigError, PathError, RunnerError};
use crate::manifest::{PretrainedModelSet, TaskKind};
use crate::runner::{ContainerRuntime, ExecutionRequest, LaunchMode};
use crate::validate::{self, AlgorithmFamily, OutputValidator, VerificationReport};
use crate::workspace::{TaskPlan, WorkspaceBuilder, WorkspaceError};

use super::config::VerifierConfig;

/// Errors that abort a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of one task in the pipeline.
#[derive(Debug)]
pub struct TaskOutcome {
    pub task: TaskKind,
    /// Workspace sub-path the task ran in (`pretrain` for a non-initial
    /// training occurrence).
    pub subdir: String,
    pub report: VerificationReport,
    /// True when a runner-level failure stopped the remaining task list
    /// here.
    pub aborted: bool,
}

/// Aggregated result of a pipeline run.
#[derive(Debug)]
pub struct PipelineReport {
    pub run_id: String,
    pub family: AlgorithmFamily,
    pub tasks: Vec<TaskOutcome>,
}

impl PipelineReport {
    /// Total failing checks across all tasks.
    pub fn error_count(&self) -> usize {
        self.tasks.iter().map(|t| t.report.error_count()).sum()
    }

    /// True when a runner-level failure cut the run short.
    pub fn aborted(&self) -> bool {
        self.tasks.iter().any(|t| t.aborted)
    }

    /// Prints each failing check with its key and message, or the all-clear.
    pub fn print_summary(&self) {
        let mut error_count = 0;
        for outcome in &self.tasks {
            for (key, message) in outcome.report.errors() {
                error_count += 1;
                println!("{}/{key}: {message}", outcome.task);
            }
        }
        if error_count == 0 {
            println!("nice, no error found");
        }
    }
}

/// Sequential verifier pipeline over an ordered task list.
pub struct Pipeline {
    config: VerifierConfig,
    runtime: Arc<dyn ContainerRuntime>,
    run_id: String,
    family: Option<AlgorithmFamily>,
    pretrained: Option<PretrainedModelSet>,
}

impl Pipeline {
    /// Creates a pipeline, checking the shared data directory up front.
    ///
    /// # Errors
    ///
    /// Setup-phase failures: an empty task list, missing asset/annotation
    /// directories, or missing index files for any selected task kind.
    pub fn new(
        config: VerifierConfig,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, ConfigError> {
        if config.tasks.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "tasks".to_string(),
                message: "no tasks selected".to_string(),
            });
        }

        check_data_dir(&config)?;

        let run_id = config
            .task_id
            .clone()
            .unwrap_or_else(|| chrono::Utc::now().timestamp().to_string());

        let pretrained = match &config.pretrain_weights_dir {
            Some(dir) if dir.is_dir() => Some(PretrainedModelSet::scan(dir)?),
            Some(dir) => {
                warn!(dir = %dir.display(), "pretrain weights dir missing, ignoring");
                None
            }
            None => None,
        };

        Ok(Self {
            config,
            runtime,
            run_id,
            family: None,
            pretrained,
        })
    }

    /// The pipeline run identifier workspaces are scoped under.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Runs the task list to completion or first runner-level failure.
    pub async fn run(mut self) -> Result<PipelineReport, PipelineError> {
        let config = self.config.clone();
        let builder = WorkspaceBuilder::new(&config.data_dir, &config.work_dir, &self.run_id)
            .with_env_template(config.env_config.clone())
            .with_reuse(config.reuse_workspace);

        let gpu_ids: Vec<String> = config
            .gpu_id
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let mut outcomes = Vec::new();

        for (idx, &task) in config.tasks.iter().enumerate() {
            let family = self.resolve_family().await;

            let subdir = if idx > 0 && task == TaskKind::Training {
                "pretrain".to_string()
            } else {
                task.as_str().to_string()
            };

            info!(%task, subdir, "starting task {} of {}", idx + 1, config.tasks.len());

            let mut plan = TaskPlan::new(task)
                .with_subdir(&subdir)
                .with_gpu_id(&config.gpu_id)
                .with_class_names(config.class_names.clone());
            if let Some(overrides) = config.param_config.get(&task) {
                plan = plan.with_overrides(overrides.clone());
            }
            let consumes_weights = match task {
                TaskKind::Mining | TaskKind::Infer => true,
                TaskKind::Training => idx > 0,
            };
            if consumes_weights {
                if let Some(weights) = &self.pretrained {
                    plan = plan.with_pretrained(weights.clone());
                }
            }

            let ws = builder
                .build(self.runtime.as_ref(), &config.docker_image, &plan)
                .await?;

            let mut report = VerificationReport::new();

            match self.runtime.inspect_image(&config.docker_image).await {
                Ok(advisories) if advisories.warnings.is_empty() => {
                    report.pass("image_contract");
                }
                Ok(advisories) => {
                    for warning in advisories.warnings {
                        report.warn("image_contract", warning);
                    }
                }
                Err(e) => {
                    // Image gone or engine unreachable: nothing further can run.
                    report.fail("image_exist", e.to_string());
                    outcomes.push(TaskOutcome {
                        task,
                        subdir,
                        report,
                        aborted: true,
                    });
                    break;
                }
            }

            let request = ExecutionRequest::new(&config.docker_image)
                .with_binds(ws.binds.clone())
                .with_gpu_ids(gpu_ids.clone())
                .with_mode(if config.detach {
                    LaunchMode::Detached
                } else {
                    LaunchMode::Attached
                });

            match self.runtime.execute(&request).await {
                Ok(outcome) => {
                    info!(%task, exit_code = outcome.exit_code, "container finished");
                    report.pass("run");
                }
                Err(e) => {
                    report.fail("run", e.to_string());
                    outcomes.push(TaskOutcome {
                        task,
                        subdir,
                        report,
                        aborted: true,
                    });
                    break;
                }
            }

            if task == TaskKind::Training && idx == 0 {
                let produced = ws.translator.to_host(&ws.env.output.models_dir)?;
                self.record_trained_models(&produced)?;
            }

            let validator = OutputValidator::new(family, &ws.env, &ws.translator);
            report.merge(validator.validate(task));

            outcomes.push(TaskOutcome {
                task,
                subdir,
                report,
                aborted: false,
            });
        }

        Ok(PipelineReport {
            run_id: self.run_id,
            family: self.family.unwrap_or(AlgorithmFamily::Detection),
            tasks: outcomes,
        })
    }

    /// Resolves the algorithm family once per pipeline and caches it.
    async fn resolve_family(&mut self) -> AlgorithmFamily {
        if let Some(family) = self.family {
            return family;
        }
        let family =
            validate::resolve_family(self.runtime.as_ref(), &self.config.docker_image).await;
        info!(%family, "resolved algorithm family");
        self.family = Some(family);
        family
    }

    /// Copies the first training run's models tree to a stable location
    /// outside the per-task workspace, so it survives subsequent workspace
    /// creation, and records it as the weight source for every later task.
    fn record_trained_models(&mut self, produced: &Path) -> Result<(), PipelineError> {
        if !produced.is_dir() {
            warn!(dir = %produced.display(), "training produced no models dir");
            return Ok(());
        }

        let stable = self
            .config
            .work_dir
            .join(&self.run_id)
            .join(TaskKind::Training.as_str())
            .join("models");
        if stable.exists() {
            fs::remove_dir_all(&stable)?;
        }
        copy_tree(produced, &stable)?;

        let weights = PretrainedModelSet::scan(&stable)?;
        info!(count = weights.files().len(), dir = %stable.display(), "recorded trained models");
        self.pretrained = Some(weights);
        Ok(())
    }
}

/// Setup-phase check of the shared data directory: asset and annotation
/// directories plus every selected task kind's index files must exist
/// before anything runs.
fn check_data_dir(config: &VerifierConfig) -> Result<(), ConfigError> {
    let env = &config.env_config;
    let in_root = Path::new(&env.input.root_dir);

    for container_dir in [&env.input.assets_dir, &env.input.annotations_dir] {
        let rel = Path::new(container_dir)
            .strip_prefix(in_root)
            .map_err(|_| ConfigError::InvalidValue {
                key: container_dir.to_string(),
                message: format!("not under declared root '{}'", in_root.display()),
            })?;
        let host = config.data_dir.join(rel);
        if !host.is_dir() {
            return Err(ConfigError::MissingDirectory(host));
        }
    }

    for &task in &config.tasks {
        for container_index in env.index_files(task) {
            let rel = Path::new(container_index)
                .strip_prefix(in_root)
                .map_err(|_| ConfigError::InvalidValue {
                    key: container_index.to_string(),
                    message: format!("not under declared root '{}'", in_root.display()),
                })?;
            let host = config.data_dir.join(rel);
            if !host.is_file() {
                return Err(ConfigError::MissingIndexFile(host));
            }
        }
    }

    Ok(())
}

/// Recursive directory copy. Files are copied, never moved; nested
/// directories are preserved.
fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
