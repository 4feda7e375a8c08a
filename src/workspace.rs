//! Workspace construction for one task execution.
//!
//! A workspace is the host directory pair `{in_dir, out_dir}` unique per
//! `(run_id, task_kind)`. The builder links shared read-only inputs into the
//! input side, copies the task's index files, fetches and merges the image's
//! hyperparameter template, writes the two manifests the container reads,
//! and emits the volume bind specifications for the task runner.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use serde_yaml::Mapping;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, RunnerError};
use crate::manifest::{
    generate_task_id, EnvironmentManifest, PretrainedModelSet, TaskConfigBuilder, TaskKind,
};
use crate::paths::PathTranslator;
use crate::runner::ContainerRuntime;

/// Errors raised while building a workspace.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-task inputs to workspace construction.
#[derive(Debug, Clone)]
pub struct TaskPlan {
    /// The task kind to prepare for.
    pub task: TaskKind,
    /// Workspace sub-path under the run directory. Usually the task kind
    /// name; `pretrain` for a non-initial training occurrence.
    pub subdir: String,
    /// Task identifier stamped into both manifests.
    pub task_id: String,
    /// Host GPU id selection, comma separated.
    pub gpu_id: String,
    /// Class names for training tasks.
    pub class_names: Vec<String>,
    /// User-supplied hyperparameter overrides for this task kind.
    pub overrides: Mapping,
    /// Weights produced by a prior training task, if any.
    pub pretrained: Option<PretrainedModelSet>,
}

impl TaskPlan {
    /// Creates a plan for a task kind with a generated task id and the task
    /// kind name as the workspace sub-path.
    pub fn new(task: TaskKind) -> Self {
        Self {
            task,
            subdir: task.as_str().to_string(),
            task_id: generate_task_id(),
            gpu_id: "0".to_string(),
            class_names: Vec::new(),
            overrides: Mapping::new(),
            pretrained: None,
        }
    }

    /// Overrides the workspace sub-path.
    pub fn with_subdir(mut self, subdir: impl Into<String>) -> Self {
        self.subdir = subdir.into();
        self
    }

    /// Overrides the task id.
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    /// Sets the host GPU id selection.
    pub fn with_gpu_id(mut self, gpu_id: impl Into<String>) -> Self {
        self.gpu_id = gpu_id.into();
        self
    }

    /// Sets the training class names.
    pub fn with_class_names(mut self, class_names: Vec<String>) -> Self {
        self.class_names = class_names;
        self
    }

    /// Sets the user hyperparameter overrides.
    pub fn with_overrides(mut self, overrides: Mapping) -> Self {
        self.overrides = overrides;
        self
    }

    /// Supplies pretrained weights to link into the input side.
    pub fn with_pretrained(mut self, pretrained: PretrainedModelSet) -> Self {
        self.pretrained = Some(pretrained);
        self
    }
}

/// A constructed workspace, ready for the task runner.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub task: TaskKind,
    pub in_dir: PathBuf,
    pub out_dir: PathBuf,
    /// The environment manifest as written to `env.yaml`.
    pub env: EnvironmentManifest,
    /// Volume bind specifications, input side read-only, output side
    /// read-write.
    pub binds: Vec<String>,
    /// Translator over this workspace's root pair.
    pub translator: PathTranslator,
}

/// Builds workspaces under `<work_dir>/<run_id>/<subdir>/{in,out}`.
#[derive(Debug, Clone)]
pub struct WorkspaceBuilder {
    data_dir: PathBuf,
    work_dir: PathBuf,
    run_id: String,
    env_template: EnvironmentManifest,
    allow_reuse: bool,
}

impl WorkspaceBuilder {
    /// Creates a builder over the shared data directory and the run-scoped
    /// work directory.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            work_dir: work_dir.into(),
            run_id: run_id.into(),
            env_template: EnvironmentManifest::default(),
            allow_reuse: false,
        }
    }

    /// Replaces the base environment manifest template.
    pub fn with_env_template(mut self, env_template: EnvironmentManifest) -> Self {
        self.env_template = env_template;
        self
    }

    /// Permits reusing an existing workspace directory pair. Reuse surfaces
    /// a warning instead of a hard failure, to support idempotent reruns.
    pub fn with_reuse(mut self, allow_reuse: bool) -> Self {
        self.allow_reuse = allow_reuse;
        self
    }

    /// Builds the workspace for one task.
    ///
    /// Fetches the image's hyperparameter template through a bounded probe,
    /// merges it per the configured precedence, and writes `config.yaml` and
    /// `env.yaml` into the input side.
    ///
    /// # Errors
    ///
    /// Setup-phase failures (existing workspace without reuse, missing data
    /// directories or index files, malformed template) abort before any
    /// container launch.
    pub async fn build(
        &self,
        runtime: &dyn ContainerRuntime,
        image: &str,
        plan: &TaskPlan,
    ) -> Result<Workspace, WorkspaceError> {
        let task_dir = self.work_dir.join(&self.run_id).join(&plan.subdir);
        let in_dir = task_dir.join("in");
        let out_dir = task_dir.join("out");

        for dir in [&in_dir, &out_dir] {
            if dir.exists() {
                if !self.allow_reuse {
                    return Err(ConfigError::WorkspaceExists(dir.clone()).into());
                }
                warn!(dir = %dir.display(), "reusing existing workspace directory");
            }
            fs::create_dir_all(dir)?;
        }

        let env = self.env_template.for_task(plan.task, &plan.task_id);
        let in_root = Path::new(&env.input.root_dir);

        // Shared, read-only inputs keep their container-relative sub-path
        // names inside in_dir.
        for container_dir in [&env.input.assets_dir, &env.input.annotations_dir] {
            let sub = relative_to(container_dir, in_root)?;
            let src = self.data_dir.join(&sub);
            if !src.is_dir() {
                return Err(ConfigError::MissingDirectory(src).into());
            }
            link_into(&src, &in_dir.join(&sub))?;
        }

        if let Some(pretrained) = plan.pretrained.as_ref().filter(|p| !p.is_empty()) {
            let models_sub = relative_to(&env.input.models_dir, in_root)?;
            let dest_root = in_dir.join(models_sub);
            for file in pretrained.files() {
                let dest = dest_root.join(file);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                link_into(&pretrained.host_dir().join(file), &dest)?;
            }
            debug!(count = pretrained.files().len(), "linked pretrained weights");
        }

        for container_index in env.index_files(plan.task) {
            let sub = relative_to(container_index, in_root)?;
            let src = self.data_dir.join(&sub);
            if !src.is_file() {
                return Err(ConfigError::MissingIndexFile(src).into());
            }
            fs::copy(&src, in_dir.join(&sub))?;
        }

        // A reused out_dir may still hold the previous round's result file;
        // remove it so validation only sees this round's output.
        let out_root = Path::new(&env.output.root_dir);
        let result_sub = relative_to(env.result_file(plan.task), out_root)?;
        let stale_result = out_dir.join(result_sub);
        if stale_result.is_file() {
            warn!(file = %stale_result.display(), "removing stale result file");
            fs::remove_file(&stale_result)?;
        }

        let template_text = runtime
            .probe(image, &["cat".to_string(), plan.task.template_path()])
            .await?;
        let template: Mapping =
            serde_yaml::from_str(&template_text).map_err(|e| ConfigError::MalformedTemplate {
                task: plan.task.to_string(),
                message: e.to_string(),
            })?;

        let mut builder = TaskConfigBuilder::from_template(template)
            .with_defaults(plan.task, &plan.gpu_id, &plan.task_id, &plan.class_names)
            .with_overrides(plan.overrides.clone());
        if let Some(pretrained) = plan.pretrained.as_ref() {
            builder = builder.with_pretrained(plan.task, pretrained, &env.input.models_dir);
        }
        let config = builder.build();

        let config_text = serde_yaml::to_string(&config).map_err(ConfigError::from)?;
        let env_text = serde_yaml::to_string(&env).map_err(ConfigError::from)?;
        write_manifest(&in_dir.join("config.yaml"), &config_text)?;
        write_manifest(&in_dir.join("env.yaml"), &env_text)?;

        let binds = vec![
            format!("{}:{}:ro", in_dir.display(), env.input.root_dir),
            format!("{}:{}:rw", out_dir.display(), env.output.root_dir),
        ];

        let translator = PathTranslator::new(
            &env.input.root_dir,
            &in_dir,
            &env.output.root_dir,
            &out_dir,
        );

        info!(task = %plan.task, in_dir = %in_dir.display(), "workspace ready");

        Ok(Workspace {
            task: plan.task,
            in_dir,
            out_dir,
            env,
            binds,
            translator,
        })
    }
}

/// Relative sub-path of a container path under its declared root.
fn relative_to(container_path: &str, root: &Path) -> Result<PathBuf, ConfigError> {
    Path::new(container_path)
        .strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|_| ConfigError::InvalidValue {
            key: container_path.to_string(),
            message: format!("not under declared root '{}'", root.display()),
        })
}

/// Symlinks `src` at `dest`, tolerating a link left by a reused workspace.
fn link_into(src: &Path, dest: &Path) -> std::io::Result<()> {
    if dest.symlink_metadata().is_ok() {
        return Ok(());
    }
    symlink(src, dest)
}

/// Writes a manifest file, warning when a reused workspace already holds one.
fn write_manifest(path: &Path, content: &str) -> std::io::Result<()> {
    if path.exists() {
        warn!(file = %path.display(), "manifest exists, overwriting");
    }
    fs::write(path, content)
}
