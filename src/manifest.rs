//! Task configuration and environment manifests.
//!
//! Every task execution writes two files into the workspace input side:
//! `config.yaml`, the hyperparameter manifest merged from the image's
//! declared template and caller overrides, and `env.yaml`, the environment
//! manifest declaring the input/output roots, the active run flag and the
//! concrete container-side paths of the contract.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use walkdir::WalkDir;

use crate::error::ConfigError;

/// The three task kinds an executor image must support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Training,
    Mining,
    Infer,
}

impl TaskKind {
    /// All supported task kinds.
    pub const ALL: [TaskKind; 3] = [TaskKind::Training, TaskKind::Mining, TaskKind::Infer];

    /// Stable lowercase name, used for workspace sub-paths and check keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Training => "training",
            TaskKind::Mining => "mining",
            TaskKind::Infer => "infer",
        }
    }

    /// Container-side path of the image's hyperparameter template for this
    /// task kind.
    pub fn template_path(&self) -> String {
        format!("/img-man/{}-template.yaml", self.as_str())
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "training" | "t" => Ok(TaskKind::Training),
            "mining" | "m" => Ok(TaskKind::Mining),
            "infer" | "i" => Ok(TaskKind::Infer),
            other => Err(ConfigError::UnsupportedTask(other.to_string())),
        }
    }
}

/// Remaps a comma-separated host GPU id selection to the contiguous local
/// range the container will see, returning `(local_ids, count)`.
///
/// The container always sees devices `0..count`, regardless of which host
/// devices back them: `"2,5"` becomes `("0,1", 2)`.
pub fn remap_gpu_ids(gpu_id: &str) -> (String, usize) {
    let requested: Vec<&str> = gpu_id
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    if requested.is_empty() {
        return ("0".to_string(), 1);
    }

    let local: Vec<String> = (0..requested.len()).map(|i| i.to_string()).collect();
    (local.join(","), requested.len())
}

/// Generates a fresh task id from the current unix timestamp.
///
/// Format follows the ids the platform hands to executors: a `t` prefix and
/// a zero-padded 30 character body.
pub fn generate_task_id() -> String {
    format!("t{:0>30}", chrono::Utc::now().timestamp())
}

/// Builds the hyperparameter manifest for one task by ordered merge.
///
/// Precedence, lowest to highest: the image's declared template for the task
/// kind, computed defaults (remapped gpu ids, generated task id, class names
/// for training), user-supplied overrides, and injected pretrained-weight
/// references. Later layers shallowly replace keys of earlier ones.
#[derive(Debug, Clone, Default)]
pub struct TaskConfigBuilder {
    template: Mapping,
    defaults: Mapping,
    overrides: Mapping,
    weight_refs: Mapping,
}

impl TaskConfigBuilder {
    /// Starts from the image's template for the task kind.
    pub fn from_template(template: Mapping) -> Self {
        Self {
            template,
            ..Default::default()
        }
    }

    /// Sets the computed defaults layer.
    ///
    /// `class_names` is only meaningful for training and is omitted when
    /// empty.
    pub fn with_defaults(
        mut self,
        task: TaskKind,
        gpu_id: &str,
        task_id: &str,
        class_names: &[String],
    ) -> Self {
        let (local_ids, count) = remap_gpu_ids(gpu_id);

        self.defaults
            .insert(Value::from("gpu_id"), Value::from(local_ids));
        self.defaults
            .insert(Value::from("gpu_count"), Value::from(count as u64));
        self.defaults
            .insert(Value::from("task_id"), Value::from(task_id));

        if task == TaskKind::Training && !class_names.is_empty() {
            let names: Vec<Value> = class_names.iter().map(|n| Value::from(n.clone())).collect();
            self.defaults
                .insert(Value::from("class_names"), Value::Sequence(names));
        }

        self
    }

    /// Sets the user-supplied override layer.
    pub fn with_overrides(mut self, overrides: Mapping) -> Self {
        self.overrides = overrides;
        self
    }

    /// Injects pretrained-weight references for mining, infer or a second
    /// training round.
    ///
    /// Training rounds consume `pretrained_model_params`; mining and infer
    /// consume `model_params_path`. Both are lists of container-side paths
    /// under the models sub-path of the input root.
    pub fn with_pretrained(
        mut self,
        task: TaskKind,
        models: &PretrainedModelSet,
        container_models_dir: &str,
    ) -> Self {
        if models.is_empty() {
            return self;
        }

        let paths: Vec<Value> = models
            .container_paths(container_models_dir)
            .into_iter()
            .map(Value::from)
            .collect();

        let key = match task {
            TaskKind::Training => "pretrained_model_params",
            TaskKind::Mining | TaskKind::Infer => "model_params_path",
        };
        self.weight_refs
            .insert(Value::from(key), Value::Sequence(paths));

        self
    }

    /// Merges the layers in precedence order and returns the final mapping.
    pub fn build(self) -> Mapping {
        let mut merged = self.template;
        for layer in [self.defaults, self.overrides, self.weight_refs] {
            for (k, v) in layer {
                merged.insert(k, v);
            }
        }
        merged
    }
}

/// Input section of the environment manifest: the container-side locations
/// the executor reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvInput {
    pub root_dir: String,
    pub assets_dir: String,
    pub annotations_dir: String,
    pub models_dir: String,
    pub training_index_file: String,
    pub val_index_file: String,
    pub candidate_index_file: String,
}

impl Default for EnvInput {
    fn default() -> Self {
        Self {
            root_dir: "/in".to_string(),
            assets_dir: "/in/assets".to_string(),
            annotations_dir: "/in/annotations".to_string(),
            models_dir: "/in/models".to_string(),
            training_index_file: "/in/train-index.tsv".to_string(),
            val_index_file: "/in/val-index.tsv".to_string(),
            candidate_index_file: "/in/candidate-index.tsv".to_string(),
        }
    }
}

/// Output section of the environment manifest: the container-side locations
/// the executor is contractually required to write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvOutput {
    pub root_dir: String,
    pub models_dir: String,
    pub training_result_file: String,
    pub mining_result_file: String,
    pub infer_result_file: String,
    pub monitor_file: String,
    pub tensorboard_dir: String,
}

impl Default for EnvOutput {
    fn default() -> Self {
        Self {
            root_dir: "/out".to_string(),
            models_dir: "/out/models".to_string(),
            training_result_file: "/out/models/result.yaml".to_string(),
            mining_result_file: "/out/result.tsv".to_string(),
            infer_result_file: "/out/infer-result.json".to_string(),
            monitor_file: "/out/monitor.txt".to_string(),
            tensorboard_dir: "/out/tensorboard".to_string(),
        }
    }
}

/// The environment manifest written to `<in_dir>/env.yaml`.
///
/// Exactly one of the three run flags is true, always. Index-file fields not
/// relevant to the active task kind are cleared to empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentManifest {
    pub task_id: String,
    pub run_training: bool,
    pub run_mining: bool,
    pub run_infer: bool,
    pub input: EnvInput,
    pub output: EnvOutput,
}

impl Default for EnvironmentManifest {
    fn default() -> Self {
        Self {
            task_id: String::new(),
            run_training: false,
            run_mining: false,
            run_infer: false,
            input: EnvInput::default(),
            output: EnvOutput::default(),
        }
    }
}

impl EnvironmentManifest {
    /// Derives the manifest for one task kind from this base template.
    ///
    /// Sets the run flag for `task` (and only that one), stamps the task id,
    /// and blanks the index-file fields the task does not consume.
    pub fn for_task(&self, task: TaskKind, task_id: &str) -> Self {
        let mut env = self.clone();
        env.task_id = task_id.to_string();
        env.run_training = task == TaskKind::Training;
        env.run_mining = task == TaskKind::Mining;
        env.run_infer = task == TaskKind::Infer;

        match task {
            TaskKind::Training => {
                env.input.candidate_index_file = String::new();
            }
            TaskKind::Mining | TaskKind::Infer => {
                env.input.training_index_file = String::new();
                env.input.val_index_file = String::new();
            }
        }

        env
    }

    /// The task kind this manifest activates, if exactly one flag is set.
    pub fn active_task(&self) -> Option<TaskKind> {
        match (self.run_training, self.run_mining, self.run_infer) {
            (true, false, false) => Some(TaskKind::Training),
            (false, true, false) => Some(TaskKind::Mining),
            (false, false, true) => Some(TaskKind::Infer),
            _ => None,
        }
    }

    /// The container-side result file the given task kind must produce.
    pub fn result_file(&self, task: TaskKind) -> &str {
        match task {
            TaskKind::Training => &self.output.training_result_file,
            TaskKind::Mining => &self.output.mining_result_file,
            TaskKind::Infer => &self.output.infer_result_file,
        }
    }

    /// The index files the given task kind consumes, as container paths.
    pub fn index_files(&self, task: TaskKind) -> Vec<&str> {
        match task {
            TaskKind::Training => vec![
                self.input.training_index_file.as_str(),
                self.input.val_index_file.as_str(),
            ],
            TaskKind::Mining | TaskKind::Infer => {
                vec![self.input.candidate_index_file.as_str()]
            }
        }
    }
}

/// Ordered set of weight files produced by a training task, consumed by
/// subsequent mining/infer tasks (and second training rounds).
///
/// Files are referenced in place; linking or copying into the next
/// workspace is the workspace builder's job. The underlying files are never
/// moved.
#[derive(Debug, Clone, Default)]
pub struct PretrainedModelSet {
    host_dir: PathBuf,
    files: Vec<String>,
}

impl PretrainedModelSet {
    /// Scans a host directory for weight files, one level into stage
    /// subdirectories, in stable sorted order.
    pub fn scan(host_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let host_dir = host_dir.into();
        let mut files = BTreeSet::new();

        for entry in WalkDir::new(&host_dir).min_depth(1).max_depth(2) {
            let entry = entry.map_err(std::io::Error::other)?;
            if entry.file_type().is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&host_dir) {
                    files.insert(rel.to_string_lossy().into_owned());
                }
            }
        }

        Ok(Self {
            host_dir,
            files: files.into_iter().collect(),
        })
    }

    /// True when no weight files were found.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// The host directory holding the weight files.
    pub fn host_dir(&self) -> &Path {
        &self.host_dir
    }

    /// Weight file names relative to the host directory.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// The container-side paths of the weight files once mounted under
    /// `container_models_dir`.
    pub fn container_paths(&self, container_models_dir: &str) -> Vec<String> {
        self.files
            .iter()
            .map(|f| format!("{}/{}", container_models_dir.trim_end_matches('/'), f))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_kind_parsing() {
        assert_eq!("training".parse::<TaskKind>().unwrap(), TaskKind::Training);
        assert_eq!("m".parse::<TaskKind>().unwrap(), TaskKind::Mining);
        assert_eq!("i".parse::<TaskKind>().unwrap(), TaskKind::Infer);
        assert!("classification".parse::<TaskKind>().is_err());
    }

    #[test]
    fn test_template_path() {
        assert_eq!(
            TaskKind::Mining.template_path(),
            "/img-man/mining-template.yaml"
        );
    }

    #[test]
    fn test_gpu_remap_contiguous() {
        assert_eq!(remap_gpu_ids("2,5"), ("0,1".to_string(), 2));
        assert_eq!(remap_gpu_ids("3"), ("0".to_string(), 1));
        assert_eq!(remap_gpu_ids("4, 1, 7"), ("0,1,2".to_string(), 3));
        assert_eq!(remap_gpu_ids(""), ("0".to_string(), 1));
    }

    #[test]
    fn test_task_id_shape() {
        let id = generate_task_id();
        assert!(id.starts_with('t'));
        assert_eq!(id.len(), 31);
    }

    #[test]
    fn test_merge_precedence() {
        let mut template = Mapping::new();
        template.insert(Value::from("learning_rate"), Value::from(0.01));
        template.insert(Value::from("epochs"), Value::from(100));
        template.insert(Value::from("gpu_id"), Value::from("9"));

        let mut overrides = Mapping::new();
        overrides.insert(Value::from("epochs"), Value::from(5));

        let merged = TaskConfigBuilder::from_template(template)
            .with_defaults(TaskKind::Training, "2,5", "t001", &["dog".to_string()])
            .with_overrides(overrides)
            .build();

        // defaults beat the template
        assert_eq!(merged[&Value::from("gpu_id")], Value::from("0,1"));
        assert_eq!(merged[&Value::from("gpu_count")], Value::from(2u64));
        assert_eq!(merged[&Value::from("task_id")], Value::from("t001"));
        // user overrides beat defaults and template
        assert_eq!(merged[&Value::from("epochs")], Value::from(5));
        // untouched template keys survive
        assert_eq!(merged[&Value::from("learning_rate")], Value::from(0.01));
        assert!(merged.contains_key(Value::from("class_names")));
    }

    #[test]
    fn test_pretrained_injection_key_per_task() {
        let set = PretrainedModelSet {
            host_dir: PathBuf::from("/stable/models"),
            files: vec!["best.pt".to_string()],
        };

        let mining = TaskConfigBuilder::default()
            .with_pretrained(TaskKind::Mining, &set, "/in/models")
            .build();
        assert!(mining.contains_key(Value::from("model_params_path")));

        let training = TaskConfigBuilder::default()
            .with_pretrained(TaskKind::Training, &set, "/in/models")
            .build();
        assert!(training.contains_key(Value::from("pretrained_model_params")));
        assert_eq!(
            training[&Value::from("pretrained_model_params")],
            Value::Sequence(vec![Value::from("/in/models/best.pt")])
        );
    }

    #[test]
    fn test_env_manifest_exactly_one_flag() {
        let base = EnvironmentManifest::default();
        for task in TaskKind::ALL {
            let env = base.for_task(task, "t001");
            let set = [env.run_training, env.run_mining, env.run_infer]
                .iter()
                .filter(|b| **b)
                .count();
            assert_eq!(set, 1, "exactly one run flag for {task}");
            assert_eq!(env.active_task(), Some(task));
            assert_eq!(env.task_id, "t001");
        }
    }

    #[test]
    fn test_env_manifest_blanks_unused_index_fields() {
        let base = EnvironmentManifest::default();

        let training = base.for_task(TaskKind::Training, "t001");
        assert_eq!(training.input.training_index_file, "/in/train-index.tsv");
        assert_eq!(training.input.val_index_file, "/in/val-index.tsv");
        assert_eq!(training.input.candidate_index_file, "");

        let infer = base.for_task(TaskKind::Infer, "t001");
        assert_eq!(infer.input.training_index_file, "");
        assert_eq!(infer.input.val_index_file, "");
        assert_eq!(infer.input.candidate_index_file, "/in/candidate-index.tsv");
    }

    #[test]
    fn test_env_manifest_yaml_round_trip() {
        let env = EnvironmentManifest::default().for_task(TaskKind::Mining, "t002");
        let text = serde_yaml::to_string(&env).unwrap();
        let back: EnvironmentManifest = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_pretrained_scan_one_level_into_stages() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("best.pt"), b"w").unwrap();
        std::fs::create_dir(dir.path().join("stage_10")).unwrap();
        std::fs::write(dir.path().join("stage_10/weights.pt"), b"w").unwrap();

        let set = PretrainedModelSet::scan(dir.path()).unwrap();
        assert_eq!(set.files(), &["best.pt", "stage_10/weights.pt"]);
        assert_eq!(
            set.container_paths("/in/models"),
            vec!["/in/models/best.pt", "/in/models/stage_10/weights.pt"]
        );
    }
}
