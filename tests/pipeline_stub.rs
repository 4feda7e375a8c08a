//! End-to-end pipeline test against a stubbed container runtime.
//!
//! The stub stands in for a well-behaved executor image: probes answer with
//! the declared templates and manifest, and every execution writes exactly
//! the artifacts the contract requires into the mounted output side. The
//! test drives a full training -> mining -> infer sequence and checks that
//! the training run's weights seed the later tasks.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use executor_verifier::error::RunnerError;
use executor_verifier::manifest::{EnvironmentManifest, TaskKind};
use executor_verifier::pipeline::{Pipeline, VerifierConfig};
use executor_verifier::runner::{
    ContainerRuntime, ExecutionOutcome, ExecutionRequest, ImageAdvisories,
};

/// A runtime that behaves like a contract-conforming executor image.
struct WellBehavedRuntime {
    object_type: i64,
    requests: Mutex<Vec<ExecutionRequest>>,
}

impl WellBehavedRuntime {
    fn new(object_type: i64) -> Self {
        Self {
            object_type,
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ContainerRuntime for WellBehavedRuntime {
    async fn probe(&self, _image: &str, command: &[String]) -> Result<String, RunnerError> {
        assert_eq!(command[0], "cat");
        let path = command[1].as_str();
        if path == "/img-man/manifest.yaml" {
            return Ok(format!("object_type: {}\n", self.object_type));
        }
        assert!(path.starts_with("/img-man/"), "unexpected probe: {path}");
        Ok("learning_rate: 0.01\nepochs: 2\n".to_string())
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, RunnerError> {
        self.requests.lock().unwrap().push(request.clone());

        let in_dir = host_side(&request.binds, ":/in:ro");
        let out_dir = host_side(&request.binds, ":/out:rw");

        let env: EnvironmentManifest =
            serde_yaml::from_str(&fs::read_to_string(in_dir.join("env.yaml")).unwrap()).unwrap();
        let task = env.active_task().expect("exactly one run flag");

        fs::write(out_dir.join("monitor.txt"), "1.0\n").unwrap();
        match task {
            TaskKind::Training => fabricate_training_output(&out_dir),
            TaskKind::Mining => fabricate_mining_output(&in_dir, &out_dir),
            TaskKind::Infer => fabricate_infer_output(&in_dir, &out_dir),
        }

        Ok(ExecutionOutcome {
            exit_code: 0,
            output: String::new(),
        })
    }

    async fn inspect_image(&self, _image: &str) -> Result<ImageAdvisories, RunnerError> {
        Ok(ImageAdvisories::default())
    }
}

/// Extracts the host path from the bind carrying the given container suffix.
fn host_side(binds: &[String], suffix: &str) -> PathBuf {
    binds
        .iter()
        .find_map(|b| b.strip_suffix(suffix))
        .map(PathBuf::from)
        .unwrap_or_else(|| panic!("no bind ends with '{suffix}' in {binds:?}"))
}

fn fabricate_training_output(out_dir: &Path) {
    fs::create_dir_all(out_dir.join("models")).unwrap();
    fs::write(out_dir.join("models/best.pt"), b"weights").unwrap();
    fs::write(
        out_dir.join("models/result.yaml"),
        "mAP: 0.42\nmodel:\n  - best.pt\n",
    )
    .unwrap();
    fs::create_dir_all(out_dir.join("tensorboard")).unwrap();
    fs::write(out_dir.join("tensorboard/events.out"), b"tb").unwrap();
}

fn candidate_images(in_dir: &Path) -> Vec<String> {
    fs::read_to_string(in_dir.join("candidate-index.tsv"))
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.split('\t').next().unwrap().to_string())
        .collect()
}

fn fabricate_mining_output(in_dir: &Path, out_dir: &Path) {
    let lines: String = candidate_images(in_dir)
        .iter()
        .map(|image| format!("{image}\t0.5\n"))
        .collect();
    fs::write(out_dir.join("result.tsv"), lines).unwrap();
}

fn fabricate_infer_output(in_dir: &Path, out_dir: &Path) {
    let mut detection = serde_json::Map::new();
    for image in candidate_images(in_dir) {
        let basename = Path::new(&image)
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        detection.insert(
            basename,
            json!({ "annotations": [{ "score": 0.9, "box": [0, 0, 10, 10] }] }),
        );
    }
    fs::write(
        out_dir.join("infer-result.json"),
        serde_json::to_string(&json!({ "detection": detection })).unwrap(),
    )
    .unwrap();
}

fn seed_data_dir(root: &Path) {
    fs::create_dir_all(root.join("assets")).unwrap();
    fs::create_dir_all(root.join("annotations")).unwrap();
    fs::write(
        root.join("train-index.tsv"),
        "assets/a.jpg\tannotations/a.txt\nassets/b.jpg\tannotations/b.txt\n",
    )
    .unwrap();
    fs::write(root.join("val-index.tsv"), "assets/c.jpg\tannotations/c.txt\n").unwrap();
    fs::write(
        root.join("candidate-index.tsv"),
        "assets/a.jpg\nassets/b.jpg\nassets/c.jpg\n",
    )
    .unwrap();
}

fn config(data_dir: PathBuf, work_dir: PathBuf, tasks: Vec<TaskKind>) -> VerifierConfig {
    VerifierConfig {
        docker_image: "executor:stub".to_string(),
        data_dir,
        work_dir,
        tasks,
        class_names: vec!["dog".to_string()],
        gpu_id: "0".to_string(),
        task_id: Some("e2e".to_string()),
        pretrain_weights_dir: None,
        env_config: EnvironmentManifest::default(),
        param_config: BTreeMap::new(),
        reuse_workspace: false,
        detach: true,
    }
}

#[tokio::test]
async fn full_sequence_passes_and_hands_weights_forward() {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().join("data");
    let work_dir = tmp.path().join("work");
    seed_data_dir(&data_dir);

    let runtime = Arc::new(WellBehavedRuntime::new(2));
    let config = config(
        data_dir,
        work_dir.clone(),
        vec![TaskKind::Training, TaskKind::Mining, TaskKind::Infer],
    );

    let pipeline = Pipeline::new(config, runtime.clone()).unwrap();
    let report = pipeline.run().await.unwrap();

    assert_eq!(report.run_id, "e2e");
    assert_eq!(report.tasks.len(), 3);
    assert!(!report.aborted());
    assert_eq!(report.error_count(), 0, "failing checks: {:?}", report);

    // One workspace pair per task under the run directory.
    for subdir in ["training", "mining", "infer"] {
        assert!(work_dir.join("e2e").join(subdir).join("in").is_dir());
        assert!(work_dir.join("e2e").join(subdir).join("out").is_dir());
    }

    // The training run's weights were copied to a stable location and linked
    // into the later tasks' input sides.
    assert!(work_dir.join("e2e/training/models/best.pt").is_file());
    for subdir in ["mining", "infer"] {
        let linked = work_dir.join("e2e").join(subdir).join("in/models/best.pt");
        assert!(linked.symlink_metadata().unwrap().is_symlink());

        let config_text =
            fs::read_to_string(work_dir.join("e2e").join(subdir).join("in/config.yaml")).unwrap();
        let config: serde_yaml::Mapping = serde_yaml::from_str(&config_text).unwrap();
        assert_eq!(
            config[&serde_yaml::Value::from("model_params_path")],
            serde_yaml::Value::Sequence(vec![serde_yaml::Value::from("/in/models/best.pt")])
        );
    }

    // Three task containers ran, each with its own workspace binds.
    let requests = runtime.requests.lock().unwrap();
    assert_eq!(requests.len(), 3);
    let in_dirs: Vec<PathBuf> = requests
        .iter()
        .map(|r| host_side(&r.binds, ":/in:ro"))
        .collect();
    assert_eq!(
        in_dirs.iter().collect::<std::collections::BTreeSet<_>>().len(),
        3,
        "each task got its own workspace"
    );
}

#[tokio::test]
async fn repeated_training_resumes_from_first_weights() {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().join("data");
    let work_dir = tmp.path().join("work");
    seed_data_dir(&data_dir);

    let runtime = Arc::new(WellBehavedRuntime::new(2));
    let config = config(
        data_dir,
        work_dir.clone(),
        vec![
            TaskKind::Training,
            TaskKind::Training,
            TaskKind::Mining,
            TaskKind::Infer,
        ],
    );

    let pipeline = Pipeline::new(config, runtime).unwrap();
    let report = pipeline.run().await.unwrap();

    assert_eq!(report.error_count(), 0, "failing checks: {:?}", report);
    assert_eq!(report.tasks.len(), 4);
    assert_eq!(report.tasks[1].subdir, "pretrain");

    // The second training round consumed the first round's weights.
    let config_text =
        fs::read_to_string(work_dir.join("e2e/pretrain/in/config.yaml")).unwrap();
    let merged: serde_yaml::Mapping = serde_yaml::from_str(&config_text).unwrap();
    assert_eq!(
        merged[&serde_yaml::Value::from("pretrained_model_params")],
        serde_yaml::Value::Sequence(vec![serde_yaml::Value::from("/in/models/best.pt")])
    );

    // Mining and infer keep consuming the first round's stable copy; the
    // second round's output stays inside its own workspace.
    let mining_config =
        fs::read_to_string(work_dir.join("e2e/mining/in/config.yaml")).unwrap();
    let mining: serde_yaml::Mapping = serde_yaml::from_str(&mining_config).unwrap();
    assert!(mining.contains_key(serde_yaml::Value::from("model_params_path")));

    let linked = fs::read_link(work_dir.join("e2e/mining/in/models/best.pt")).unwrap();
    assert!(
        linked.starts_with(work_dir.join("e2e/training/models")),
        "mining weights linked from {}",
        linked.display()
    );
    assert!(!work_dir.join("e2e/pretrain/models").exists());
}

#[tokio::test]
async fn contract_violations_do_not_stop_later_tasks() {
    /// Behaves except for mining, where the result file is never written.
    struct MiningSilentRuntime(WellBehavedRuntime);

    #[async_trait]
    impl ContainerRuntime for MiningSilentRuntime {
        async fn probe(&self, image: &str, command: &[String]) -> Result<String, RunnerError> {
            self.0.probe(image, command).await
        }

        async fn execute(
            &self,
            request: &ExecutionRequest,
        ) -> Result<ExecutionOutcome, RunnerError> {
            let outcome = self.0.execute(request).await?;
            let out_dir = host_side(&request.binds, ":/out:rw");
            let result = out_dir.join("result.tsv");
            if result.exists() {
                fs::remove_file(result).unwrap();
            }
            Ok(outcome)
        }

        async fn inspect_image(&self, image: &str) -> Result<ImageAdvisories, RunnerError> {
            self.0.inspect_image(image).await
        }
    }

    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().join("data");
    seed_data_dir(&data_dir);

    let config = config(
        data_dir,
        tmp.path().join("work"),
        vec![TaskKind::Training, TaskKind::Mining, TaskKind::Infer],
    );
    let runtime = Arc::new(MiningSilentRuntime(WellBehavedRuntime::new(2)));

    let pipeline = Pipeline::new(config, runtime).unwrap();
    let report = pipeline.run().await.unwrap();

    // The mining contract violation is recorded, but infer still ran clean.
    assert_eq!(report.tasks.len(), 3);
    assert!(!report.aborted());
    assert!(report.tasks[1].report.has_errors());
    assert!(!report.tasks[2].report.has_errors());
}

#[tokio::test]
async fn runner_failure_aborts_remaining_tasks() {
    /// Fails every execution at the engine level.
    struct CrashingRuntime(WellBehavedRuntime);

    #[async_trait]
    impl ContainerRuntime for CrashingRuntime {
        async fn probe(&self, image: &str, command: &[String]) -> Result<String, RunnerError> {
            self.0.probe(image, command).await
        }

        async fn execute(
            &self,
            _request: &ExecutionRequest,
        ) -> Result<ExecutionOutcome, RunnerError> {
            Err(RunnerError::ContainerRuntime {
                code: 137,
                detail: "oom killed".to_string(),
            })
        }

        async fn inspect_image(&self, image: &str) -> Result<ImageAdvisories, RunnerError> {
            self.0.inspect_image(image).await
        }
    }

    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().join("data");
    seed_data_dir(&data_dir);

    let config = config(
        data_dir,
        tmp.path().join("work"),
        vec![TaskKind::Training, TaskKind::Mining, TaskKind::Infer],
    );
    let runtime = Arc::new(CrashingRuntime(WellBehavedRuntime::new(2)));

    let pipeline = Pipeline::new(config, runtime).unwrap();
    let report = pipeline.run().await.unwrap();

    assert!(report.aborted());
    assert_eq!(report.tasks.len(), 1, "mining and infer never ran");
    assert!(report.tasks[0].report.has_errors());
}

#[tokio::test]
async fn pretrain_weights_seed_mining_without_training() {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().join("data");
    seed_data_dir(&data_dir);

    let weights_dir = tmp.path().join("weights");
    fs::create_dir_all(&weights_dir).unwrap();
    fs::write(weights_dir.join("pretrained.pt"), b"w").unwrap();

    let work_dir = tmp.path().join("work");
    let mut config = config(
        data_dir,
        work_dir.clone(),
        vec![TaskKind::Mining, TaskKind::Infer],
    );
    config.pretrain_weights_dir = Some(weights_dir);

    let runtime = Arc::new(WellBehavedRuntime::new(2));
    let pipeline = Pipeline::new(config, runtime).unwrap();
    let report = pipeline.run().await.unwrap();

    assert_eq!(report.error_count(), 0, "failing checks: {:?}", report);
    assert!(work_dir
        .join("e2e/mining/in/models/pretrained.pt")
        .symlink_metadata()
        .unwrap()
        .is_symlink());
}
