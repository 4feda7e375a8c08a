//! Output validation against the executor contract.
//!
//! Validators never raise on the first failure: every check contributes one
//! named entry to a [`VerificationReport`], and the caller decides whether
//! any finding is fatal. Dispatch is by `(task kind, algorithm family)`,
//! with the family resolved once per pipeline from the image's declared
//! object type.

mod infer;
mod mining;
mod training;

pub use infer::{truncate_annotations, MAX_ANNOTATIONS_PER_IMAGE};

use std::fmt;
use std::path::PathBuf;

use crate::error::PathError;
use crate::manifest::{EnvironmentManifest, TaskKind};
use crate::paths::PathTranslator;
use crate::runner::ContainerRuntime;

/// Container-side manifest declaring the image's object type.
pub const IMAGE_MANIFEST_PATH: &str = "/img-man/manifest.yaml";

/// Outcome of a single named check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    Ok,
    Warning(String),
    Error(String),
}

impl Finding {
    pub fn is_error(&self) -> bool {
        matches!(self, Finding::Error(_))
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Finding::Warning(_))
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finding::Ok => write!(f, "ok"),
            Finding::Warning(msg) => write!(f, "warning: {msg}"),
            Finding::Error(msg) => write!(f, "error: {msg}"),
        }
    }
}

/// Insertion-ordered accumulation of check outcomes for one task.
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    checks: Vec<(String, Finding)>,
}

impl VerificationReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a check outcome under its name.
    pub fn record(&mut self, name: impl Into<String>, finding: Finding) {
        self.checks.push((name.into(), finding));
    }

    pub fn pass(&mut self, name: impl Into<String>) {
        self.record(name, Finding::Ok);
    }

    pub fn warn(&mut self, name: impl Into<String>, message: impl Into<String>) {
        self.record(name, Finding::Warning(message.into()));
    }

    pub fn fail(&mut self, name: impl Into<String>, message: impl Into<String>) {
        self.record(name, Finding::Error(message.into()));
    }

    /// All recorded checks in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Finding)> {
        self.checks.iter().map(|(n, f)| (n.as_str(), f))
    }

    /// The first finding recorded under `name`.
    pub fn get(&self, name: &str) -> Option<&Finding> {
        self.checks
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f)
    }

    pub fn error_count(&self) -> usize {
        self.checks.iter().filter(|(_, f)| f.is_error()).count()
    }

    pub fn has_errors(&self) -> bool {
        self.error_count() > 0
    }

    /// Failing checks as `(name, message)` pairs.
    pub fn errors(&self) -> impl Iterator<Item = (&str, &str)> {
        self.checks.iter().filter_map(|(n, f)| match f {
            Finding::Error(msg) => Some((n.as_str(), msg.as_str())),
            _ => None,
        })
    }

    /// Appends another report's checks to this one.
    pub fn merge(&mut self, other: VerificationReport) {
        self.checks.extend(other.checks);
    }
}

/// Algorithm family an executor image implements, declared through the
/// `object_type` code in its manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmFamily {
    Detection,
    SemanticSegmentation,
    InstanceSegmentation,
}

impl AlgorithmFamily {
    /// Maps an object-type code to a family. Codes: 2 detection, 3 semantic
    /// segmentation, 4 instance segmentation.
    pub fn from_object_type(code: i64) -> Option<Self> {
        match code {
            2 => Some(AlgorithmFamily::Detection),
            3 => Some(AlgorithmFamily::SemanticSegmentation),
            4 => Some(AlgorithmFamily::InstanceSegmentation),
            _ => None,
        }
    }

    pub fn object_type(&self) -> i64 {
        match self {
            AlgorithmFamily::Detection => 2,
            AlgorithmFamily::SemanticSegmentation => 3,
            AlgorithmFamily::InstanceSegmentation => 4,
        }
    }

    /// The metric key the family's training result must carry.
    pub fn metric_key(&self) -> &'static str {
        match self {
            AlgorithmFamily::Detection => "mAP",
            AlgorithmFamily::SemanticSegmentation => "mIoU",
            AlgorithmFamily::InstanceSegmentation => "maskAP",
        }
    }

    pub fn is_segmentation(&self) -> bool {
        !matches!(self, AlgorithmFamily::Detection)
    }
}

impl fmt::Display for AlgorithmFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlgorithmFamily::Detection => "detection",
            AlgorithmFamily::SemanticSegmentation => "semantic_segmentation",
            AlgorithmFamily::InstanceSegmentation => "instance_segmentation",
        };
        f.write_str(name)
    }
}

/// Resolves the image's algorithm family by probing its manifest.
///
/// Unresolvable manifests and probe failures default to detection.
pub async fn resolve_family(runtime: &dyn ContainerRuntime, image: &str) -> AlgorithmFamily {
    let command = vec!["cat".to_string(), IMAGE_MANIFEST_PATH.to_string()];
    let text = match runtime.probe(image, &command).await {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("object type probe failed, defaulting to detection: {e}");
            return AlgorithmFamily::Detection;
        }
    };

    serde_yaml::from_str::<serde_yaml::Value>(&text)
        .ok()
        .and_then(|v| v.get("object_type").and_then(serde_yaml::Value::as_i64))
        .and_then(AlgorithmFamily::from_object_type)
        .unwrap_or(AlgorithmFamily::Detection)
}

/// Per-task output validator for one workspace.
pub struct OutputValidator<'a> {
    pub(crate) family: AlgorithmFamily,
    pub(crate) env: &'a EnvironmentManifest,
    pub(crate) translator: &'a PathTranslator,
}

impl<'a> OutputValidator<'a> {
    pub fn new(
        family: AlgorithmFamily,
        env: &'a EnvironmentManifest,
        translator: &'a PathTranslator,
    ) -> Self {
        Self {
            family,
            env,
            translator,
        }
    }

    /// Runs every check for the task kind, accumulating one report.
    pub fn validate(&self, task: TaskKind) -> VerificationReport {
        let mut report = VerificationReport::new();
        match task {
            TaskKind::Training => training::validate(self, &mut report),
            TaskKind::Mining => mining::validate(self, &mut report),
            TaskKind::Infer => infer::validate(self, &mut report),
        }
        self.check_monitor(&mut report);
        report
    }

    /// Host path of a container-side contract location.
    pub(crate) fn host(&self, container_path: &str) -> Result<PathBuf, PathError> {
        self.translator.to_host(container_path)
    }

    fn check_monitor(&self, report: &mut VerificationReport) {
        match self.host(&self.env.output.monitor_file) {
            Ok(path) if path.is_file() => report.pass("monitor_file"),
            Ok(path) => report.fail(
                "monitor_file",
                format!("missing monitor file '{}'", path.display()),
            ),
            Err(e) => report.fail("monitor_file", e.to_string()),
        }
    }
}

/// Numeric or numeric-string values are accepted for metrics; anything else
/// is a contract violation.
pub(crate) fn yaml_is_numeric(value: &serde_yaml::Value) -> bool {
    match value {
        serde_yaml::Value::Number(_) => true,
        serde_yaml::Value::String(s) => s.trim().parse::<f64>().is_ok(),
        _ => false,
    }
}
