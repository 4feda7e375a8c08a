//! Training output checks.
//!
//! The training contract: a parseable result file carrying the family
//! metric, model file references that resolve under the models output
//! directory, a non-empty models tree, tensorboard logs and a monitor file.

use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use walkdir::WalkDir;

use crate::manifest::TaskKind;

use super::{yaml_is_numeric, OutputValidator, VerificationReport};

/// File suffixes recognized as model weights. Absence is an advisory, not a
/// contract violation.
const WEIGHT_SUFFIXES: [&str; 7] = [".pt", ".pth", ".weights", ".onnx", ".params", ".bin", ".h5"];

pub(super) fn validate(v: &OutputValidator<'_>, report: &mut VerificationReport) {
    let models_dir = v.host(&v.env.output.models_dir).ok();

    check_result_file(v, models_dir.as_deref(), report);
    check_models_dir(models_dir.as_deref(), report);
    check_tensorboard(v, report);
}

fn check_result_file(
    v: &OutputValidator<'_>,
    models_dir: Option<&Path>,
    report: &mut VerificationReport,
) {
    let container_path = v.env.result_file(TaskKind::Training);
    let host = match v.host(container_path) {
        Ok(host) => host,
        Err(e) => {
            report.fail("training_result_file", e.to_string());
            return;
        }
    };

    if !host.is_file() {
        report.fail(
            "training_result_file",
            format!("missing training result file '{}'", host.display()),
        );
        return;
    }
    report.pass("training_result_file");

    let result: Mapping = match std::fs::read_to_string(&host)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_yaml::from_str(&text).map_err(|e| e.to_string()))
    {
        Ok(result) => {
            report.pass("training_result_parse");
            result
        }
        Err(e) => {
            report.fail(
                "training_result_parse",
                format!("cannot parse '{}': {e}", host.display()),
            );
            return;
        }
    };

    check_metric(v, &result, report);
    if let Some(models_dir) = models_dir {
        check_model_list(&result, models_dir, report);
        check_model_stages(v, &result, models_dir, report);
    }
}

fn check_metric(v: &OutputValidator<'_>, result: &Mapping, report: &mut VerificationReport) {
    let metric = v.family.metric_key();
    match result.get(Value::from(metric)) {
        None => report.fail(
            "training_metric",
            format!("metric '{metric}' missing from training result"),
        ),
        Some(value) if yaml_is_numeric(value) => report.pass("training_metric"),
        Some(value) => report.fail(
            "training_metric",
            format!("metric '{metric}' is not a number: {value:?}"),
        ),
    }
}

/// Flat `model` file list: every entry relative, resolving to a file under
/// the models output directory.
fn check_model_list(result: &Mapping, models_dir: &Path, report: &mut VerificationReport) {
    let Some(value) = result.get(Value::from("model")) else {
        return;
    };

    let Some(entries) = value.as_sequence() else {
        report.fail("model_files", "'model' in training result is not a list");
        return;
    };

    let mut problems = Vec::new();
    for entry in entries {
        let Some(file) = entry.as_str() else {
            problems.push(format!("entry {entry:?} is not a string"));
            continue;
        };
        if Path::new(file).is_absolute() {
            problems.push(format!("'{file}' is an absolute path"));
            continue;
        }
        if !models_dir.join(file).is_file() {
            problems.push(format!(
                "'{file}' does not resolve under '{}'",
                models_dir.display()
            ));
        }
    }

    if problems.is_empty() {
        report.pass("model_files");
    } else {
        report.fail("model_files", problems.join("; "));
    }
}

/// `model_stages`: a mapping of stage name to a record carrying
/// `stage_name`, `files`, `timestamp` and the family metric, with every file
/// resolvable under `models/` or `models/<stage_name>`, none absolute, none
/// a symlink.
fn check_model_stages(
    v: &OutputValidator<'_>,
    result: &Mapping,
    models_dir: &Path,
    report: &mut VerificationReport,
) {
    let Some(value) = result.get(Value::from("model_stages")) else {
        return;
    };

    let Some(stages) = value.as_mapping() else {
        report.fail(
            "model_stages",
            "'model_stages' in training result is not a mapping",
        );
        return;
    };

    let metric = v.family.metric_key();
    let mut problems = Vec::new();

    for (stage_key, stage_value) in stages {
        let stage_name = stage_key.as_str().unwrap_or_default().to_string();
        let Some(stage) = stage_value.as_mapping() else {
            problems.push(format!("stage '{stage_name}' is not a mapping"));
            continue;
        };

        for key in ["stage_name", "files", "timestamp", metric] {
            if !stage.contains_key(Value::from(key)) {
                problems.push(format!("'{key}' missing from stage '{stage_name}'"));
            }
        }

        let Some(files) = stage.get(Value::from("files")).and_then(Value::as_sequence) else {
            problems.push(format!("'files' in stage '{stage_name}' is not a list"));
            continue;
        };

        for file in files {
            let Some(file) = file.as_str() else {
                problems.push(format!("file entry {file:?} in stage '{stage_name}' is not a string"));
                continue;
            };
            if Path::new(file).is_absolute() {
                problems.push(format!("'{file}' in stage '{stage_name}' is an absolute path"));
                continue;
            }

            let in_root = models_dir.join(file);
            let in_stage = models_dir.join(&stage_name).join(file);
            let resolved = [in_stage, in_root].into_iter().find(|p| p.is_file());
            match resolved {
                None => problems.push(format!(
                    "'{file}' in stage '{stage_name}' resolves under neither '{}' nor '{}'",
                    models_dir.display(),
                    models_dir.join(&stage_name).display()
                )),
                Some(path) if is_symlink(&path) => {
                    problems.push(format!("'{file}' in stage '{stage_name}' is a symbolic link"))
                }
                Some(_) => {}
            }
        }
    }

    if problems.is_empty() {
        report.pass("model_stages");
    } else {
        report.fail("model_stages", problems.join("; "));
    }
}

/// Models output directory: at least one file, recursing one level into
/// stage subdirectories; a missing recognized weight suffix is a warning.
fn check_models_dir(models_dir: Option<&Path>, report: &mut VerificationReport) {
    let Some(models_dir) = models_dir else {
        report.fail("models_dir", "models output dir is not under a declared root");
        return;
    };

    if !models_dir.is_dir() {
        report.fail(
            "models_dir",
            format!("missing models output dir '{}'", models_dir.display()),
        );
        return;
    }

    let files: Vec<PathBuf> = WalkDir::new(models_dir)
        .min_depth(1)
        .max_depth(2)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();

    if files.is_empty() {
        report.fail(
            "models_dir",
            format!("models output dir '{}' holds no files", models_dir.display()),
        );
        return;
    }
    report.pass("models_dir");

    let has_weights = files.iter().any(|p| {
        let name = p.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        WEIGHT_SUFFIXES.iter().any(|s| name.ends_with(s))
    });
    if has_weights {
        report.pass("model_weight_suffix");
    } else {
        report.warn(
            "model_weight_suffix",
            format!(
                "no file in '{}' carries a recognized weight suffix ({})",
                models_dir.display(),
                WEIGHT_SUFFIXES.join(", ")
            ),
        );
    }
}

fn check_tensorboard(v: &OutputValidator<'_>, report: &mut VerificationReport) {
    match v.host(&v.env.output.tensorboard_dir) {
        Err(e) => report.fail("tensorboard_dir", e.to_string()),
        Ok(dir) if !dir.is_dir() => report.fail(
            "tensorboard_dir",
            format!("missing tensorboard dir '{}'", dir.display()),
        ),
        Ok(dir) => {
            let empty = std::fs::read_dir(&dir)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(true);
            if empty {
                report.fail(
                    "tensorboard_dir",
                    format!("tensorboard dir '{}' is empty", dir.display()),
                );
            } else {
                report.pass("tensorboard_dir");
            }
        }
    }
}

fn is_symlink(path: &Path) -> bool {
    path.symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}
