//! Inference output checks.
//!
//! Detection results map image basenames to per-image records; the basename
//! set must exactly equal the set derived from the candidate index file.
//! Per-image annotation lists are normalized to the contract's cap of 50
//! entries, keeping the highest-confidence annotations. Segmentation
//! results carry RLE-style records that must declare `size` and `counts`.

use std::collections::BTreeSet;
use std::path::Path;

use serde_json::Value;

use crate::manifest::TaskKind;

use super::{OutputValidator, VerificationReport};

/// Contractual cap on annotations kept per image.
pub const MAX_ANNOTATIONS_PER_IMAGE: usize = 50;

pub(super) fn validate(v: &OutputValidator<'_>, report: &mut VerificationReport) {
    let container_path = v.env.result_file(TaskKind::Infer);
    let host = match v.host(container_path) {
        Ok(host) => host,
        Err(e) => {
            report.fail("infer_result_file", e.to_string());
            return;
        }
    };

    if !host.is_file() {
        report.fail(
            "infer_result_file",
            format!("missing infer result file '{}'", host.display()),
        );
        return;
    }
    report.pass("infer_result_file");

    let mut result: Value = match std::fs::read_to_string(&host)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
    {
        Ok(result) => {
            report.pass("infer_result_parse");
            result
        }
        Err(e) => {
            report.fail(
                "infer_result_parse",
                format!("cannot parse '{}': {e}", host.display()),
            );
            return;
        }
    };

    if v.family.is_segmentation() {
        check_segmentation_records(&result, report);
    } else {
        check_detection_section(v, &mut result, report);
    }
}

/// Sorts by descending confidence score and truncates to `limit` entries.
pub fn truncate_annotations(annotations: &mut Vec<Value>, limit: usize) {
    annotations.sort_by(|a, b| {
        let score_a = annotation_score(a);
        let score_b = annotation_score(b);
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    annotations.truncate(limit);
}

fn annotation_score(annotation: &Value) -> f64 {
    annotation
        .get("score")
        .or_else(|| annotation.get("confidence"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

fn check_detection_section(
    v: &OutputValidator<'_>,
    result: &mut Value,
    report: &mut VerificationReport,
) {
    let Some(section) = result.get_mut("detection").and_then(Value::as_object_mut) else {
        report.fail(
            "infer_detection_section",
            "infer result has no 'detection' mapping",
        );
        return;
    };
    report.pass("infer_detection_section");

    match candidate_basenames(v) {
        Err(message) => report.fail("candidate_index", message),
        Ok(expected) => {
            report.pass("candidate_index");
            let produced: BTreeSet<String> = section.keys().cloned().collect();
            if produced == expected {
                report.pass("infer_result_basenames");
            } else {
                let missing: Vec<&String> = expected.difference(&produced).collect();
                let extra: Vec<&String> = produced.difference(&expected).collect();
                report.fail(
                    "infer_result_basenames",
                    format!(
                        "result basenames do not match candidate index \
                         (expected {}, got {}; missing {missing:?}, extra {extra:?})",
                        expected.len(),
                        produced.len()
                    ),
                );
            }
        }
    }

    let mut truncated = Vec::new();
    for (basename, record) in section.iter_mut() {
        if let Some(annotations) = record.get_mut("annotations").and_then(Value::as_array_mut) {
            if annotations.len() > MAX_ANNOTATIONS_PER_IMAGE {
                truncated.push(basename.clone());
            }
            truncate_annotations(annotations, MAX_ANNOTATIONS_PER_IMAGE);
        }
    }
    if truncated.is_empty() {
        report.pass("annotation_truncation");
    } else {
        report.warn(
            "annotation_truncation",
            format!(
                "annotation lists capped at {MAX_ANNOTATIONS_PER_IMAGE} entries for {truncated:?}"
            ),
        );
    }
}

/// Basenames derived from the candidate index file: one image path per line,
/// first tab-separated field, duplicates collapse to a set.
fn candidate_basenames(v: &OutputValidator<'_>) -> Result<BTreeSet<String>, String> {
    let host = v
        .host(&v.env.input.candidate_index_file)
        .map_err(|e| e.to_string())?;
    let text = std::fs::read_to_string(&host)
        .map_err(|e| format!("cannot read candidate index '{}': {e}", host.display()))?;

    Ok(text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let image = line.split('\t').next()?;
            Path::new(image)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .collect())
}

fn check_segmentation_records(result: &Value, report: &mut VerificationReport) {
    let Some(annotations) = result.get("annotations").and_then(Value::as_array) else {
        report.fail(
            "segmentation_records",
            "infer result has no 'annotations' list",
        );
        return;
    };

    let mut problems = Vec::new();
    for (idx, annotation) in annotations.iter().enumerate() {
        match annotation.get("segmentation") {
            None => problems.push(format!("annotation {idx} has no 'segmentation' object")),
            Some(segmentation) => {
                for key in ["size", "counts"] {
                    if segmentation.get(key).is_none() {
                        problems.push(format!("annotation {idx} segmentation lacks '{key}'"));
                    }
                }
            }
        }
    }

    if problems.is_empty() {
        report.pass("segmentation_records");
    } else {
        report.fail("segmentation_records", problems.join("; "));
    }
}
