//! Mining output checks.
//!
//! The mining result is a TSV of `image path<TAB>score` lines whose count
//! must exactly equal the candidate index file's line count.

use crate::manifest::TaskKind;

use super::{OutputValidator, VerificationReport};

pub(super) fn validate(v: &OutputValidator<'_>, report: &mut VerificationReport) {
    let container_path = v.env.result_file(TaskKind::Mining);
    let host = match v.host(container_path) {
        Ok(host) => host,
        Err(e) => {
            report.fail("mining_result_file", e.to_string());
            return;
        }
    };

    if !host.is_file() {
        report.fail(
            "mining_result_file",
            format!("missing mining result file '{}'", host.display()),
        );
        return;
    }
    report.pass("mining_result_file");

    let result_text = match std::fs::read_to_string(&host) {
        Ok(text) => text,
        Err(e) => {
            report.fail(
                "mining_result_file",
                format!("cannot read '{}': {e}", host.display()),
            );
            return;
        }
    };
    let result_lines: Vec<&str> = non_blank_lines(&result_text);

    check_line_count(v, result_lines.len(), report);
    check_scores(&result_lines, report);
}

fn check_line_count(v: &OutputValidator<'_>, produced: usize, report: &mut VerificationReport) {
    let candidate_host = match v.host(&v.env.input.candidate_index_file) {
        Ok(host) => host,
        Err(e) => {
            report.fail("mining_line_count", e.to_string());
            return;
        }
    };

    let expected = match std::fs::read_to_string(&candidate_host) {
        Ok(text) => non_blank_lines(&text).len(),
        Err(e) => {
            report.fail(
                "mining_line_count",
                format!(
                    "cannot read candidate index '{}': {e}",
                    candidate_host.display()
                ),
            );
            return;
        }
    };

    if produced == expected {
        report.pass("mining_line_count");
    } else {
        report.fail(
            "mining_line_count",
            format!("mining result has {produced} lines, candidate index has {expected}"),
        );
    }
}

/// Every line carries an image path and a numeric score, tab separated.
fn check_scores(lines: &[&str], report: &mut VerificationReport) {
    let mut problems = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        let mut fields = line.split('\t');
        let (Some(image), Some(score)) = (fields.next(), fields.next()) else {
            problems.push(format!("line {}: expected 'path<TAB>score'", idx + 1));
            continue;
        };
        if image.trim().is_empty() {
            problems.push(format!("line {}: empty image path", idx + 1));
        }
        if score.trim().parse::<f64>().is_err() {
            problems.push(format!("line {}: score '{score}' is not a number", idx + 1));
        }
    }

    if problems.is_empty() {
        report.pass("mining_scores");
    } else {
        report.fail("mining_scores", problems.join("; "));
    }
}

fn non_blank_lines(text: &str) -> Vec<&str> {
    text.lines().filter(|l| !l.trim().is_empty()).collect()
}
