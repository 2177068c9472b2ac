//! CI output parsing
//!
//! Pure functions over `gh` JSON and raw check logs; the CI monitor worker
//! only fetches text and hands it here.

use crate::types::{CiFailure, CiFailureClass, CiSnapshot, CiStatus};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

const SUMMARY_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
struct RollupEnvelope {
    #[serde(rename = "statusCheckRollup", default)]
    checks: Option<Vec<RollupCheck>>,
}

#[derive(Debug, Deserialize)]
struct RollupCheck {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    conclusion: Option<String>,
}

/// Aggregate status and failed check names from `gh pr view --json statusCheckRollup`.
///
/// No checks at all is reported as pending: CI has not started yet.
///
/// # Errors
/// Returns the JSON error when the text is not a rollup envelope.
pub fn parse_check_rollup(json: &str) -> Result<(CiStatus, Vec<String>), serde_json::Error> {
    let envelope: RollupEnvelope = serde_json::from_str(json)?;
    let checks = envelope.checks.unwrap_or_default();

    let mut failed = Vec::new();
    let mut pending = checks.is_empty();
    for check in &checks {
        let name = check
            .name
            .clone()
            .or_else(|| check.context.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let status = check.status.as_deref().unwrap_or("").to_ascii_uppercase();
        let conclusion = check.conclusion.as_deref().unwrap_or("").to_ascii_uppercase();
        match (status.as_str(), conclusion.as_str()) {
            ("COMPLETED", "SUCCESS" | "NEUTRAL" | "SKIPPED") => {}
            ("COMPLETED", "FAILURE" | "CANCELLED" | "TIMED_OUT" | "ACTION_REQUIRED") => {
                failed.push(name);
            }
            // Status contexts (not check runs) only carry a state-like conclusion.
            ("", "SUCCESS") => {}
            ("", "FAILURE" | "ERROR") => failed.push(name),
            _ => pending = true,
        }
    }

    let status = if !failed.is_empty() {
        CiStatus::Failed
    } else if pending {
        CiStatus::Pending
    } else {
        CiStatus::Green
    };
    Ok((status, failed))
}

struct Patterns {
    black: Regex,
    flake8: Regex,
    pytest: Regex,
    assertion: Regex,
    build: Regex,
    summary: Vec<Regex>,
    failed_test: Regex,
}

fn build_patterns() -> Result<Patterns, regex::Error> {
    Ok(Patterns {
        black: Regex::new(r"(?i)would reformat (\S+\.py)")?,
        flake8: Regex::new(r"(\S+\.py):(\d+):\d+:\s*([A-Z]\d+)\s+(.+)")?,
        pytest: Regex::new(r"FAILED\s+(\S+\.py)::(\S+)\s*[-–]\s*(.+)")?,
        assertion: Regex::new(r"(AssertionError:.+)")?,
        build: Regex::new(r"(?i)error.*?:(.+)")?,
        summary: vec![
            Regex::new(r"(?i)error:\s*(.+)")?,
            Regex::new(r"FAILED\s*(.+)")?,
            Regex::new(r"(?i)failed:\s*(.+)")?,
        ],
        failed_test: Regex::new(r"FAILED (.+?) -")?,
    })
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS.get_or_init(|| build_patterns().ok()).as_ref()
}

/// Classify one failed check from its name and log
#[must_use]
pub fn classify_log(check: &str, log: &str) -> CiFailure {
    let Some(p) = patterns() else {
        return CiFailure {
            check: check.to_string(),
            class: CiFailureClass::Unknown,
            file: None,
            message: truncate(log.trim()),
        };
    };
    let check_lower = check.to_lowercase();
    let log_lower = log.to_lowercase();

    if check_lower.contains("lint") || log_lower.contains("black") || log_lower.contains("flake8") {
        if let Some(caps) = p.black.captures(log) {
            return CiFailure {
                check: check.to_string(),
                class: CiFailureClass::Format,
                file: caps.get(1).map(|m| m.as_str().to_string()),
                message: "black would reformat file".to_string(),
            };
        }
        let findings: Vec<_> = p.flake8.captures_iter(log).collect();
        if let Some(first) = findings.first() {
            let message = if findings.len() == 1 {
                format!(
                    "{} {}",
                    first.get(3).map_or("", |m| m.as_str()),
                    first.get(4).map_or("", |m| m.as_str()).trim()
                )
            } else {
                format!("{} flake8 errors", findings.len())
            };
            return CiFailure {
                check: check.to_string(),
                class: CiFailureClass::Lint,
                file: first.get(1).map(|m| m.as_str().to_string()),
                message: truncate(&message),
            };
        }
        return CiFailure {
            check: check.to_string(),
            class: CiFailureClass::Lint,
            file: None,
            message: error_summary(log),
        };
    }

    if check_lower.contains("test") || log_lower.contains("pytest") {
        if let Some(caps) = p.pytest.captures(log) {
            return CiFailure {
                check: check.to_string(),
                class: CiFailureClass::Test,
                file: caps.get(1).map(|m| m.as_str().to_string()),
                message: truncate(&format!(
                    "{}: {}",
                    caps.get(2).map_or("", |m| m.as_str()),
                    caps.get(3).map_or("", |m| m.as_str()).trim()
                )),
            };
        }
        let message = p
            .assertion
            .captures(log)
            .and_then(|c| c.get(1))
            .map_or_else(|| error_summary(log), |m| truncate(m.as_str()));
        return CiFailure {
            check: check.to_string(),
            class: CiFailureClass::Test,
            file: None,
            message,
        };
    }

    if check_lower.contains("build") || log_lower.contains("docker") {
        let message = p
            .build
            .captures(log)
            .and_then(|c| c.get(1))
            .map_or_else(|| error_summary(log), |m| truncate(m.as_str().trim()));
        return CiFailure {
            check: check.to_string(),
            class: CiFailureClass::Build,
            file: None,
            message,
        };
    }

    CiFailure {
        check: check.to_string(),
        class: CiFailureClass::Unknown,
        file: None,
        message: error_summary(log),
    }
}

/// Snapshot for a set of failed checks and their logs
#[must_use]
pub fn snapshot_from_logs(failed: &[(String, String)]) -> CiSnapshot {
    CiSnapshot::failed(
        failed
            .iter()
            .map(|(check, log)| classify_log(check, log))
            .collect(),
    )
}

/// First error-looking line of a log, shortened
#[must_use]
pub fn error_summary(log: &str) -> String {
    if log.trim().is_empty() {
        return "unknown error".to_string();
    }
    for re in patterns().map(|p| p.summary.as_slice()).unwrap_or_default() {
        if let Some(m) = re.captures(log).and_then(|c| c.get(1)) {
            return truncate(m.as_str().trim());
        }
    }
    log.lines()
        .map(str::trim)
        .find(|l| {
            let lower = l.to_lowercase();
            !l.is_empty() && (lower.contains("error") || lower.contains("fail"))
        })
        .map_or_else(|| "check failed, see logs".to_string(), truncate)
}

/// Failed test ids from pytest output (`FAILED path::name - reason`)
#[must_use]
pub fn parse_failed_tests(output: &str) -> Vec<String> {
    let Some(p) = patterns() else {
        return Vec::new();
    };
    p.failed_test
        .captures_iter(output)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

fn truncate(text: &str) -> String {
    text.chars().take(SUMMARY_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rollup_green_pending_failed() {
        let green = r#"{"statusCheckRollup":[{"name":"lint","status":"COMPLETED","conclusion":"SUCCESS"}]}"#;
        assert_eq!(parse_check_rollup(green).unwrap(), (CiStatus::Green, vec![]));

        let pending = r#"{"statusCheckRollup":[
            {"name":"lint","status":"COMPLETED","conclusion":"SUCCESS"},
            {"name":"test","status":"IN_PROGRESS","conclusion":""}]}"#;
        assert_eq!(parse_check_rollup(pending).unwrap().0, CiStatus::Pending);

        let failed = r#"{"statusCheckRollup":[
            {"name":"lint","status":"COMPLETED","conclusion":"FAILURE"},
            {"name":"test","status":"QUEUED"}]}"#;
        assert_eq!(
            parse_check_rollup(failed).unwrap(),
            (CiStatus::Failed, vec!["lint".to_string()])
        );
    }

    #[test]
    fn no_checks_yet_is_pending() {
        assert_eq!(parse_check_rollup(r#"{"statusCheckRollup":null}"#).unwrap().0, CiStatus::Pending);
        assert_eq!(parse_check_rollup("{}").unwrap().0, CiStatus::Pending);
    }

    #[test]
    fn black_failure_is_format_class() {
        let f = classify_log("lint", "would reformat app/routes.py\nOh no! 1 file would be reformatted.");
        assert_eq!(f.class, CiFailureClass::Format);
        assert_eq!(f.file.as_deref(), Some("app/routes.py"));
        assert!(f.class.is_auto_fixable());
    }

    #[test]
    fn flake8_failure_is_lint_class() {
        let f = classify_log("lint", "app.py:42:1: E501 line too long (130 > 120 characters)");
        assert_eq!(f.class, CiFailureClass::Lint);
        assert_eq!(f.file.as_deref(), Some("app.py"));
        assert!(f.message.starts_with("E501"));

        let many = classify_log("lint", "a.py:1:1: F401 unused\nb.py:2:1: E302 blank lines");
        assert_eq!(many.message, "2 flake8 errors");
    }

    #[test]
    fn pytest_failure_is_test_class_and_not_fixable() {
        let f = classify_log(
            "tests",
            "FAILED tests/test_app.py::test_search - AssertionError: expected 3",
        );
        assert_eq!(f.class, CiFailureClass::Test);
        assert_eq!(f.file.as_deref(), Some("tests/test_app.py"));
        assert!(!f.class.is_auto_fixable());
    }

    #[test]
    fn unrecognised_failure_is_unknown() {
        let f = classify_log("deploy-preview", "step exited: Error: quota exhausted");
        assert_eq!(f.class, CiFailureClass::Unknown);
        assert_eq!(f.message, "quota exhausted");
    }

    #[test]
    fn snapshot_auto_fixable_requires_all_fixable() {
        let mixed = snapshot_from_logs(&[
            ("lint".to_string(), "would reformat x.py".to_string()),
            ("tests".to_string(), "FAILED t.py::a - boom".to_string()),
        ]);
        assert!(!mixed.auto_fixable());
        let lint_only = snapshot_from_logs(&[("lint".to_string(), "would reformat x.py".to_string())]);
        assert!(lint_only.auto_fixable());
        assert!(!CiSnapshot::failed(vec![]).auto_fixable());
    }

    #[test]
    fn failed_test_ids_are_extracted() {
        let out = "FAILED tests/test_a.py::test_one - assert 1 == 2\nFAILED tests/test_b.py::test_two - KeyError";
        assert_eq!(
            parse_failed_tests(out),
            vec!["tests/test_a.py::test_one".to_string(), "tests/test_b.py::test_two".to_string()]
        );
    }
}
