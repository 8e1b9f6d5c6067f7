//! Interprets the linter's structured report.

use crate::result::{Finding, Location, Severity, ValidationStatus};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Report {
    #[serde(default)]
    violations: Vec<Violation>,
}

#[derive(Debug, Deserialize)]
struct Violation {
    level: String,
    title: String,

    #[serde(default)]
    description: Option<String>,

    #[serde(default)]
    location: Option<ViolationLocation>,
}

#[derive(Debug, Deserialize)]
struct ViolationLocation {
    row: u32,
    col: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Classified {
    pub status: ValidationStatus,
    pub findings: Vec<Finding>,
}

/// Maps a finished lint run to a verdict.
///
/// Error-level violations make the content invalid regardless of how the
/// tool exited. A failing exit without any error-level violation means the
/// tool itself is broken.
pub(crate) fn classify(success: bool, stdout: &[u8], stderr: &[u8]) -> Classified {
    let report = match serde_json::from_slice::<Report>(stdout) {
        Ok(report) => report,
        Err(error) => {
            let mut message = format!("unparseable validator output: {error}");
            append_stderr(&mut message, stderr);
            return Classified {
                status: ValidationStatus::Error,
                findings: vec![Finding::error(message)],
            };
        }
    };

    let mut findings = report
        .violations
        .into_iter()
        .map(Finding::from)
        .collect::<Vec<_>>();
    // Errors first; stable within a severity so tool ordering is kept.
    findings.sort_by_key(|f| f.severity);

    let has_errors = findings.iter().any(|f| f.severity == Severity::Error);
    let status = match (has_errors, success) {
        (true, _) => ValidationStatus::Invalid,
        (false, true) => ValidationStatus::Valid,
        (false, false) => {
            let mut message = "validator exited unsuccessfully without reporting errors".to_string();
            append_stderr(&mut message, stderr);
            findings.insert(0, Finding::error(message));
            ValidationStatus::Error
        }
    };
    Classified { status, findings }
}

fn append_stderr(message: &mut String, stderr: &[u8]) {
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        message.push_str(": ");
        message.push_str(stderr);
    }
}

impl From<Violation> for Finding {
    fn from(v: Violation) -> Self {
        let severity = match v.level.as_str() {
            "error" => Severity::Error,
            _ => Severity::Warning,
        };
        let message = match v.description {
            Some(description) if !description.is_empty() => {
                format!("{}: {description}", v.title)
            }
            _ => v.title,
        };
        Finding {
            severity,
            message,
            location: v.location.map(|l| Location {
                row: l.row,
                col: l.col,
            }),
        }
    }
}
