//! Ingress: issue reports and operator commands
//!
//! Two wire forms are accepted, one message per line:
//! - JSON: `{"type":"report_issue",...}` or `{"type":"command","command":"cancel","id":"..."}`
//! - chat text: `status`, `pause`, `resume`, `cancel <id>`, `retry <id>`, `cost`,
//!   optionally prefixed with `!` or `/`

use crate::error::CoordinatorError;
use chrono::{DateTime, Utc};
use fixloop_kernel::{Category, Issue, IssueId, Severity};
use serde::{Deserialize, Serialize};

/// Issue report as it arrives on the wire; category is inferred when absent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueReport {
    /// Stable id
    pub id: String,
    /// Short title
    pub title: String,
    /// Free text
    #[serde(default)]
    pub description: String,
    /// Severity
    #[serde(default)]
    pub severity: Option<Severity>,
    /// Category
    #[serde(default)]
    pub category: Option<Category>,
    /// Reporter
    #[serde(default = "default_reporter")]
    pub reporter: String,
    /// Reproduction steps
    #[serde(default)]
    pub steps_to_reproduce: Vec<String>,
    /// Expected behavior
    #[serde(default)]
    pub expected: Option<String>,
    /// Observed behavior
    #[serde(default)]
    pub actual: Option<String>,
    /// Report time
    #[serde(default)]
    pub reported_at: Option<DateTime<Utc>>,
}

fn default_reporter() -> String {
    "unknown".to_string()
}

impl IssueReport {
    /// Resolve into a domain issue
    #[must_use]
    pub fn into_issue(self) -> Issue {
        let mut issue = Issue::new(self.id, self.title, self.description, self.reporter)
            .with_steps(self.steps_to_reproduce);
        if let Some(severity) = self.severity {
            issue = issue.with_severity(severity);
        }
        if let Some(category) = self.category {
            issue = issue.with_category(category);
        }
        issue.expected = self.expected;
        issue.actual = self.actual;
        if let Some(at) = self.reported_at {
            issue.reported_at = at;
        }
        issue
    }
}

impl From<Issue> for IssueReport {
    fn from(issue: Issue) -> Self {
        Self {
            id: issue.id.0,
            title: issue.title,
            description: issue.description,
            severity: Some(issue.severity),
            category: Some(issue.category),
            reporter: issue.reporter,
            steps_to_reproduce: issue.steps_to_reproduce,
            expected: issue.expected,
            actual: issue.actual,
            reported_at: Some(issue.reported_at),
        }
    }
}

/// Operator command, mapped 1:1 onto a coordinator call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum OperatorCommand {
    /// Queue depth, live sessions, spend
    Status,
    /// Stop admitting new sessions
    Pause,
    /// Admit again, queued issues first
    Resume,
    /// Cooperative cancel of a session (or removal of a queued issue)
    Cancel {
        /// Session id or issue id
        id: String,
    },
    /// Start a fresh session for a FAILED or CANCELLED one
    Retry {
        /// Session id
        id: String,
    },
    /// Spend summary
    Cost,
}

impl OperatorCommand {
    /// Parse chat text
    ///
    /// # Errors
    /// [`CoordinatorError::Malformed`] for unknown verbs or missing ids.
    pub fn parse_text(text: &str) -> Result<Self, CoordinatorError> {
        let text = text.trim().trim_start_matches(['!', '/']);
        let mut words = text.split_whitespace();
        let verb = words.next().unwrap_or_default().to_ascii_lowercase();
        let arg = words.next().map(str::to_string);
        let needs_id = |arg: Option<String>| {
            arg.ok_or_else(|| CoordinatorError::Malformed(format!("`{verb}` needs an id")))
        };
        match verb.as_str() {
            "status" | "sessions" | "queue" => Ok(Self::Status),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "cost" | "budget" => Ok(Self::Cost),
            "cancel" => Ok(Self::Cancel { id: needs_id(arg)? }),
            "retry" => Ok(Self::Retry { id: needs_id(arg)? }),
            "" => Err(CoordinatorError::Malformed("empty command".to_string())),
            other => Err(CoordinatorError::Malformed(format!("unknown command `{other}`"))),
        }
    }
}

/// One ingress message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngressMessage {
    /// New issue report
    ReportIssue(IssueReport),
    /// Operator command
    Command(OperatorCommand),
}

impl IngressMessage {
    /// Report for an issue
    #[must_use]
    pub fn report(issue: Issue) -> Self {
        Self::ReportIssue(issue.into())
    }

    /// Issue id this message is about, if any
    #[must_use]
    pub fn issue_id(&self) -> Option<IssueId> {
        match self {
            Self::ReportIssue(report) => Some(IssueId::new(report.id.clone())),
            Self::Command(_) => None,
        }
    }
}

/// Parse one ingress line
///
/// # Errors
/// [`CoordinatorError::Malformed`] when the line is neither valid JSON nor a
/// known chat command.
pub fn parse_line(line: &str) -> Result<IngressMessage, CoordinatorError> {
    let line = line.trim();
    if line.starts_with('{') {
        serde_json::from_str(line).map_err(|e| CoordinatorError::Malformed(e.to_string()))
    } else {
        OperatorCommand::parse_text(line).map(IngressMessage::Command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn report_issue_json() {
        let msg = parse_line(
            r#"{"type":"report_issue","id":"I7","title":"Login page times out","description":"slow auth","reporter":"teen","severity":"high"}"#,
        )
        .unwrap();
        let IngressMessage::ReportIssue(report) = msg else {
            panic!("expected report");
        };
        let issue = report.into_issue();
        assert_eq!(issue.id, IssueId::new("I7"));
        assert_eq!(issue.severity, Severity::High);
        // No category given: inferred from text.
        assert_eq!(issue.category, Category::Security);
    }

    #[test]
    fn command_json() {
        assert_eq!(
            parse_line(r#"{"type":"command","command":"pause"}"#).unwrap(),
            IngressMessage::Command(OperatorCommand::Pause)
        );
        assert_eq!(
            parse_line(r#"{"type":"command","command":"cancel","id":"abc"}"#).unwrap(),
            IngressMessage::Command(OperatorCommand::Cancel { id: "abc".to_string() })
        );
    }

    #[test]
    fn chat_text_commands() {
        assert_eq!(OperatorCommand::parse_text("!status").unwrap(), OperatorCommand::Status);
        assert_eq!(OperatorCommand::parse_text("/COST").unwrap(), OperatorCommand::Cost);
        assert_eq!(
            OperatorCommand::parse_text("retry 01HZX").unwrap(),
            OperatorCommand::Retry { id: "01HZX".to_string() }
        );
        assert!(OperatorCommand::parse_text("cancel").is_err());
        assert!(OperatorCommand::parse_text("dance").is_err());
    }

    #[test]
    fn malformed_json_is_reported() {
        let err = parse_line(r#"{"type":"report_issue","id":"I1"}"#).unwrap_err();
        assert!(matches!(err, CoordinatorError::Malformed(_)));
        assert!(parse_line(r#"{"type":"launch_missiles"}"#).is_err());
    }

    #[test]
    fn report_round_trips_through_issue() {
        let issue = Issue::new("I3", "Broken link", "templates/index.html", "curator");
        let line = serde_json::to_string(&IngressMessage::report(issue.clone())).unwrap();
        let IngressMessage::ReportIssue(report) = parse_line(&line).unwrap() else {
            panic!("expected report");
        };
        assert_eq!(report.into_issue(), issue);
    }
}
