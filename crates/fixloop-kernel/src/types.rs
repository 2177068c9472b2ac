//! Core domain types shared by every Fixloop crate
//!
//! - Issue reports and their identity
//! - Session identifiers
//! - Severity / category classification
//! - Correlation threads for egress

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;
use ulid::Ulid;

/// Stable identifier of an issue report, assigned by whoever produced it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueId(pub String);

impl IssueId {
    /// Create an issue id from any string-like value
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IssueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IssueId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Unique session identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Ulid);

impl SessionId {
    /// Generate new session ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Correlation thread so every update about one issue renders together
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub String);

impl ThreadId {
    /// Thread for an issue; stable across retries of the same report
    #[inline]
    #[must_use]
    pub fn for_issue(issue: &IssueId) -> Self {
        Self(format!("issue-{}", issue.0))
    }

    /// Thread for operator/system messages not tied to an issue
    #[inline]
    #[must_use]
    pub fn operator() -> Self {
        Self("operator".to_string())
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reported severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Lenient parse; unknown values fall back to `Medium`
    #[must_use]
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            "critical" => Self::Critical,
            _ => Self::Medium,
        }
    }

    /// Lowercase label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Issue category
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Ux,
    Performance,
    #[default]
    Bug,
    Security,
    Accessibility,
    Feature,
}

const SECURITY_KEYWORDS: &[&str] = &[
    "security",
    "auth",
    "password",
    "token",
    "xss",
    "injection",
    "csrf",
    "bypass",
    "unauthorized",
    "permission",
    "access denied",
];
const PERFORMANCE_KEYWORDS: &[&str] = &[
    "slow",
    "timeout",
    "loading",
    "performance",
    "speed",
    "latency",
    "delay",
    "hang",
    "freeze",
];
const ACCESSIBILITY_KEYWORDS: &[&str] = &[
    "accessibility",
    "a11y",
    "screen reader",
    "keyboard",
    "contrast",
    "aria",
    "focus",
];
const UX_KEYWORDS: &[&str] = &[
    "confusing",
    "unclear",
    "hard to find",
    "navigation",
    "layout",
    "design",
    "ui",
    "ux",
    "user experience",
];

impl Category {
    /// Infer a category from free text when the reporter did not supply one.
    ///
    /// Checked in priority order: security, performance, accessibility, ux;
    /// anything else is a bug.
    #[must_use]
    pub fn infer(title: &str, description: &str) -> Self {
        let text = format!("{title} {description}").to_lowercase();
        let hit = |words: &[&str]| words.iter().any(|w| text.contains(w));

        if hit(SECURITY_KEYWORDS) {
            Self::Security
        } else if hit(PERFORMANCE_KEYWORDS) {
            Self::Performance
        } else if hit(ACCESSIBILITY_KEYWORDS) {
            Self::Accessibility
        } else if hit(UX_KEYWORDS) {
            Self::Ux
        } else {
            Self::Bug
        }
    }

    /// Lenient parse; unknown values fall back to `Bug`
    #[must_use]
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ux" => Self::Ux,
            "performance" => Self::Performance,
            "security" => Self::Security,
            "accessibility" => Self::Accessibility,
            "feature" => Self::Feature,
            _ => Self::Bug,
        }
    }

    /// Lowercase label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ux => "ux",
            Self::Performance => "performance",
            Self::Bug => "bug",
            Self::Security => "security",
            Self::Accessibility => "accessibility",
            Self::Feature => "feature",
        }
    }
}

/// Closed set of tester personas that produce issue reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    /// Elderly, non-technical visitor
    Grandma,
    /// Impatient mobile-first visitor
    Teen,
    /// Collection curator doing data entry
    Curator,
    /// Security tester probing for weaknesses
    Security,
}

impl Persona {
    /// Every persona, in a stable order
    pub const ALL: [Persona; 4] = [Self::Grandma, Self::Teen, Self::Curator, Self::Security];

    /// Reporter name attached to issues this persona produces
    #[must_use]
    pub fn reporter_name(self) -> &'static str {
        match self {
            Self::Grandma => "grandma",
            Self::Teen => "teen",
            Self::Curator => "curator",
            Self::Security => "security",
        }
    }
}

impl std::fmt::Display for Persona {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reporter_name())
    }
}

/// An issue report. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Stable identity
    pub id: IssueId,
    /// Short title
    pub title: String,
    /// Free-text description
    pub description: String,
    /// Severity
    #[serde(default)]
    pub severity: Severity,
    /// Category
    #[serde(default)]
    pub category: Category,
    /// Who reported it (persona name or human handle)
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
    /// When the report was produced
    #[serde(default = "Utc::now")]
    pub reported_at: DateTime<Utc>,
}

impl Issue {
    /// Create new issue with defaults for optional fields
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        reporter: impl Into<String>,
    ) -> Self {
        let title = title.into();
        let description = description.into();
        let category = Category::infer(&title, &description);
        Self {
            id: IssueId::new(id),
            title,
            description,
            severity: Severity::default(),
            category,
            reporter: reporter.into(),
            steps_to_reproduce: Vec::new(),
            expected: None,
            actual: None,
            reported_at: Utc::now(),
        }
    }

    /// With severity
    #[inline]
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// With explicit category
    #[inline]
    #[must_use]
    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    /// With reproduction steps
    #[inline]
    #[must_use]
    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.steps_to_reproduce = steps;
        self
    }

    /// With expected/actual behavior
    #[inline]
    #[must_use]
    pub fn with_outcome(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }

    /// Validate the fields an ingress adapter cannot be trusted with
    ///
    /// # Errors
    /// Returns a human-readable reason when the id or title is blank.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.0.trim().is_empty() {
            return Err("issue id is empty".to_string());
        }
        if self.title.trim().is_empty() {
            return Err(format!("issue {} has an empty title", self.id));
        }
        Ok(())
    }

    /// Correlation thread for this issue
    #[inline]
    #[must_use]
    pub fn thread(&self) -> ThreadId {
        ThreadId::for_issue(&self.id)
    }

    /// File paths and endpoints mentioned in the title or description, sorted
    #[must_use]
    pub fn file_references(&self) -> Vec<String> {
        let text = format!("{} {}", self.title, self.description);
        let mut found = BTreeSet::new();
        for re in file_reference_patterns() {
            for caps in re.captures_iter(&text) {
                if let Some(m) = caps.get(1) {
                    found.insert(m.as_str().to_string());
                }
            }
        }
        found.into_iter().collect()
    }
}

fn file_reference_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"\b([a-zA-Z_][a-zA-Z0-9_]*\.py)\b",
            r"\b(templates/[a-zA-Z0-9_/]+\.html)\b",
            r"\b(static/[a-zA-Z0-9_/]+\.[a-z]+)\b",
            r"(/api/[a-zA-Z0-9_/]+)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Lowercase, hyphen-separated slug suitable for branch names
#[must_use]
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_generation() {
        let id1 = SessionId::new();
        let id2 = SessionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn session_id_round_trips_through_display() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn category_inference_priority() {
        assert_eq!(Category::infer("Login bypass", "slow too"), Category::Security);
        assert_eq!(Category::infer("Page is slow", ""), Category::Performance);
        assert_eq!(Category::infer("Low contrast", ""), Category::Accessibility);
        assert_eq!(Category::infer("Confusing layout", ""), Category::Ux);
        assert_eq!(Category::infer("Crash on save", "500 error"), Category::Bug);
    }

    #[test]
    fn file_references_are_extracted_and_deduplicated() {
        let issue = Issue::new(
            "I1",
            "Error in app.py",
            "templates/people.html renders wrong, app.py again, hits /api/videos/list",
            "tester",
        );
        assert_eq!(
            issue.file_references(),
            vec![
                "/api/videos/list".to_string(),
                "app.py".to_string(),
                "templates/people.html".to_string(),
            ]
        );
    }

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("  Search is SLOW!! (again)"), "search-is-slow-again");
        assert_eq!(slugify("---"), "");
    }

    #[test]
    fn issue_validation() {
        assert!(Issue::new("I1", "t", "d", "r").validate().is_ok());
        assert!(Issue::new(" ", "t", "d", "r").validate().is_err());
        assert!(Issue::new("I1", "", "d", "r").validate().is_err());
    }

    #[test]
    fn severity_lenient_parse() {
        assert_eq!(Severity::parse_lenient("HIGH"), Severity::High);
        assert_eq!(Severity::parse_lenient("whatever"), Severity::Medium);
    }
}
