//! Pure evaluation step: persona context in, prompt out; oracle text in, zero-or-one issue out

use fixloop_kernel::{Category, Issue, IssueId, Persona, Severity};
use serde::Deserialize;

use crate::scenario::outlook;

/// Prompt asking the persona to judge what just happened
#[must_use]
pub fn evaluation_prompt(persona: Persona, context: &str) -> String {
    format!(
        "You are {who}\n\n\
         You just experienced the following while using the app:\n\n{context}\n\n\
         Evaluate this honestly from your point of view. Was anything confusing, slow, broken, \
         inaccessible or missing?\n\n\
         If you found an issue respond with JSON only:\n\
         {{\"found_issue\": true, \"title\": \"...\", \"description\": \"...\", \
         \"severity\": \"low|medium|high|critical\", \
         \"category\": \"ux|performance|bug|security|accessibility|feature\", \
         \"expected\": \"...\", \"actual\": \"...\"}}\n\n\
         If everything was fine respond with:\n\
         {{\"found_issue\": false, \"comment\": \"...\"}}",
        who = outlook(persona)
    )
}

#[derive(Debug, Deserialize)]
struct Verdict {
    #[serde(default)]
    found_issue: bool,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    expected: Option<String>,
    #[serde(default)]
    actual: Option<String>,
}

/// Turn an oracle reply into at most one issue.
///
/// The reply may wrap its JSON in prose; the outermost `{...}` is parsed.
/// Anything unparsable counts as "no issue".
#[must_use]
pub fn evaluate_experience(persona: Persona, id: IssueId, reply: &str) -> Option<Issue> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end <= start {
        return None;
    }
    let verdict: Verdict = match serde_json::from_str(&reply[start..=end]) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(%persona, error = %e, "evaluation reply was not JSON");
            return None;
        }
    };
    if !verdict.found_issue {
        return None;
    }

    let title = verdict
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| "Untitled issue".to_string());
    let description = verdict.description.unwrap_or_default();
    let category = verdict
        .category
        .as_deref()
        .map_or_else(|| Category::infer(&title, &description), Category::parse_lenient);
    let mut issue = Issue::new(id.0, title, description, persona.reporter_name())
        .with_severity(verdict.severity.as_deref().map_or(Severity::Medium, Severity::parse_lenient))
        .with_category(category);
    issue.expected = verdict.expected;
    issue.actual = verdict.actual;
    Some(issue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn issue_is_parsed_out_of_prose() {
        let reply = r#"Well dear, here goes:
        {"found_issue": true, "title": "Buttons too small", "description": "I can't see them",
         "severity": "high", "category": "accessibility", "expected": "big", "actual": "tiny"}
        Hope that helps!"#;
        let issue = evaluate_experience(Persona::Grandma, IssueId::new("G1"), reply).unwrap();
        assert_eq!(issue.title, "Buttons too small");
        assert_eq!(issue.severity, Severity::High);
        assert_eq!(issue.category, Category::Accessibility);
        assert_eq!(issue.reporter, "grandma");
        assert_eq!(issue.actual.as_deref(), Some("tiny"));
    }

    #[test]
    fn no_issue_and_garbage_yield_none() {
        assert!(evaluate_experience(
            Persona::Teen,
            IssueId::new("T1"),
            r#"{"found_issue": false, "comment": "fine"}"#
        )
        .is_none());
        assert!(evaluate_experience(Persona::Teen, IssueId::new("T2"), "no json here").is_none());
        assert!(evaluate_experience(Persona::Teen, IssueId::new("T3"), "{not json}").is_none());
    }

    #[test]
    fn missing_category_is_inferred() {
        let reply = r#"{"found_issue": true, "title": "Search is slow", "description": "took ages"}"#;
        let issue = evaluate_experience(Persona::Teen, IssueId::new("T4"), reply).unwrap();
        assert_eq!(issue.category, Category::Performance);
        assert_eq!(issue.severity, Severity::Medium);
    }

    #[test]
    fn prompt_names_persona() {
        assert!(evaluation_prompt(Persona::Curator, "ctx").contains("Uncle Dave"));
    }
}
