//! Strategy prompts and the plans the oracle answers with

use fixloop_kernel::Issue;
use fixloop_learning::Lesson;
use fixloop_workers::FileEdit;
use serde::{Deserialize, Serialize};

/// Feedback carried into a repair strategy is cut to this many characters
pub const FEEDBACK_LIMIT: usize = 4000;
/// Code context is cut to this many characters
pub const CONTEXT_LIMIT: usize = 24_000;

/// Ordered plan of edits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// One-line summary of the fix
    #[serde(default)]
    pub summary: String,
    /// Oracle's own estimate (`low`, `medium`, `high`)
    #[serde(default = "default_complexity")]
    pub complexity: String,
    /// Files the plan expects to touch
    #[serde(default)]
    pub files_affected: Vec<String>,
    /// Edits, applied in order
    #[serde(default)]
    pub edits: Vec<FileEdit>,
}

fn default_complexity() -> String {
    "medium".to_string()
}

impl Plan {
    /// Every file the plan names, sorted and deduplicated
    #[must_use]
    pub fn files(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .files_affected
            .iter()
            .cloned()
            .chain(self.edits.iter().map(|e| e.file.clone()))
            .collect();
        files.sort();
        files.dedup();
        files
    }
}

/// Why an oracle answer is not a usable plan
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// No JSON object anywhere in the answer
    #[error("answer contains no JSON object")]
    NoJson,

    /// JSON present but not a plan
    #[error("plan JSON does not match the schema: {0}")]
    Malformed(String),

    /// Plan has no edits
    #[error("plan contains no edits")]
    NoEdits,

    /// An edit names no file
    #[error("edit {index} has an empty file path")]
    EmptyFile {
        /// Position in `edits`
        index: usize,
    },
}

/// Cut the JSON object out of an answer: inside a ```json fence when there is
/// one, from the first `{` to the last `}` otherwise.
fn extract_json(text: &str) -> Option<&str> {
    let body = match text.find("```json") {
        Some(start) => {
            let rest = &text[start + "```json".len()..];
            rest.find("```").map_or(rest, |end| &rest[..end])
        }
        None => text,
    };
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    (end > start).then(|| &body[start..=end])
}

/// Parse an oracle answer into a plan
///
/// # Errors
/// [`PlanError`] describing what is wrong; quoted back to the oracle in the
/// corrective prompt.
pub fn parse_plan(text: &str) -> Result<Plan, PlanError> {
    let json = extract_json(text).ok_or(PlanError::NoJson)?;
    let plan: Plan = serde_json::from_str(json).map_err(|e| PlanError::Malformed(e.to_string()))?;
    if plan.edits.is_empty() {
        return Err(PlanError::NoEdits);
    }
    if let Some(index) = plan.edits.iter().position(|e| e.file.trim().is_empty()) {
        return Err(PlanError::EmptyFile { index });
    }
    Ok(plan)
}

/// Failure output carried into a repair strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    /// Test suite output after the previous plan was applied
    TestFailure(String),
}

impl Feedback {
    fn heading(&self) -> &'static str {
        match self {
            Self::TestFailure(_) => "TESTS FAILED AFTER THE PREVIOUS ATTEMPT",
        }
    }

    fn text(&self) -> &str {
        match self {
            Self::TestFailure(t) => t,
        }
    }
}

/// Inputs to one strategy prompt
#[derive(Debug, Clone, Copy)]
pub struct StrategyInput<'a> {
    /// Issue being fixed
    pub issue: &'a Issue,
    /// Source of the files involved
    pub context: &'a str,
    /// Relevant lessons, most relevant first
    pub lessons: &'a [Lesson],
    /// Failure of the previous attempt, when repairing
    pub feedback: Option<&'a Feedback>,
    /// Plan of the previous attempt, when repairing
    pub previous: Option<&'a Plan>,
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    // Keep the tail: test runners print the verdict last.
    let skip = text.chars().count() - limit;
    format!("... ({skip} characters omitted)\n{}", text.chars().skip(skip).collect::<String>())
}

/// Compose the strategy prompt
#[must_use]
pub fn strategy_prompt(input: StrategyInput<'_>) -> String {
    let issue = input.issue;
    let mut prompt = String::new();
    prompt.push_str("You are fixing a reported issue in a web application.\n\n");
    prompt.push_str("ISSUE\n");
    prompt.push_str(&format!("id: {}\n", issue.id));
    prompt.push_str(&format!("title: {}\n", issue.title));
    prompt.push_str(&format!(
        "severity: {} | category: {} | reporter: {}\n",
        issue.severity.as_str(),
        issue.category.as_str(),
        issue.reporter
    ));
    prompt.push_str(&format!("description: {}\n", issue.description));
    if !issue.steps_to_reproduce.is_empty() {
        prompt.push_str("steps to reproduce:\n");
        for (i, step) in issue.steps_to_reproduce.iter().enumerate() {
            prompt.push_str(&format!("  {}. {step}\n", i + 1));
        }
    }
    if let Some(expected) = &issue.expected {
        prompt.push_str(&format!("expected: {expected}\n"));
    }
    if let Some(actual) = &issue.actual {
        prompt.push_str(&format!("actual: {actual}\n"));
    }

    if let Some(feedback) = input.feedback {
        prompt.push_str(&format!("\n{}\n", feedback.heading()));
        if let Some(previous) = input.previous {
            prompt.push_str(&format!("previous plan: {}\n", previous.summary));
        }
        prompt.push_str(&truncate(feedback.text(), FEEDBACK_LIMIT));
        prompt.push('\n');
    }

    if !input.lessons.is_empty() {
        prompt.push_str("\nLESSONS FROM PAST FAILURES\n");
        for lesson in input.lessons {
            prompt.push_str(&format!(
                "- [{} / {}] {}\n",
                lesson.signature.stage, lesson.signature.kind, lesson.note.guidance
            ));
        }
    }

    prompt.push_str("\nCODE CONTEXT\n");
    if input.context.trim().is_empty() {
        prompt.push_str("(no files could be located; name the files you need to change)\n");
    } else {
        prompt.push_str(&truncate(input.context, CONTEXT_LIMIT));
        prompt.push('\n');
    }

    prompt.push_str(
        "\nAnswer with a single JSON object and nothing else:\n\
         {\"summary\": \"...\", \"complexity\": \"low|medium|high\", \
         \"files_affected\": [\"path\"], \
         \"edits\": [{\"file\": \"path\", \"description\": \"...\", \
         \"old_code\": \"exact existing text\", \"new_code\": \"replacement\"}]}\n\
         old_code must be copied exactly from the file and occur once; \
         use an empty old_code only to create a new file.\n",
    );
    prompt
}

/// Re-prompt after an unusable answer, quoting what was wrong
#[must_use]
pub fn corrective_prompt(original: &str, error: &PlanError) -> String {
    format!(
        "{original}\n\nYOUR PREVIOUS ANSWER WAS REJECTED: {error}.\n\
         Reply again with only the JSON object described above, with at least one edit."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixloop_kernel::{IssueId, SessionId};
    use fixloop_learning::{FailureSignature, LessonId, LessonNote};
    use pretty_assertions::assert_eq;

    const PLAN: &str = r#"{"summary":"raise limit","complexity":"low","files_affected":["app.py"],
        "edits":[{"file":"app.py","description":"bump","old_code":"limit = 10","new_code":"limit = 50"}]}"#;

    #[test]
    fn parses_bare_json() {
        let plan = parse_plan(PLAN).unwrap();
        assert_eq!(plan.summary, "raise limit");
        assert_eq!(plan.edits.len(), 1);
        assert_eq!(plan.files(), vec!["app.py".to_string()]);
    }

    #[test]
    fn parses_fenced_json_with_chatter() {
        let text = format!("Here is the plan:\n```json\n{PLAN}\n```\nLet me know!");
        assert_eq!(parse_plan(&text).unwrap().edits[0].new_code, "limit = 50");
    }

    #[test]
    fn trims_trailing_garbage() {
        let text = format!("{PLAN} and that's all }} folks");
        // The last brace belongs to the garbage, so this one is malformed...
        assert!(matches!(parse_plan(&text), Err(PlanError::Malformed(_))));
        // ...but plain trailing prose is dropped.
        let text = format!("{PLAN}\nHope this helps.");
        assert!(parse_plan(&text).is_ok());
    }

    #[test]
    fn empty_plan_is_rejected() {
        let err = parse_plan(r#"{"summary":"nothing to do","edits":[]}"#).unwrap_err();
        assert_eq!(err, PlanError::NoEdits);
        assert_eq!(parse_plan("I cannot help with that").unwrap_err(), PlanError::NoJson);
    }

    #[test]
    fn blank_file_is_rejected() {
        let err = parse_plan(r#"{"edits":[{"file":" ","old_code":"a","new_code":"b"}]}"#).unwrap_err();
        assert_eq!(err, PlanError::EmptyFile { index: 0 });
    }

    #[test]
    fn prompt_carries_lessons_and_truncated_feedback() {
        let issue = Issue::new("I9", "Search is slow", "app.py takes 10s", "teen");
        let lesson = Lesson {
            id: LessonId(0),
            signature: FailureSignature::new("TESTING", "worker_failure", "performance", vec![]),
            note: LessonNote {
                session: SessionId::new(),
                issue: IssueId::new("I1"),
                guidance: "Run the slow-query tests before editing".to_string(),
                actions: vec![],
            },
            recorded_at: chrono::Utc::now(),
            times_applied: 0,
            successes: 0,
            failures: 0,
        };
        let feedback = Feedback::TestFailure("x".repeat(FEEDBACK_LIMIT + 100));
        let prompt = strategy_prompt(StrategyInput {
            issue: &issue,
            context: "=== app.py ===\nlimit = 10\n",
            lessons: std::slice::from_ref(&lesson),
            feedback: Some(&feedback),
            previous: None,
        });
        assert!(prompt.contains("LESSONS FROM PAST FAILURES"));
        assert!(prompt.contains("Run the slow-query tests before editing"));
        assert!(prompt.contains("(100 characters omitted)"));
        assert!(prompt.contains("=== app.py ==="));
    }

    #[test]
    fn corrective_prompt_quotes_error() {
        let prompt = corrective_prompt("ORIGINAL", &PlanError::NoEdits);
        assert!(prompt.starts_with("ORIGINAL"));
        assert!(prompt.contains("plan contains no edits"));
    }
}
